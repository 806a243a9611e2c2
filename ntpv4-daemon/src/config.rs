use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ntpv4_proto::{HostMode, PeerFlags, SystemConfig};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file syntax error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("keys file line {0} is malformed")]
    MalformedKey(usize),
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:123".parse().unwrap()
}

fn default_version() -> u8 {
    ntpv4_proto::VERSION
}

/// One upstream peer to mobilize at startup
// no deny_unknown_fields here: the flag set is flattened in
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerConfig {
    pub addr: SocketAddr,
    #[serde(default = "default_peer_mode")]
    pub mode: HostMode,
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default)]
    pub keyid: u32,
    #[serde(flatten)]
    pub flags: PeerFlags,
}

fn default_peer_mode() -> HostMode {
    HostMode::Client
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ObserveConfig {
    /// Path of the unix socket on which state snapshots are served
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default = "default_listen")]
    #[serde(alias = "listen")]
    pub listen_addr: SocketAddr,

    /// Ordered access list evaluated before any packet reaches the
    /// protocol; first match wins, default is allow
    #[serde(default)]
    pub access: Vec<crate::ipfilter::AccessEntry>,

    #[serde(default)]
    pub observe: ObserveConfig,

    /// Path of an ntp.keys style file ("<keyid> MD5 <secret>" per line)
    pub keys: Option<PathBuf>,

    /// Key ids from the keys file that may authenticate packets
    #[serde(default)]
    pub trusted_keys: Vec<u32>,

    /// Where the frequency estimate is persisted across restarts
    pub frequency_file: Option<PathBuf>,

    pub log_filter: Option<String>,

    #[serde(default)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config = toml::de::from_str(&contents)?;
        info!(path = ?path.as_ref(), "loaded configuration");
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(LogFormat::Full),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("unknown log format: {s}")),
        }
    }
}

/// Install the global tracing subscriber with the configured filter and
/// output format
pub fn init_tracing(
    filter: &str,
    format: LogFormat,
) -> Result<(), tracing_subscriber::filter::ParseError> {
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::try_new(filter)?);

    match format {
        LogFormat::Full => builder.init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

/// Parse an ntp.keys style file into (keyid, secret) pairs. A secret of 32
/// hex digits is decoded to its 16 raw bytes; anything else is used as the
/// literal ASCII key.
pub fn parse_keys_file(contents: &str) -> Result<Vec<(u32, Vec<u8>)>, ConfigError> {
    let mut keys = vec![];

    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (keyid, key_type, secret) = match (fields.next(), fields.next(), fields.next()) {
            (Some(keyid), Some(key_type), Some(secret)) => (keyid, key_type, secret),
            _ => return Err(ConfigError::MalformedKey(number + 1)),
        };

        if !key_type.eq_ignore_ascii_case("md5") {
            return Err(ConfigError::MalformedKey(number + 1));
        }

        let keyid: u32 = keyid
            .parse()
            .map_err(|_| ConfigError::MalformedKey(number + 1))?;

        let secret = match decode_hex(secret) {
            Some(bytes) if secret.len() == 32 => bytes,
            _ => secret.as_bytes().to_vec(),
        };

        keys.push((keyid, secret));
    }

    Ok(keys)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }

    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
