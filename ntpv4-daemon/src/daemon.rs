//! The run loop: one socket, a one-hertz timer and the protocol core,
//! serialized behind a single mutex.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ntpv4_os_clock::{ClockError, UnixClock};
use ntpv4_proto::{KeyStore, NtpClock, NtpCore, ReceivedPacket};
use ntpv4_udp::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{parse_keys_file, Config, ConfigError};
use crate::ipfilter::IpFilter;
use crate::observer;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("system clock: {0}")]
    Clock(#[from] ClockError),
    #[error("network: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

pub async fn run(config: Config) -> Result<(), DaemonError> {
    let clock = UnixClock;

    // Fail early when we may not discipline the clock at all; there is no
    // point in running the protocol if the verdicts cannot be applied.
    clock.check_permissions()?;
    let precision = clock.measure_precision()?;
    info!(precision, "measured system clock precision");

    let mut keys = KeyStore::new();
    if let Some(path) = &config.keys {
        let contents = std::fs::read_to_string(path)?;
        for (keyid, secret) in parse_keys_file(&contents)? {
            let trusted = config.trusted_keys.contains(&keyid);
            keys.insert(keyid, secret, trusted);
        }
    }

    let frequency = config
        .frequency_file
        .as_deref()
        .and_then(read_frequency_file);

    let mut core = match frequency {
        Some(frequency) => {
            info!(frequency, "initialized from frequency file");
            NtpCore::with_frequency(clock, config.system, keys, precision, frequency)
        }
        None => NtpCore::new(clock, config.system, keys, precision),
    };

    for peer in &config.peers {
        if core
            .mobilize(
                peer.addr,
                config.listen_addr,
                peer.version,
                peer.mode,
                peer.keyid,
                peer.flags,
            )
            .is_none()
        {
            warn!(addr = ?peer.addr, "could not mobilize configured peer");
        }
    }

    let socket = UdpSocket::server(config.listen_addr).await?;
    info!(addr = ?config.listen_addr, "listening");

    let filter = IpFilter::new(&config.access);
    let core = Arc::new(Mutex::new(core));

    if let Some(path) = config.observe.path.clone() {
        tokio::spawn(observer::observer_task(path, Arc::clone(&core)));
    }

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately; consume it so process time stays
    // aligned with wall seconds
    interval.tick().await;

    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut core = core.lock().await;

                let transmits = core.clock_adjust()?;
                for outgoing in transmits {
                    if let Err(error) = socket
                        .send_to(&outgoing.packet.serialize(), outgoing.destination)
                        .await
                    {
                        warn!(?error, destination = ?outgoing.destination, "poll transmit failed");
                    }
                }

                if core.should_write_frequency() {
                    if let Some(path) = &config.frequency_file {
                        write_frequency_file(path, core.frequency());
                    }
                }
            }

            result = socket.recv_from(&mut buf) => {
                let (size, source, timestamp) = match result {
                    Ok(received) => received,
                    Err(error) => {
                        warn!(?error, "could not receive packet");
                        continue;
                    }
                };

                if !filter.is_allowed(source.ip()) {
                    debug!(?source, "access denied");
                    continue;
                }

                // fall back to a (late) userspace timestamp should the
                // kernel not have captured one
                let destination_timestamp = match timestamp {
                    Some(timestamp) => timestamp,
                    None => clock.now()?,
                };

                let received = ReceivedPacket {
                    data: &buf[..size],
                    source_address: source,
                    destination_address: config.listen_addr,
                    multicast: false,
                    destination_timestamp,
                };

                let reply = core.lock().await.handle_receive(&received)?;
                if let Some(outgoing) = reply {
                    if let Err(error) = socket
                        .send_to(&outgoing.packet.serialize(), outgoing.destination)
                        .await
                    {
                        warn!(?error, destination = ?outgoing.destination, "reply transmit failed");
                    }
                }
            }
        }
    }
}

fn read_frequency_file(path: &Path) -> Option<f64> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

fn write_frequency_file(path: &Path, frequency: f64) {
    // losing one update is harmless; the next comes in an hour
    if let Err(error) = std::fs::write(path, format!("{frequency:.9}\n")) {
        warn!(?error, ?path, "could not write frequency file");
    }
}
