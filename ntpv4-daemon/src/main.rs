use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use ntpv4_daemon::config::{init_tracing, Config, LogFormat};

#[derive(Parser, Debug)]
#[command(version, about = "NTPv4 time synchronization daemon")]
struct CmdArgs {
    /// Path of the configuration file
    #[arg(
        short,
        long,
        env = "NTPV4_CONFIG",
        default_value = "/etc/ntpv4/ntpv4.toml"
    )]
    config: PathBuf,

    /// Override the log filter from the configuration, e.g. "debug" or
    /// "ntpv4_proto=trace"
    #[arg(short, long, env = "NTPV4_LOG_FILTER")]
    log_filter: Option<String>,

    /// Override the log format from the configuration
    #[arg(long, env = "NTPV4_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() {
    let args = CmdArgs::parse();

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("could not load configuration: {error}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    let filter = args
        .log_filter
        .clone()
        .or_else(|| config.log_filter.clone())
        .unwrap_or_else(|| String::from("info"));
    let format = args.log_format.unwrap_or(config.log_format);

    if let Err(error) = init_tracing(&filter, format) {
        eprintln!("invalid log filter '{filter}': {error}");
        std::process::exit(exitcode::CONFIG);
    }

    if let Err(error) = ntpv4_daemon::run(config).await {
        error!(%error, "daemon terminated");
        std::process::exit(exitcode::SOFTWARE);
    }
}
