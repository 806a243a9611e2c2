//! Query the state of a running daemon over its observation socket.

use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use ntpv4_daemon::observer::ObservableState;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Plain,
    Json,
}

#[derive(Parser, Debug)]
#[command(version, about = "Query the state of the NTPv4 daemon")]
struct CmdArgs {
    /// Path of the daemon's observation socket
    #[arg(
        short,
        long,
        env = "NTPV4_OBSERVE_SOCKET",
        default_value = "/run/ntpv4/observe"
    )]
    socket: PathBuf,

    #[arg(short, long, value_enum, default_value_t = Format::Plain)]
    format: Format,
}

async fn fetch_state(path: &Path) -> io::Result<ObservableState> {
    tracing::debug!(?path, "connecting to observation socket");
    let mut stream = UnixStream::connect(path).await?;

    let mut buf = String::new();
    stream.read_to_string(&mut buf).await?;

    serde_json::from_str(buf.trim()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn print_plain(state: &ObservableState) {
    let system = &state.system;
    println!(
        "stratum {}, {:?} ({:?}), poll 2^{} s",
        system.stratum, system.clock_state, system.leap, system.poll_interval
    );
    println!(
        "offset {:+.6} s, jitter {:.6} s, frequency {:+.3} ppm",
        system.offset.to_seconds(),
        system.jitter,
        system.frequency * 1e6,
    );
    println!(
        "root delay {:.6} s, root dispersion {:.6} s, {} survivors",
        system.root_delay.to_seconds(),
        system.root_dispersion.to_seconds(),
        system.survivors,
    );

    for peer in &state.peers {
        println!(
            "peer {} ({:?}): stratum {}, reach {:#010b}, offset {:+.6} s, delay {:.6} s",
            peer.address,
            peer.mode,
            peer.stratum,
            peer.reachability.as_bits(),
            peer.statistics.offset.to_seconds(),
            peer.statistics.delay.to_seconds(),
        );
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = CmdArgs::parse();

    let state = match fetch_state(&args.socket).await {
        Ok(state) => state,
        Err(error) => {
            eprintln!("could not read daemon state: {error}");
            std::process::exit(1);
        }
    };

    match args.format {
        Format::Plain => print_plain(&state),
        Format::Json => println!("{}", serde_json::to_string_pretty(&state).unwrap()),
    }
}
