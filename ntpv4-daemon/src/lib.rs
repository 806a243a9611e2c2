//! The NTPv4 daemon: configuration, access control, observability and the
//! run loop tying the protocol core to the kernel clock and the network.

pub mod config;
mod daemon;
pub mod ipfilter;
pub mod observer;

pub use daemon::{run, DaemonError};
