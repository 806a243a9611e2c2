//! This crate contains the NTPv4 protocol state machines: packet parsing,
//! timestamp arithmetic, the per-association protocol validation pipeline,
//! the clock filter, server selection, and the local clock discipline. It
//! does no I/O of its own; the kernel clock and the network are injected by
//! the caller.
//!
//! It is not intended as a public interface and may change drastically
//! between releases.

#![forbid(unsafe_code)]

mod auth;
mod clock;
mod clock_select;
mod config;
mod filter;
mod identifiers;
mod packet;
mod peer;
mod receive;
mod system;
mod time_types;

pub use auth::{AuthResult, KeyStore};
pub use clock::{ClockDiscipline, ClockState, NtpClock};
pub use config::SystemConfig;
pub use identifiers::ReferenceId;
pub use packet::{
    NtpAssociationMode, NtpHeader, NtpLeapIndicator, NtpMac, NtpPacket, PacketParsingError, VERSION,
};
pub use peer::{
    AcceptSynchronizationError, ClearReason, HostMode, Peer, PeerFlags, PeerSnapshot,
    PeerStatistics, Reach,
};
pub use receive::ReceivedPacket;
pub use system::{NtpCore, OutgoingPacket, PeerHandle, SystemSnapshot};
pub use time_types::{NtpDuration, NtpInstant, NtpTimestamp, PollInterval, JAN_1970};

#[cfg(feature = "fuzz")]
pub mod fuzz {
    //! Entry points for the fuzz harness; never part of the regular API
    pub use crate::clock_select::fuzz_find_interval;
    pub use crate::filter::fuzz_tuple_from_packet;
}
