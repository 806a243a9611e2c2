use std::net::IpAddr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// A 32-bit code identifying a particular server or reference clock.
///
/// For IPv4 the reference ID is the address itself; for IPv6 it is the first
/// four octets of the MD5 hash of the address, per RFC5905. Stratum-1 servers
/// use a four-character ASCII clock identifier instead, which is why loop
/// detection must ignore the reference ID of stratum-1 sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceId(u32);

impl ReferenceId {
    pub const NONE: ReferenceId = ReferenceId(0);

    pub fn from_ip(addr: IpAddr) -> ReferenceId {
        match addr {
            IpAddr::V4(addr) => ReferenceId(u32::from_be_bytes(addr.octets())),
            IpAddr::V6(addr) => {
                let mut hasher = Md5::new();
                hasher.update(addr.octets());
                ReferenceId(u32::from_be_bytes(
                    hasher.finalize()[0..4].try_into().unwrap(),
                ))
            }
        }
    }

    pub const fn from_int(value: u32) -> ReferenceId {
        ReferenceId(value)
    }

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn to_bits(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub(crate) fn from_bits(bits: [u8; 4]) -> ReferenceId {
        ReferenceId(u32::from_be_bytes(bits))
    }
}
