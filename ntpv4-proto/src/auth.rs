use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::packet::{NtpMac, NtpPacket};

/// Outcome of classifying the authentication state of a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// The packet has no MAC; authentication was not attempted
    None,
    /// The packet has a MAC and the digest verifies
    Ok,
    /// The packet has a MAC and the digest does not verify
    Error,
    /// Crypto-NAK: the MAC consists of four octets only
    CryptoNak,
}

impl AuthResult {
    /// The AUTH(x, y) filter from RFC5905: when authentication is required
    /// only Ok passes; otherwise both Ok and None pass. Error and CryptoNak
    /// never pass a non-trivial gate.
    pub(crate) fn acceptable(self, required: bool) -> bool {
        if required {
            matches!(self, AuthResult::Ok)
        } else {
            matches!(self, AuthResult::Ok | AuthResult::None)
        }
    }
}

/// Local cache of symmetric MD5 keys, indexed by the 32-bit key identifier
/// carried in the packet MAC. Keys not marked trusted can neither
/// authenticate received packets nor sign transmissions.
#[derive(Debug, Default, Clone)]
pub struct KeyStore {
    keys: HashMap<u32, MessageKey>,
}

#[derive(Debug, Clone)]
struct MessageKey {
    secret: Vec<u8>,
    trusted: bool,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keyid: u32, secret: Vec<u8>, trusted: bool) {
        self.keys.insert(keyid, MessageKey { secret, trusted });
    }

    /// Compute the MAC digest for the given header bytes: the MD5 hash of
    /// the key followed by the header, per RFC5905. Returns None when the
    /// key is unknown or untrusted.
    pub(crate) fn digest(&self, keyid: u32, header: &[u8; 48]) -> Option<[u8; 16]> {
        let key = self.keys.get(&keyid)?;
        if !key.trusted {
            return None;
        }

        let mut hasher = Md5::new();
        hasher.update(&key.secret);
        hasher.update(header);
        Some(hasher.finalize().into())
    }

    /// Classify a received packet into one of the four authentication
    /// outcomes.
    pub(crate) fn classify(&self, packet: &NtpPacket) -> AuthResult {
        match packet.mac {
            None => AuthResult::None,
            Some(NtpMac::CryptoNak { .. }) => AuthResult::CryptoNak,
            Some(NtpMac::Digest { keyid, digest }) => {
                match self.digest(keyid, &packet.digest_input()) {
                    Some(expected) if expected == digest => AuthResult::Ok,
                    _ => AuthResult::Error,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NtpHeader;

    fn test_store() -> KeyStore {
        let mut store = KeyStore::new();
        store.insert(1, b"cheese".to_vec(), true);
        store.insert(2, b"mouse".to_vec(), false);
        store
    }

    fn signed_packet(store: &KeyStore, keyid: u32) -> NtpPacket {
        let mut packet = NtpPacket::header_only(NtpHeader::new());
        let digest = store.digest(keyid, &packet.digest_input()).unwrap();
        packet.mac = Some(NtpMac::Digest { keyid, digest });
        packet
    }

    #[test]
    fn classify_no_mac() {
        let packet = NtpPacket::header_only(NtpHeader::new());
        assert_eq!(test_store().classify(&packet), AuthResult::None);
    }

    #[test]
    fn classify_crypto_nak() {
        let mut packet = NtpPacket::header_only(NtpHeader::new());
        packet.mac = Some(NtpMac::CryptoNak { keyid: 0 });
        assert_eq!(test_store().classify(&packet), AuthResult::CryptoNak);
    }

    #[test]
    fn classify_valid_digest() {
        let store = test_store();
        let packet = signed_packet(&store, 1);
        assert_eq!(store.classify(&packet), AuthResult::Ok);
    }

    #[test]
    fn classify_tampered_digest() {
        let store = test_store();
        let mut packet = signed_packet(&store, 1);
        // flip a header bit after signing
        packet.header.stratum = 3;
        assert_eq!(store.classify(&packet), AuthResult::Error);
    }

    #[test]
    fn classify_unknown_key() {
        let store = test_store();
        let packet = NtpPacket {
            header: NtpHeader::new(),
            mac: Some(NtpMac::Digest {
                keyid: 99,
                digest: [0; 16],
            }),
        };
        assert_eq!(store.classify(&packet), AuthResult::Error);
    }

    #[test]
    fn untrusted_key_never_signs() {
        let store = test_store();
        assert!(store.digest(2, &[0; 48]).is_none());
    }

    #[test]
    fn auth_gate() {
        // with authentication required, only Ok passes
        assert!(AuthResult::Ok.acceptable(true));
        assert!(!AuthResult::None.acceptable(true));
        assert!(!AuthResult::Error.acceptable(true));
        assert!(!AuthResult::CryptoNak.acceptable(true));

        // without, None is also fine, but failures still reject
        assert!(AuthResult::Ok.acceptable(false));
        assert!(AuthResult::None.acceptable(false));
        assert!(!AuthResult::Error.acceptable(false));
        assert!(!AuthResult::CryptoNak.acceptable(false));
    }
}
