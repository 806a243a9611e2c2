use serde::{Deserialize, Serialize};

use crate::{NtpDuration, NtpTimestamp, ReferenceId};

/// The protocol version this implementation speaks. Packets with a version
/// number in the future are discarded on receipt.
pub const VERSION: u8 = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NtpLeapIndicator {
    NoWarning,
    Leap61,
    Leap59,
    Unknown,
}

impl NtpLeapIndicator {
    // This function should only ever be called with 2 bit values
    // (in the least significant position)
    fn from_bits(bits: u8) -> NtpLeapIndicator {
        match bits {
            0 => NtpLeapIndicator::NoWarning,
            1 => NtpLeapIndicator::Leap61,
            2 => NtpLeapIndicator::Leap59,
            3 => NtpLeapIndicator::Unknown,
            // This function should only ever be called from the packet parser
            // with just two bits, so this really should be unreachable
            _ => unreachable!(),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            NtpLeapIndicator::NoWarning => 0,
            NtpLeapIndicator::Leap61 => 1,
            NtpLeapIndicator::Leap59 => 2,
            NtpLeapIndicator::Unknown => 3,
        }
    }

    /// Leap 0x3 means the sender has never been synchronized
    pub fn is_synchronized(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NtpAssociationMode {
    Reserved,
    SymmetricActive,
    SymmetricPassive,
    Client,
    Server,
    Broadcast,
    Control,
    Private,
}

impl NtpAssociationMode {
    // This function should only ever be called with 3 bit values
    // (in the least significant position)
    fn from_bits(bits: u8) -> NtpAssociationMode {
        match bits {
            0 => NtpAssociationMode::Reserved,
            1 => NtpAssociationMode::SymmetricActive,
            2 => NtpAssociationMode::SymmetricPassive,
            3 => NtpAssociationMode::Client,
            4 => NtpAssociationMode::Server,
            5 => NtpAssociationMode::Broadcast,
            6 => NtpAssociationMode::Control,
            7 => NtpAssociationMode::Private,
            // This function should only ever be called from the packet parser
            // with just three bits, so this really should be unreachable
            _ => unreachable!(),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            NtpAssociationMode::Reserved => 0,
            NtpAssociationMode::SymmetricActive => 1,
            NtpAssociationMode::SymmetricPassive => 2,
            NtpAssociationMode::Client => 3,
            NtpAssociationMode::Server => 4,
            NtpAssociationMode::Broadcast => 5,
            NtpAssociationMode::Control => 6,
            NtpAssociationMode::Private => 7,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NtpHeader {
    pub leap: NtpLeapIndicator,
    pub(crate) version: u8,
    pub mode: NtpAssociationMode,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: NtpDuration,
    pub root_dispersion: NtpDuration,
    pub reference_id: ReferenceId,
    pub reference_timestamp: NtpTimestamp,
    pub origin_timestamp: NtpTimestamp,
    pub receive_timestamp: NtpTimestamp,
    pub transmit_timestamp: NtpTimestamp,
}

impl NtpHeader {
    /// A new, empty NtpHeader
    pub fn new() -> Self {
        Self {
            leap: NtpLeapIndicator::NoWarning,
            version: VERSION,
            mode: NtpAssociationMode::Client,
            stratum: 0,
            poll: 0,
            precision: 0,
            root_delay: NtpDuration::default(),
            root_dispersion: NtpDuration::default(),
            reference_id: ReferenceId::NONE,
            reference_timestamp: NtpTimestamp::default(),
            origin_timestamp: NtpTimestamp::default(),
            receive_timestamp: NtpTimestamp::default(),
            transmit_timestamp: NtpTimestamp::default(),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    fn deserialize(data: &[u8; 48]) -> NtpHeader {
        NtpHeader {
            leap: NtpLeapIndicator::from_bits((data[0] & 0xC0) >> 6),
            version: (data[0] & 0x38) >> 3,
            mode: NtpAssociationMode::from_bits(data[0] & 0x07),
            stratum: data[1],
            poll: data[2] as i8,
            precision: data[3] as i8,
            root_delay: NtpDuration::from_bits_short(data[4..8].try_into().unwrap()),
            root_dispersion: NtpDuration::from_bits_short(data[8..12].try_into().unwrap()),
            reference_id: ReferenceId::from_bits(data[12..16].try_into().unwrap()),
            reference_timestamp: NtpTimestamp::from_bits(data[16..24].try_into().unwrap()),
            origin_timestamp: NtpTimestamp::from_bits(data[24..32].try_into().unwrap()),
            receive_timestamp: NtpTimestamp::from_bits(data[32..40].try_into().unwrap()),
            transmit_timestamp: NtpTimestamp::from_bits(data[40..48].try_into().unwrap()),
        }
    }

    fn serialize(&self) -> [u8; 48] {
        // Version should only ever be set internally in this crate, so
        // violations of this should never happen.
        assert!(self.version < 8);

        let root_delay = self.root_delay.to_bits_short();
        let root_dispersion = self.root_dispersion.to_bits_short();
        let reference_id = self.reference_id.to_bits();
        let reference_timestamp = self.reference_timestamp.to_bits();
        let origin_timestamp = self.origin_timestamp.to_bits();
        let receive_timestamp = self.receive_timestamp.to_bits();
        let transmit_timestamp = self.transmit_timestamp.to_bits();

        let mut result = [0u8; 48];
        result[0] = (self.leap.to_bits() << 6) | ((self.version & 0x07) << 3) | self.mode.to_bits();
        result[1] = self.stratum;
        result[2] = self.poll as u8;
        result[3] = self.precision as u8;
        result[4..8].copy_from_slice(&root_delay);
        result[8..12].copy_from_slice(&root_dispersion);
        result[12..16].copy_from_slice(&reference_id);
        result[16..24].copy_from_slice(&reference_timestamp);
        result[24..32].copy_from_slice(&origin_timestamp);
        result[32..40].copy_from_slice(&receive_timestamp);
        result[40..48].copy_from_slice(&transmit_timestamp);
        result
    }
}

impl Default for NtpHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional message authentication code appended to the 48-byte header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NtpMac {
    /// A four-octet MAC consisting only of a key identifier with value zero.
    /// It tells the receiver that a prior request could not be properly
    /// authenticated, but the NTP header fields are correct.
    CryptoNak { keyid: u32 },
    /// Key identifier plus 128-bit MD5 digest
    Digest { keyid: u32, digest: [u8; 16] },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NtpPacket {
    pub header: NtpHeader,
    pub mac: Option<NtpMac>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketParsingError {
    IncorrectLength,
}

impl std::fmt::Display for PacketParsingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncorrectLength => write!(f, "packet has invalid length"),
        }
    }
}

impl std::error::Error for PacketParsingError {}

impl NtpPacket {
    pub const HEADER_LENGTH: usize = 48;

    pub fn header_only(header: NtpHeader) -> Self {
        Self { header, mac: None }
    }

    /// Parse a datagram into header and MAC. Valid lengths are 48 octets
    /// (no MAC), 52 octets (crypto-NAK) and 68 octets (key id followed by an
    /// MD5 digest). Extension fields are not supported.
    pub fn deserialize(data: &[u8]) -> Result<NtpPacket, PacketParsingError> {
        let header_bytes: &[u8; 48] = match data.get(0..48) {
            Some(bytes) => bytes.try_into().unwrap(),
            None => return Err(PacketParsingError::IncorrectLength),
        };
        let header = NtpHeader::deserialize(header_bytes);

        let mac = match data.len() - 48 {
            0 => None,
            4 => Some(NtpMac::CryptoNak {
                keyid: u32::from_be_bytes(data[48..52].try_into().unwrap()),
            }),
            20 => Some(NtpMac::Digest {
                keyid: u32::from_be_bytes(data[48..52].try_into().unwrap()),
                digest: data[52..68].try_into().unwrap(),
            }),
            _ => return Err(PacketParsingError::IncorrectLength),
        };

        Ok(NtpPacket { header, mac })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(68);
        buffer.extend_from_slice(&self.header.serialize());

        match self.mac {
            None => {}
            Some(NtpMac::CryptoNak { keyid }) => {
                buffer.extend_from_slice(&keyid.to_be_bytes());
            }
            Some(NtpMac::Digest { keyid, digest }) => {
                buffer.extend_from_slice(&keyid.to_be_bytes());
                buffer.extend_from_slice(&digest);
            }
        }

        buffer
    }

    /// The header bytes covered by the MAC digest
    pub(crate) fn digest_input(&self) -> [u8; 48] {
        self.header.serialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_bitrep_leap() {
        for i in 0..4u8 {
            let a = NtpLeapIndicator::from_bits(i);
            let b = a.to_bits();
            let c = NtpLeapIndicator::from_bits(b);
            assert_eq!(i, b);
            assert_eq!(a, c);
        }
    }

    #[test]
    fn roundtrip_bitrep_mode() {
        for i in 0..8u8 {
            let a = NtpAssociationMode::from_bits(i);
            let b = a.to_bits();
            let c = NtpAssociationMode::from_bits(b);
            assert_eq!(i, b);
            assert_eq!(a, c);
        }
    }

    #[test]
    fn test_captured_client() {
        let packet = b"\x23\x02\x06\xe8\x00\x00\x03\xff\x00\x00\x03\x7d\x5e\xc6\x9f\x0f\xe5\xf6\x62\x98\x7b\x61\xb9\xaf\xe5\xf6\x63\x66\x7b\x64\x99\x5d\xe5\xf6\x63\x66\x81\x40\x55\x90\xe5\xf6\x63\xa8\x76\x1d\xde\x48";
        let reference = NtpHeader {
            leap: NtpLeapIndicator::NoWarning,
            version: 4,
            mode: NtpAssociationMode::Client,
            stratum: 2,
            poll: 6,
            precision: -24,
            root_delay: NtpDuration::from_fixed_int(1023 << 16),
            root_dispersion: NtpDuration::from_fixed_int(893 << 16),
            reference_id: ReferenceId::from_int(0x5ec69f0f),
            reference_timestamp: NtpTimestamp::from_fixed_int(0xe5f662987b61b9af),
            origin_timestamp: NtpTimestamp::from_fixed_int(0xe5f663667b64995d),
            receive_timestamp: NtpTimestamp::from_fixed_int(0xe5f6636681405590),
            transmit_timestamp: NtpTimestamp::from_fixed_int(0xe5f663a8761dde48),
        };

        assert_eq!(reference, NtpHeader::deserialize(packet));
        assert_eq!(packet[..], reference.serialize()[..]);
    }

    #[test]
    fn test_captured_server() {
        let packet = b"\x24\x02\x06\xe9\x00\x00\x02\x36\x00\x00\x03\xb7\xc0\x35\x67\x6c\xe5\xf6\x61\xfd\x6f\x16\x5f\x03\xe5\xf6\x63\xa8\x76\x19\xef\x40\xe5\xf6\x63\xa8\x79\x8c\x65\x81\xe5\xf6\x63\xa8\x79\x8e\xae\x2b";
        let reference = NtpHeader {
            leap: NtpLeapIndicator::NoWarning,
            version: 4,
            mode: NtpAssociationMode::Server,
            stratum: 2,
            poll: 6,
            precision: -23,
            root_delay: NtpDuration::from_fixed_int(566 << 16),
            root_dispersion: NtpDuration::from_fixed_int(951 << 16),
            reference_id: ReferenceId::from_int(0xc035676c),
            reference_timestamp: NtpTimestamp::from_fixed_int(0xe5f661fd6f165f03),
            origin_timestamp: NtpTimestamp::from_fixed_int(0xe5f663a87619ef40),
            receive_timestamp: NtpTimestamp::from_fixed_int(0xe5f663a8798c6581),
            transmit_timestamp: NtpTimestamp::from_fixed_int(0xe5f663a8798eae2b),
        };

        assert_eq!(reference, NtpHeader::deserialize(packet));
        assert_eq!(packet[..], reference.serialize()[..])
    }

    #[test]
    fn test_abstract_roundtrip() {
        let packet: [u8; 48] = std::array::from_fn(|i| i as u8);
        let a = NtpHeader::deserialize(&packet);
        let b = a.serialize();
        let c = NtpHeader::deserialize(&b);
        assert_eq!(packet, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_packed_flags() {
        let base: [u8; 48] = std::array::from_fn(|i| i as u8);
        let base_structured = NtpHeader::deserialize(&base);

        for leap_type in 0..3 {
            for mode in 0..8 {
                for version in 0..8 {
                    let mut header = base_structured;
                    header.leap = NtpLeapIndicator::from_bits(leap_type);
                    header.mode = NtpAssociationMode::from_bits(mode);
                    header.version = version;

                    let data = header.serialize();
                    let copy = NtpHeader::deserialize(&data);
                    assert_eq!(header, copy);
                }
            }
        }

        for i in 0..=0xFF {
            let mut packet = base;
            packet[0] = i;
            let a = NtpHeader::deserialize(&packet);
            let b = a.serialize();
            assert_eq!(packet, b);
        }
    }

    #[test]
    fn deserialize_without_mac() {
        let data = [0u8; 48];
        let packet = NtpPacket::deserialize(&data).unwrap();
        assert!(packet.mac.is_none());
        assert_eq!(packet.serialize().len(), 48);
    }

    #[test]
    fn deserialize_crypto_nak() {
        let mut data = vec![0u8; 52];
        data[48..52].copy_from_slice(&0u32.to_be_bytes());
        let packet = NtpPacket::deserialize(&data).unwrap();
        assert_eq!(packet.mac, Some(NtpMac::CryptoNak { keyid: 0 }));
        assert_eq!(packet.serialize(), data);
    }

    #[test]
    fn deserialize_with_digest() {
        let mut data = vec![0u8; 68];
        data[48..52].copy_from_slice(&7u32.to_be_bytes());
        data[52..68].copy_from_slice(&[0xAB; 16]);
        let packet = NtpPacket::deserialize(&data).unwrap();
        assert_eq!(
            packet.mac,
            Some(NtpMac::Digest {
                keyid: 7,
                digest: [0xAB; 16]
            })
        );
        assert_eq!(packet.serialize(), data);
    }

    #[test]
    fn deserialize_rejects_bad_lengths() {
        for len in [0, 1, 47, 49, 51, 53, 67, 69, 80] {
            let data = vec![0u8; len];
            assert_eq!(
                NtpPacket::deserialize(&data),
                Err(PacketParsingError::IncorrectLength)
            );
        }
    }
}
