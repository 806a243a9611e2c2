#![no_main]
use libfuzzer_sys::fuzz_target;
use ntpv4_proto::NtpPacket;

fuzz_target!(|data: Vec<u8>| {
    if let Ok(packet) = NtpPacket::deserialize(&data) {
        // every datagram that parses must reserialize to the same bytes
        assert_eq!(packet.serialize(), data);
    }
});
