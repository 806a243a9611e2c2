#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|parts: ([u8; 48], u64, i8)| {
    let (data, destination, precision) = parts;
    ntpv4_proto::fuzz::fuzz_tuple_from_packet(&data, destination, precision);
});
