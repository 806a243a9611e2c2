#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|spec: Vec<(i64, u64)>| {
    ntpv4_proto::fuzz::fuzz_find_interval(&spec);
});
