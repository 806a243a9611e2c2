#![no_main]
use libfuzzer_sys::fuzz_target;
use ntpv4_proto::NtpDuration;

fuzz_target!(|value: f64| {
    // neither construction nor conversion back may ever panic, even for
    // NaN and the infinities
    let duration = NtpDuration::from_seconds(value);
    let _ = duration.to_seconds();
});
