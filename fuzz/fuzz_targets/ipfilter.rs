#![no_main]
use std::net::{IpAddr, Ipv4Addr};

use libfuzzer_sys::fuzz_target;
use ntpv4_daemon::ipfilter::{AccessAction, AccessEntry, IpFilter, IpSubnet};

fuzz_target!(|parts: (Vec<([u8; 4], u8, bool)>, [u8; 4])| {
    let (entries, probe) = parts;

    let entries: Vec<AccessEntry> = entries
        .into_iter()
        .map(|(addr, prefix_len, allow)| AccessEntry {
            subnet: IpSubnet {
                addr: IpAddr::V4(Ipv4Addr::from(addr)),
                prefix_len: prefix_len % 33,
            },
            action: if allow {
                AccessAction::Allow
            } else {
                AccessAction::Deny
            },
        })
        .collect();

    let filter = IpFilter::new(&entries);
    let _ = filter.is_allowed(IpAddr::V4(Ipv4Addr::from(probe)));
});
