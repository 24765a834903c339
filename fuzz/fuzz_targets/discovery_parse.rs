//! Level 0 Discovery parsing of arbitrary blobs.
//!
//! Parsing either fails cleanly or yields a record whose bounded lists
//! respect their caps.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tcg_proto::{
    DiscoveredCapabilities,
    discovery::{MAX_CIPHER_SUITES, MAX_COM_IDS, MAX_LOGICAL_PORTS, MAX_SECURE_MESSAGING_SPS},
};

fuzz_target!(|data: &[u8]| {
    let Ok(caps) = DiscoveredCapabilities::parse(data) else {
        return;
    };

    assert!(caps.com_ids.len() <= MAX_COM_IDS);
    if let Some(ports) = &caps.logical_ports {
        assert!(ports.len() <= MAX_LOGICAL_PORTS);
    }
    if let Some(messaging) = &caps.secure_messaging {
        assert!(messaging.sps.len() <= MAX_SECURE_MESSAGING_SPS);
        assert!(messaging.cipher_suites.len() <= MAX_CIPHER_SUITES);
    }

    let _ = caps.ssc();
    let _ = caps.extended_com_id();
});
