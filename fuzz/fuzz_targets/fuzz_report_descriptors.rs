//! Fuzz target for descriptor documents.
//!
//! Tests that descriptor parsing and trigger block validation handle
//! arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use st_config::parse_descriptors;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(descriptors) = parse_descriptors(text, None) {
        for d in &descriptors {
            let _ = d.triggers.validate();
            let _ = d.display_name();
        }
    }
});
