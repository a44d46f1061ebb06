//! Fuzz target for report definition documents.

#![no_main]

use libfuzzer_sys::fuzz_target;
use st_config::ReportDefinition;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(def) = ReportDefinition::from_yaml_str(text) {
            let _ = def.stat_count();
        }
    }
});
