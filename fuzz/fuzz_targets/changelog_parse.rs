#![no_main]

use libfuzzer_sys::fuzz_target;
use repomason::control::{parse_top_entry, upstream_version};

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Errors are fine; panics are not.
        if let Ok(entry) = parse_top_entry(text) {
            let _ = upstream_version(&entry.version);
        }
    }
});
