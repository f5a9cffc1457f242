#![no_main]

use libfuzzer_sys::fuzz_target;
use repomason::control::{depends_names, parse_control};

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Must never panic, whatever the stanza soup looks like.
        let control = parse_control(text);
        for dep in &control.build_depends {
            assert!(!dep.is_empty());
        }
        let _ = depends_names(text);
    }
});
