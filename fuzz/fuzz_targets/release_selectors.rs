#![no_main]

use libfuzzer_sys::fuzz_target;
use repomason::release::resolve_selectors;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let mut parts = text.splitn(2, '\n');
        let distro = parts.next().unwrap_or_default();
        let selectors: Vec<String> = parts
            .next()
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect();
        let _ = resolve_selectors(distro, &selectors);
    }
});
