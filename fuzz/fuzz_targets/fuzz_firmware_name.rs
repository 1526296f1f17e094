#![no_main]

use libfuzzer_sys::fuzz_target;

use regfgc3_pm::firmware::FirmwareName;

fuzz_target!(|data: &[u8]| {
    if let Ok(file_name) = std::str::from_utf8(data) {
        if let Ok(name) = FirmwareName::parse(file_name) {
            // The captured CRC token is always 4 hex-ish characters; parsing
            // it must never panic.
            let _ = name.crc16();
        }
    }
});
