#![no_main]

use libfuzzer_sys::fuzz_target;

use regfgc3_pm::slot_info::{parse_slot_info, render_slot_info};

fuzz_target!(|data: &[u8]| {
    if let Ok(reply) = std::str::from_utf8(data) {
        if let Ok(inventory) = parse_slot_info(reply) {
            // Whatever parses must survive the round trip.
            let rendered = render_slot_info(&inventory);
            let reparsed = parse_slot_info(&rendered).expect("rendered inventory must parse");
            assert_eq!(inventory, reparsed);
        }
    }
});
