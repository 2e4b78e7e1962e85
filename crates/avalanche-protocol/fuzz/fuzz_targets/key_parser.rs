#![no_main]

use avalanche_protocol::{Command, Key, PutSubCommand, Reply};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Key text parsing must never panic, and whatever parses must format back
    // to the same key.
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(key) = Key::from_hex(text) {
            assert!(key.is_valid());
            assert_eq!(Key::from_hex(&key.to_hex()), Ok(key));
        }
    }

    if let Some(&byte) = data.first() {
        let _ = Command::from_u8(byte);
        let _ = PutSubCommand::from_u8(byte);
        let _ = Reply::from_u8(byte);
    }
});
