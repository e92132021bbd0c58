#![no_main]

use ed25519_dalek::VerifyingKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the trailer parser, and stripping
    // must never grow the input.
    let stripped = wasmgate_sovereign::strip(data);
    assert!(stripped.len() <= data.len());

    let key = VerifyingKey::from_bytes(&[0x11; 32]).ok();
    if let Some(key) = key {
        let _ = wasmgate_sovereign::verify(data, &[key]);
    }
});
