#![no_main]
use chargeguard::vedirect::{FrameDecoder, block_checksum};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed in uneven chunks so state carries across calls
    let mut decoder = FrameDecoder::new(256);
    let split = data.first().map(|b| *b as usize % 17 + 1).unwrap_or(1);
    for chunk in data.chunks(split) {
        for frame in decoder.feed(chunk) {
            assert!(frame.is_valid());
            assert_eq!(block_checksum(frame.raw()), 0);
            let _ = frame.integer("V");
        }
    }
    assert!(decoder.buffered_len() <= 256);
});
