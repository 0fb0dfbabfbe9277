use chargeguard::vedirect::{FrameDecoder, encode_block};

fn bmv_block(mv: &str) -> Vec<u8> {
    encode_block(&[
        ("PID", "0xA389"),
        ("V", mv),
        ("VS", "13045"),
        ("I", "-3521"),
        ("P", "-86"),
        ("CE", "-41300"),
        ("SOC", "823"),
        ("TTG", "1254"),
        ("Alarm", "OFF"),
        ("Relay", "OFF"),
        ("AR", "0"),
        ("BMV", "712 Smart"),
        ("FW", "0413"),
    ])
}

#[test]
fn live_stream_with_async_hex_messages() {
    let mut stream = Vec::new();
    // Tail of a block the reader joined halfway through
    stream.extend_from_slice(b"8\r\nChecksum\t\x11");
    stream.extend(bmv_block("24512"));
    stream.extend_from_slice(b":A0102000543\n");
    stream.extend(bmv_block("24530"));
    stream.extend(bmv_block("24547"));

    let mut decoder = FrameDecoder::default();
    let mut volts = Vec::new();
    for chunk in stream.chunks(7) {
        for frame in decoder.feed(chunk) {
            volts.push(frame.integer("V").unwrap());
            assert_eq!(frame.get("BMV"), Some("712 Smart"));
        }
    }

    assert_eq!(volts, vec![24512, 24530, 24547]);
    let stats = decoder.stats();
    assert_eq!(stats.frames_accepted, 3);
    assert_eq!(stats.hex_records, 1);
}

#[test]
fn garbage_between_blocks_is_bounded() {
    let mut decoder = FrameDecoder::new(256);
    let noise = vec![b'x'; 1000];
    assert_eq!(decoder.feed(&noise).count(), 0);
    assert!(decoder.buffered_len() <= 256);
    assert!(decoder.stats().oversized > 0);

    // The first block is swallowed by the noise run; the next one must decode
    let mut stream = bmv_block("24100");
    stream.extend(bmv_block("24200"));
    let volts: Vec<_> = decoder
        .feed(&stream)
        .filter_map(|f| f.integer("V"))
        .collect();
    assert_eq!(volts, vec![24200]);
    assert!(decoder.buffered_len() <= 256);
}
