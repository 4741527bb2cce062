//! Encode arbitrary payloads and decode them back through a noisy prefix.

#![no_main]
use libfuzzer_sys::fuzz_target;
use serlink_proto::{FrameCodec, MAX_FRAME_LEN, START};

fuzz_target!(|data: &[u8]| {
    let Some((&tag, rest)) = data.split_first() else {
        return;
    };
    let codec = FrameCodec::new();

    let Ok(wire) = codec.encode(tag, rest) else {
        assert!(rest.len() > MAX_FRAME_LEN);
        return;
    };

    // Only the leading marker may be an unescaped START
    assert_eq!(wire[0], START);
    assert!(!wire[1..].contains(&START));

    let mut decoder = FrameCodec::new();
    decoder.push(&rest[..rest.len().min(16)]);
    let frames = decoder.push(&wire);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].tag, tag);
    assert_eq!(&frames[0].payload[..], rest);
});
