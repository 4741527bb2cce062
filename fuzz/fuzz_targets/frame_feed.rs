//! Feed arbitrary line bytes to the decoder.
//!
//! The decoder must never panic, never hand out a payload above its limit,
//! and every frame it accepts must re-encode and decode to itself.

#![no_main]
use libfuzzer_sys::fuzz_target;
use serlink_proto::{DecodeState, FrameCodec};

fuzz_target!(|data: &[u8]| {
    // First byte picks the payload limit so small limits get coverage too
    let Some((&limit, line)) = data.split_first() else {
        return;
    };
    let mut codec = FrameCodec::with_max_payload(usize::from(limit) * 2 + 1);

    for frame in codec.push(line) {
        assert!(frame.len() <= codec.max_payload());

        let wire = codec.encode(frame.tag, &frame.payload).unwrap();
        let mut check = FrameCodec::with_max_payload(codec.max_payload());
        let decoded = check.push(&wire);
        assert_eq!(decoded, vec![frame]);
        assert_eq!(check.state(), DecodeState::Idle);
    }

    codec.reset();
    assert_eq!(codec.state(), DecodeState::Idle);
});
