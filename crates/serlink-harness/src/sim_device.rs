//! Simulated device firmware.
//!
//! Speaks the device side of the link: echoes handshake probes, acknowledges
//! the size announcement and each chunk by replying with the command's tag,
//! and records the uploaded file. Frames with any other tag are console
//! messages: the device records them and echoes them back.
//!
//! Faults are either scripted (ignore the first N probes, stop acknowledging
//! after chunk k) or random from a seeded RNG, so a failing run can be
//! replayed from its seed.

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serlink_core::CommandTags;
use serlink_proto::{ESCAPE, Frame, FrameCodec, START};

/// Faults the device injects into its replies.
#[derive(Debug, Clone, Default)]
pub struct DeviceFaults {
    /// Leave this many handshake probes unanswered
    pub ignore_probes: u64,
    /// Never acknowledge the size announcement
    pub ignore_size: bool,
    /// Acknowledge only this many chunks, then go silent
    pub stop_acking_after: Option<usize>,
    /// Flip a checksum bit in the acknowledgment of this chunk of the first
    /// upload
    pub corrupt_chunk_ack: Option<usize>,
    /// Probability that any reply is lost
    pub drop_rate: f64,
    /// Probability that line noise precedes a reply
    pub noise_rate: f64,
}

/// Device-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Frames decoded from the host
    pub frames_received: u64,
    /// Handshake probes seen
    pub probes: u64,
    /// Size announcements received
    pub uploads: u64,
    /// Chunks received
    pub chunks: u64,
    /// Console messages received
    pub messages: u64,
    /// Replies written to the line (corrupted ones included)
    pub replies: u64,
    /// Replies lost to a fault
    pub dropped: u64,
}

/// Device end of a simulated serial link.
#[derive(Debug)]
pub struct SimDevice {
    tags: CommandTags,
    faults: DeviceFaults,
    rng: ChaCha8Rng,
    decoder: FrameCodec,
    encoder: FrameCodec,
    announced: Option<u32>,
    file: Vec<u8>,
    chunks_in_upload: usize,
    messages: Vec<Frame>,
    output: Vec<u8>,
    stats: DeviceStats,
}

impl SimDevice {
    /// Well-behaved device.
    pub fn new(tags: CommandTags) -> Self {
        Self::with_faults(tags, DeviceFaults::default(), 0)
    }

    /// Device injecting `faults`, with randomness drawn from `seed`.
    pub fn with_faults(tags: CommandTags, faults: DeviceFaults, seed: u64) -> Self {
        Self {
            tags,
            faults,
            rng: ChaCha8Rng::seed_from_u64(seed),
            decoder: FrameCodec::new(),
            encoder: FrameCodec::new(),
            announced: None,
            file: Vec::new(),
            chunks_in_upload: 0,
            messages: Vec::new(),
            output: Vec::new(),
            stats: DeviceStats::default(),
        }
    }

    /// Feed bytes the host wrote.
    pub fn receive(&mut self, bytes: &[u8]) {
        for frame in self.decoder.push(bytes) {
            self.stats.frames_received += 1;
            self.handle(frame);
        }
    }

    /// Take bytes the device wrote since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// File length from the most recent size announcement.
    pub fn announced_size(&self) -> Option<u32> {
        self.announced
    }

    /// Bytes received since the most recent size announcement.
    pub fn file(&self) -> &[u8] {
        &self.file
    }

    /// Chunks received since the most recent size announcement.
    pub fn chunks_in_upload(&self) -> usize {
        self.chunks_in_upload
    }

    /// Console messages received, oldest first.
    pub fn messages(&self) -> &[Frame] {
        &self.messages
    }

    /// Device counters.
    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    /// Decoder for host frames, for link quality on the device side.
    pub fn decoder(&self) -> &FrameCodec {
        &self.decoder
    }

    fn handle(&mut self, frame: Frame) {
        let tag = frame.tag;
        if tag == self.tags.handshake {
            self.stats.probes += 1;
            if self.stats.probes <= self.faults.ignore_probes {
                tracing::trace!(probe = self.stats.probes, "device ignoring probe");
                return;
            }
            self.reply(tag, frame.payload, false);
        } else if tag == self.tags.write_file_size {
            let Ok(size) = <[u8; 4]>::try_from(&frame.payload[..]) else {
                tracing::trace!(len = frame.len(), "malformed size announcement");
                return;
            };
            self.stats.uploads += 1;
            self.announced = Some(u32::from_le_bytes(size));
            self.file.clear();
            self.chunks_in_upload = 0;
            if !self.faults.ignore_size {
                self.reply(tag, Bytes::new(), false);
            }
        } else if tag == self.tags.write_file {
            self.stats.chunks += 1;
            let index = self.chunks_in_upload;
            self.chunks_in_upload += 1;
            self.file.extend_from_slice(&frame.payload);

            if self.faults.stop_acking_after.is_some_and(|limit| index >= limit) {
                return;
            }
            let corrupt = self.stats.uploads == 1 && self.faults.corrupt_chunk_ack == Some(index);
            self.reply(tag, Bytes::new(), corrupt);
        } else {
            tracing::trace!(tag, len = frame.len(), "console message");
            self.stats.messages += 1;
            self.reply(tag, frame.payload.clone(), false);
            self.messages.push(frame);
        }
    }

    fn reply(&mut self, tag: u8, payload: Bytes, corrupt: bool) {
        if self.faults.drop_rate > 0.0 && self.rng.gen_bool(self.faults.drop_rate.min(1.0)) {
            self.stats.dropped += 1;
            return;
        }
        if self.faults.noise_rate > 0.0 && self.rng.gen_bool(self.faults.noise_rate.min(1.0)) {
            let len = self.rng.gen_range(1..=8);
            for _ in 0..len {
                self.output.push(self.rng.r#gen::<u8>());
            }
        }

        // Replies echo at most what the host sent, so they always fit
        let Ok(encoded) = self.encoder.encode(tag, &payload) else {
            return;
        };
        let mut encoded = encoded.to_vec();
        if corrupt {
            flip_checksum_bit(&mut encoded);
        }

        self.stats.replies += 1;
        self.output.extend_from_slice(&encoded);
    }
}

/// Flip the low bit of the last checksum byte, keeping the frame parseable.
fn flip_checksum_bit(frame: &mut [u8]) {
    let Some(last) = frame.last_mut() else {
        return;
    };
    // Stay clear of the markers so the frame still ends where it did
    let flipped = *last ^ 0x01;
    if flipped == START || flipped == ESCAPE {
        *last ^= 0x02;
    } else {
        *last = flipped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_frame(tag: u8, payload: &[u8]) -> Bytes {
        FrameCodec::new().encode(tag, payload).unwrap()
    }

    fn replies(device: &mut SimDevice) -> Vec<Frame> {
        FrameCodec::new().push(&device.take_output())
    }

    #[test]
    fn echoes_probe() {
        let mut device = SimDevice::new(CommandTags::default());
        device.receive(&host_frame(3, &[0xBE, 0xEF]));

        assert_eq!(replies(&mut device), vec![Frame::new(3, Bytes::from_static(&[0xBE, 0xEF]))]);
        assert_eq!(device.stats().probes, 1);
    }

    #[test]
    fn records_upload() {
        let mut device = SimDevice::new(CommandTags::default());
        device.receive(&host_frame(4, &5u32.to_le_bytes()));
        device.receive(&host_frame(1, b"hel"));
        device.receive(&host_frame(1, b"lo"));

        assert_eq!(device.announced_size(), Some(5));
        assert_eq!(device.file(), b"hello");
        let tags: Vec<u8> = replies(&mut device).iter().map(|frame| frame.tag).collect();
        assert_eq!(tags, vec![4, 1, 1]);
    }

    #[test]
    fn ignores_scripted_probes() {
        let faults = DeviceFaults { ignore_probes: 2, ..Default::default() };
        let mut device = SimDevice::with_faults(CommandTags::default(), faults, 1);

        device.receive(&host_frame(3, &[]));
        device.receive(&host_frame(3, &[]));
        assert!(replies(&mut device).is_empty());

        device.receive(&host_frame(3, &[]));
        assert_eq!(replies(&mut device).len(), 1);
    }

    #[test]
    fn corrupted_ack_is_rejected_by_decoder() {
        let faults = DeviceFaults { corrupt_chunk_ack: Some(0), ..Default::default() };
        let mut device = SimDevice::with_faults(CommandTags::default(), faults, 1);
        device.receive(&host_frame(4, &3u32.to_le_bytes()));
        device.receive(&host_frame(1, b"abc"));

        let mut decoder = FrameCodec::new();
        let frames = decoder.push(&device.take_output());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tag, 4);
        assert_eq!(decoder.stats().frames_dropped, 1);
    }

    #[test]
    fn echoes_console_messages() {
        let mut device = SimDevice::new(CommandTags::default());
        device.receive(&host_frame(9, b"status"));

        assert_eq!(replies(&mut device), vec![Frame::new(9, Bytes::from_static(b"status"))]);
        assert_eq!(device.messages(), &[Frame::new(9, Bytes::from_static(b"status"))]);
        assert_eq!(device.stats().messages, 1);
    }

    #[test]
    fn same_seed_same_faults() {
        let faults = DeviceFaults { drop_rate: 0.5, noise_rate: 0.5, ..Default::default() };
        let run = |seed| {
            let mut device = SimDevice::with_faults(CommandTags::default(), faults.clone(), seed);
            for _ in 0..32 {
                device.receive(&host_frame(3, &[0xBE, 0xEF]));
            }
            device.take_output()
        };

        assert_eq!(run(7), run(7));
    }
}
