//! Byte-at-a-time frame reassembly.
//!
//! The alternative to [`crate::ring_buffer::RingBuffer`] for consumers that see bytes one at
//! a time and have no random access to what came before.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::codec::{checksum, END_MARKER, START_MARKER};
use crate::error::FrameError;
use crate::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    WaitingForStart,
    ReadingRegister,
    ReadingStatus,
    ReadingLength,
    ReadingData,
    ReadingChecksum,
    PacketComplete,
}

/// What to do when the byte after the checksum is not the end marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResyncPolicy {
    /// Forget the frame and wait for the next start marker in new bytes.
    #[default]
    Drop,
    /// Replay the bytes that followed the false start marker, so a real start marker that
    /// was swallowed as frame content is found again.
    Rescan,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub packets: u64,
    pub bad_end_markers: u64,
    pub checksum_mismatches: u64,
    pub dropped_bytes: u64,
}

pub struct PacketStateMachine {
    state: State,
    policy: ResyncPolicy,
    /// Every byte of the frame in progress, start marker included
    raw: Vec<u8>,
    register: u8,
    status: u8,
    length: usize,
    data: Vec<u8>,
    checksum: [u8; 2],
    checksum_read: usize,
    pending: VecDeque<u8>,
    packets: VecDeque<Packet>,
    errors: Vec<FrameError>,
    stats: FrameStats,
}

impl PacketStateMachine {
    pub fn new() -> Self {
        Self::with_policy(ResyncPolicy::default())
    }

    pub fn with_policy(policy: ResyncPolicy) -> Self {
        Self {
            state: State::WaitingForStart,
            policy,
            raw: Vec::new(),
            register: 0,
            status: 0,
            length: 0,
            data: Vec::new(),
            checksum: [0; 2],
            checksum_read: 0,
            pending: VecDeque::new(),
            packets: VecDeque::new(),
            errors: Vec::new(),
            stats: FrameStats::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Feed a chunk of bytes in arrival order.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push_byte(b);
        }
    }

    pub fn push_byte(&mut self, byte: u8) {
        self.pending.push_back(byte);
        while let Some(b) = self.pending.pop_front() {
            self.step(b);
        }
    }

    /// Feed `bytes` and return what they completed, packets and frame errors together in
    /// the order their frames ended. Anything still queued from earlier calls comes first.
    pub fn feed_ordered(&mut self, bytes: &[u8]) -> Vec<Result<Packet, FrameError>> {
        let mut out: Vec<Result<Packet, FrameError>> = self.take_errors().into_iter().map(Err).collect();
        out.extend(self.drain_all().into_iter().map(Ok));

        for &byte in bytes {
            self.pending.push_back(byte);
            while let Some(b) = self.pending.pop_front() {
                // one step ends at most one frame
                self.step(b);
                out.extend(self.errors.drain(..).map(Err));
                out.extend(self.packets.drain(..).map(Ok));
            }
        }
        out
    }

    /// The oldest completed packet, if any.
    pub fn next_packet(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    pub fn drain_all(&mut self) -> Vec<Packet> {
        self.packets.drain(..).collect()
    }

    /// Frame errors seen since the last call.
    pub fn take_errors(&mut self) -> Vec<FrameError> {
        std::mem::take(&mut self.errors)
    }

    /// Abandon any partial frame.
    pub fn reset(&mut self) {
        self.state = State::WaitingForStart;
        self.raw.clear();
        self.data.clear();
        self.register = 0;
        self.status = 0;
        self.length = 0;
        self.checksum = [0; 2];
        self.checksum_read = 0;
    }

    fn step(&mut self, byte: u8) {
        if self.state != State::WaitingForStart {
            self.raw.push(byte);
        }

        match self.state {
            State::WaitingForStart => {
                if byte == START_MARKER {
                    self.reset();
                    self.raw.push(byte);
                    self.state = State::ReadingRegister;
                } else {
                    self.stats.dropped_bytes += 1;
                }
            }
            State::ReadingRegister => {
                self.register = byte;
                self.state = State::ReadingStatus;
            }
            State::ReadingStatus => {
                self.status = byte;
                self.state = State::ReadingLength;
            }
            State::ReadingLength => {
                self.length = byte as usize;
                self.data.reserve(self.length);
                self.state = if self.length > 0 {
                    State::ReadingData
                } else {
                    State::ReadingChecksum
                };
            }
            State::ReadingData => {
                self.data.push(byte);
                if self.data.len() == self.length {
                    self.state = State::ReadingChecksum;
                }
            }
            State::ReadingChecksum => {
                self.checksum[self.checksum_read] = byte;
                self.checksum_read += 1;
                if self.checksum_read == 2 {
                    self.state = State::PacketComplete;
                }
            }
            State::PacketComplete => {
                if byte == END_MARKER {
                    self.complete();
                } else {
                    self.bad_end(byte);
                }
            }
        }
    }

    fn complete(&mut self) {
        let mut body = Vec::with_capacity(self.length + 3);
        body.extend_from_slice(&[self.register, self.status, self.length as u8]);
        body.extend_from_slice(&self.data);
        let expected = checksum(&body);
        let received = u16::from_be_bytes(self.checksum);

        if expected == received {
            self.stats.packets += 1;
            self.packets.push_back(Packet {
                register: self.register,
                status: self.status,
                payload: std::mem::take(&mut self.data),
                checksum_valid: true,
                received_at: Instant::now(),
            });
        } else {
            log::warn!(
                "Checksum mismatch on register 0x{:02x}: expected 0x{expected:04x}, received 0x{received:04x}",
                self.register
            );
            self.stats.checksum_mismatches += 1;
            self.errors
                .push(FrameError::ChecksumMismatch { expected, received });
        }
        self.reset();
    }

    fn bad_end(&mut self, byte: u8) {
        self.stats.bad_end_markers += 1;
        self.errors.push(FrameError::BadEnd(byte));

        let replay = match self.policy {
            ResyncPolicy::Drop => Vec::new(),
            ResyncPolicy::Rescan => self.raw[1..].to_vec(),
        };
        log::warn!(
            "Bad end marker 0x{byte:02x} on register 0x{:02x}, replaying {} bytes",
            self.register,
            replay.len()
        );
        self.reset();
        for &b in replay.iter().rev() {
            self.pending.push_front(b);
        }
    }
}

impl Default for PacketStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(register: u8, status: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![register, status, payload.len() as u8];
        body.extend_from_slice(payload);
        let mut frame = vec![START_MARKER];
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&checksum(&body).to_be_bytes());
        frame.push(END_MARKER);
        frame
    }

    fn strip(packet: Packet) -> (u8, u8, Vec<u8>, bool) {
        (packet.register, packet.status, packet.payload, packet.checksum_valid)
    }

    #[test]
    fn test_single_frame() {
        let mut machine = PacketStateMachine::new();
        machine.feed(&hex::decode("dd030002012cffce77").unwrap());
        assert_eq!(machine.state(), State::WaitingForStart);
        let packet = machine.next_packet().unwrap();
        assert_eq!(strip(packet), (0x03, 0x00, vec![0x01, 0x2c], true));
        assert!(machine.next_packet().is_none());
    }

    #[test]
    fn test_state_transitions() {
        let mut machine = PacketStateMachine::new();
        let frame = frame(0x04, 0x00, &[0x0c]);
        let expected = [
            State::ReadingRegister,
            State::ReadingStatus,
            State::ReadingLength,
            State::ReadingData,
            State::ReadingChecksum,
            State::ReadingChecksum,
            State::PacketComplete,
            State::WaitingForStart,
        ];
        for (&b, &state) in frame.iter().zip(expected.iter()) {
            machine.push_byte(b);
            assert_eq!(machine.state(), state);
        }
    }

    #[test]
    fn test_empty_payload_goes_straight_to_checksum() {
        let mut machine = PacketStateMachine::new();
        machine.feed(&[START_MARKER, 0x05, 0x80, 0x00]);
        assert_eq!(machine.state(), State::ReadingChecksum);
        machine.feed(&[0xFF, 0x7B, END_MARKER]);
        let packet = machine.next_packet().unwrap();
        assert_eq!(strip(packet), (0x05, 0x80, vec![], true));
    }

    #[test]
    fn test_fragmentation_invariance() {
        let payload: Vec<u8> = (0u8..40).collect();
        let frame = frame(0x04, 0x00, &payload);

        let mut whole = PacketStateMachine::new();
        whole.feed(&frame);
        let expected = strip(whole.next_packet().unwrap());

        for chunk_size in 1..frame.len() {
            let mut machine = PacketStateMachine::new();
            for chunk in frame.chunks(chunk_size) {
                machine.feed(chunk);
            }
            assert_eq!(strip(machine.next_packet().unwrap()), expected, "chunk size {chunk_size}");
        }

        // uneven splits
        let splits = [3usize, 1, 7, 2, 11, 5];
        let mut machine = PacketStateMachine::new();
        let mut rest = &frame[..];
        for &n in splits.iter().cycle() {
            if rest.is_empty() {
                break;
            }
            let (head, tail) = rest.split_at(n.min(rest.len()));
            machine.feed(head);
            rest = tail;
        }
        assert_eq!(strip(machine.next_packet().unwrap()), expected);
    }

    #[test]
    fn test_junk_between_frames_is_dropped() {
        let mut bytes = vec![0x00, 0x11];
        bytes.extend(frame(0x03, 0x00, &[0x01]));
        bytes.extend([0x42, 0x43]);
        bytes.extend(frame(0x04, 0x00, &[0x02]));

        let mut machine = PacketStateMachine::new();
        machine.feed(&bytes);
        let packets: Vec<_> = machine.drain_all().into_iter().map(strip).collect();
        assert_eq!(
            packets,
            vec![(0x03, 0x00, vec![0x01], true), (0x04, 0x00, vec![0x02], true)]
        );
        assert_eq!(machine.stats().dropped_bytes, 4);
    }

    #[test]
    fn test_checksum_mismatch_is_not_queued() {
        let mut corrupt = frame(0x03, 0x00, &[0x01, 0x2c]);
        corrupt[5] ^= 0xff;

        let mut machine = PacketStateMachine::new();
        machine.feed(&corrupt);
        assert!(machine.next_packet().is_none());
        assert!(matches!(
            machine.take_errors()[..],
            [FrameError::ChecksumMismatch { .. }]
        ));
        assert_eq!(machine.stats().checksum_mismatches, 1);
    }

    #[test]
    fn test_bad_end_drop_loses_embedded_frame() {
        // A false start marker, then a real frame. The real frame's bytes are consumed as
        // the false frame's content.
        let real = frame(0x03, 0x00, &[0x01]);
        let mut bytes = vec![START_MARKER, 0x03, 0x00, 0x01];
        bytes.extend(&real);

        let mut machine = PacketStateMachine::with_policy(ResyncPolicy::Drop);
        machine.feed(&bytes);
        assert!(machine.next_packet().is_none());
        assert_eq!(machine.stats().bad_end_markers, 1);
        assert_eq!(machine.take_errors(), vec![FrameError::BadEnd(real[3])]);
    }

    #[test]
    fn test_bad_end_rescan_recovers_embedded_frame() {
        let real = frame(0x03, 0x00, &[0x01]);
        let mut bytes = vec![START_MARKER, 0x03, 0x00, 0x01];
        bytes.extend(&real);

        let mut machine = PacketStateMachine::with_policy(ResyncPolicy::Rescan);
        machine.feed(&bytes);
        let packet = machine.next_packet().unwrap();
        assert_eq!(strip(packet), (0x03, 0x00, vec![0x01], true));
        assert_eq!(machine.stats().bad_end_markers, 1);
    }

    #[test]
    fn test_feed_ordered_interleaves_packets_and_errors() {
        let good = frame(0x03, 0x00, &[0x01, 0x2c]);
        let mut corrupt = frame(0x04, 0x00, &[0x0c, 0xe4]);
        corrupt[5] ^= 0xff;

        let mut bytes = good.clone();
        bytes.extend(&corrupt);
        bytes.extend(&good);

        let mut machine = PacketStateMachine::new();
        let out = machine.feed_ordered(&bytes);
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Ok(p) if p.register == 0x03));
        assert!(matches!(&out[1], Err(FrameError::ChecksumMismatch { .. })));
        assert!(matches!(&out[2], Ok(p) if p.register == 0x03));
        assert!(machine.next_packet().is_none());
        assert!(machine.take_errors().is_empty());
    }
}
