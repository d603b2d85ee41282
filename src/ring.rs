// Message-aligned view over the JACK ring buffer. One writer thread, one
// reader thread; a full queue drops the message and counts it instead of
// blocking, which keeps both the edit thread and the process callback safe.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::midi::MidiMessage;

/// Last frame time published by the process callback. Single writer (the
/// audio thread); the edit thread reads it to stamp outgoing messages.
#[derive(Debug, Default)]
pub struct FrameClock(AtomicU32);

impl FrameClock {
    pub fn store(&self, frames: jack::Frames) {
        self.0.store(frames, Ordering::Relaxed);
    }

    pub fn now(&self) -> jack::Frames {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct MsgWriter {
    writer: jack::RingBufferWriter,
    overruns: u64,
}

pub struct MsgReader {
    reader: jack::RingBufferReader,
}

/// Creates a locked ring holding at least `capacity` messages.
pub fn message_ring(capacity: usize) -> Result<(MsgReader, MsgWriter), jack::Error> {
    // the ring keeps one byte unused, so ask for one message more
    let mut ring = jack::RingBuffer::new((capacity + 1) * MidiMessage::WIRE_SIZE)?;
    ring.mlock();
    let (reader, writer) = ring.into_reader_writer();
    Ok((MsgReader { reader }, MsgWriter { writer, overruns: 0 }))
}

impl MsgWriter {
    /// Writes a whole message or nothing. Returns false when the queue was
    /// full and the message was dropped.
    pub fn push(&mut self, msg: &MidiMessage) -> bool {
        let wire = msg.to_wire();
        if self.writer.space() < wire.len() {
            self.overruns += 1;
            return false;
        }
        self.writer.write_buffer(&wire);
        true
    }

    /// Messages that fit right now.
    pub fn capacity(&mut self) -> usize {
        self.writer.space() / MidiMessage::WIRE_SIZE
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

impl MsgReader {
    pub fn peek(&mut self) -> Option<MidiMessage> {
        let mut buf = [0u8; MidiMessage::WIRE_SIZE];
        if self.reader.space() < buf.len() {
            return None;
        }
        if self.reader.peek(&mut buf) < buf.len() {
            return None;
        }
        Some(MidiMessage::from_wire(&buf))
    }

    pub fn advance(&mut self) {
        self.reader.advance(MidiMessage::WIRE_SIZE);
    }

    pub fn pop(&mut self) -> Option<MidiMessage> {
        let msg = self.peek()?;
        self.advance();
        Some(msg)
    }
}

/// Feeds every queued message due inside `[last, last + nframes)` to the
/// sink at its window-relative offset. Late messages clamp to offset 0;
/// the first message belonging to a later window stops the drain. Returns
/// the number of messages the sink rejected.
pub fn drain_due<S>(
    reader: &mut MsgReader,
    last: jack::Frames,
    nframes: jack::Frames,
    mut sink: S,
) -> u64
where
    S: FnMut(jack::Frames, &[u8]) -> bool,
{
    let mut rejected = 0;
    while let Some(msg) = reader.peek() {
        // wrapping difference so a frame counter rollover stays ordered
        let t = msg.time.wrapping_sub(last) as i32;
        if t >= nframes as i32 {
            break;
        }
        reader.advance();
        let offset = t.max(0) as jack::Frames;
        if !sink(offset, msg.bytes()) {
            rejected += 1;
        }
    }
    rejected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_and_counts() {
        let (mut reader, mut writer) = message_ring(8).unwrap();
        let capacity = writer.capacity();
        assert!(capacity >= 8);
        for i in 0..capacity {
            assert!(writer.push(&MidiMessage::note_on(0, i as u8 & 0x7F, 100)));
        }
        // one past the end is dropped, the queue stays consistent
        assert!(!writer.push(&MidiMessage::note_on(0, 1, 100)));
        assert_eq!(writer.overruns(), 1);
        for i in 0..capacity {
            let msg = reader.pop().expect("queued message");
            assert_eq!(msg.bytes()[1], i as u8 & 0x7F);
        }
        assert_eq!(reader.pop(), None);
        // space is back
        assert!(writer.push(&MidiMessage::note_off(0, 2)));
        assert_eq!(writer.overruns(), 1);
    }

    #[test]
    fn reads_are_message_aligned() {
        let (mut reader, mut writer) = message_ring(4).unwrap();
        let a = MidiMessage::note_on(1, 60, 90).at(7);
        let b = MidiMessage::note_off(1, 60).at(9);
        writer.push(&a);
        writer.push(&b);
        assert_eq!(reader.peek(), Some(a));
        assert_eq!(reader.pop(), Some(a));
        assert_eq!(reader.pop(), Some(b));
        assert_eq!(reader.peek(), None);
    }

    #[test]
    fn drain_emits_in_window_offsets() {
        let (mut reader, mut writer) = message_ring(8).unwrap();
        for time in [10u32, 100, 300] {
            writer.push(&MidiMessage::note_on(0, 60, 100).at(time));
        }
        let mut seen = Vec::new();
        let rejected = drain_due(&mut reader, 0, 256, |t, _| {
            seen.push(t);
            true
        });
        assert_eq!(rejected, 0);
        assert_eq!(seen, vec![10, 100]);
        // the message for the next window is still queued
        assert_eq!(reader.peek().map(|m| m.time), Some(300));
    }

    #[test]
    fn late_messages_clamp_to_window_start() {
        let (mut reader, mut writer) = message_ring(8).unwrap();
        writer.push(&MidiMessage::note_on(0, 60, 100).at(5));
        let mut seen = Vec::new();
        drain_due(&mut reader, 50, 64, |t, _| {
            seen.push(t);
            true
        });
        assert_eq!(seen, vec![0]);
    }

    #[test]
    fn frame_counter_wrap_reads_as_late() {
        let (mut reader, mut writer) = message_ring(8).unwrap();
        writer.push(&MidiMessage::note_on(0, 60, 100).at(u32::MAX - 10));
        let mut seen = Vec::new();
        drain_due(&mut reader, 4, 64, |t, _| {
            seen.push(t);
            true
        });
        assert_eq!(seen, vec![0]);
    }

    #[test]
    fn rejected_messages_are_counted() {
        let (mut reader, mut writer) = message_ring(8).unwrap();
        writer.push(&MidiMessage::note_on(0, 60, 100).at(1));
        writer.push(&MidiMessage::note_on(0, 61, 100).at(2));
        let rejected = drain_due(&mut reader, 0, 64, |_, bytes| bytes[1] != 60);
        assert_eq!(rejected, 1);
    }
}
