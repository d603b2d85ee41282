// The router is the only writer of the MIDI output port. It merges two
// message queues into the port buffer of the current process window:
// the immediate queue (edit thread, stamped at enqueue time) first, then
// the queued queue (sequencer, stamps monotone non-decreasing).

use std::sync::{Arc, Mutex, PoisonError};

use crate::midi::MidiMessage;
use crate::ring::{drain_due, FrameClock, MsgReader, MsgWriter};

pub struct Router {
    in_port: jack::Port<jack::MidiIn>,
    out_port: jack::Port<jack::MidiOut>,
    immediate: MsgReader,
    queued: MsgReader,
    underruns: u64,
}

impl Router {
    pub fn new(
        client: &jack::Client,
        immediate: MsgReader,
        queued: MsgReader,
    ) -> Result<Self, jack::Error> {
        // the input port is reserved for routing an external keyboard
        let in_port = client.register_port("in", jack::MidiIn::default())?;
        let out_port = client.register_port("out", jack::MidiOut::default())?;
        Ok(Router { in_port, out_port, immediate, queued, underruns: 0 })
    }

    /// Runs in the process callback.
    pub fn process(&mut self, ps: &jack::ProcessScope) {
        for _ in self.in_port.iter(ps) {}

        let last = ps.last_frame_time();
        let nframes = ps.n_frames();
        let mut writer = self.out_port.writer(ps);
        self.underruns += merge_into(&mut self.immediate, &mut self.queued, last, nframes, |t, bytes| {
            writer.write(&jack::RawMidi { time: t, bytes }).is_ok()
        });
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

/// Immediate messages first, then the queued ones, both restricted to the
/// current window. Returns the number of failed reservations.
fn merge_into<S>(
    immediate: &mut MsgReader,
    queued: &mut MsgReader,
    last: jack::Frames,
    nframes: jack::Frames,
    mut sink: S,
) -> u64
where
    S: FnMut(jack::Frames, &[u8]) -> bool,
{
    let mut underruns = drain_due(immediate, last, nframes, &mut sink);
    underruns += drain_due(queued, last, nframes, &mut sink);
    underruns
}

/// Edit-thread handle on the router's immediate queue. Used to audition
/// notes while editing; messages are stamped with the latest frame time the
/// audio thread published, so they come out at the start of the next window.
pub struct Audition {
    writer: Mutex<MsgWriter>,
    clock: Arc<FrameClock>,
}

impl Audition {
    pub fn new(writer: MsgWriter, clock: Arc<FrameClock>) -> Self {
        Audition { writer: Mutex::new(writer), clock }
    }

    pub fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        self.send(MidiMessage::note_on(channel, note, velocity));
    }

    pub fn note_off(&self, channel: u8, note: u8) {
        self.send(MidiMessage::note_off(channel, note));
    }

    pub fn send(&self, msg: MidiMessage) {
        let stamped = msg.at(self.clock.now());
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(&stamped);
    }

    pub fn overruns(&self) -> u64 {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner).overruns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::message_ring;

    #[test]
    fn immediate_queue_drains_before_queued() {
        let (mut imm_r, mut imm_w) = message_ring(8).unwrap();
        let (mut q_r, mut q_w) = message_ring(8).unwrap();
        q_w.push(&MidiMessage::note_on(0, 70, 100).at(10));
        imm_w.push(&MidiMessage::note_on(0, 60, 100).at(90));
        let mut seen = Vec::new();
        merge_into(&mut imm_r, &mut q_r, 0, 128, |t, bytes| {
            seen.push((t, bytes[1]));
            true
        });
        // the immediate message comes first even with a later stamp
        assert_eq!(seen, vec![(90, 60), (10, 70)]);
    }

    #[test]
    fn window_membership_is_exact() {
        let (mut imm_r, _imm_w) = message_ring(4).unwrap();
        let (mut q_r, mut q_w) = message_ring(8).unwrap();
        for stamp in [256u32, 300, 511, 512] {
            q_w.push(&MidiMessage::note_on(0, 60, 100).at(stamp));
        }
        let mut seen = Vec::new();
        merge_into(&mut imm_r, &mut q_r, 256, 256, |t, _| {
            seen.push(t);
            true
        });
        // emitted at stamp - last, the event at 512 waits for the next window
        assert_eq!(seen, vec![0, 44, 255]);
        assert_eq!(q_r.peek().map(|m| m.time), Some(512));
    }

    #[test]
    fn audition_stamps_with_the_frame_clock() {
        let clock = Arc::new(FrameClock::default());
        clock.store(777);
        let (mut reader, writer) = message_ring(4).unwrap();
        let audition = Audition::new(writer, clock);
        audition.note_on(2, 64, 90);
        audition.note_off(2, 64);
        let on = reader.pop().unwrap();
        assert_eq!(on.time, 777);
        assert_eq!(on.bytes(), &[0x92, 64, 90]);
        let off = reader.pop().unwrap();
        assert_eq!(off.bytes(), &[0x82, 64, 0]);
        assert_eq!(audition.overruns(), 0);
    }
}
