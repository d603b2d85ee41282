// Playback engine. The edit thread never touches scheduler state; it
// submits commands over a bounded channel that the process callback drains
// at the top of every cycle. All launch-machine fields are therefore owned
// by the audio thread alone.

use std::sync::Arc;

use arrayvec::ArrayVec;
use crossbeam::channel::{bounded, Receiver, Sender};

use crate::midi::MidiMessage;
use crate::project::{Project, MAX_TRACKS};
use crate::ring::MsgWriter;
use crate::seq::{SeqHandle, SEQF_REPEATED};
use crate::timing::{next_multiple, ticks_to_us, us_to_ticks, Ticks, NOTE_MAX, TICKS_PER_BAR};

const COMMAND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Copy, Clone)]
pub enum SchedulerCommand {
    Launch { track: usize, seq: usize, when: Option<Ticks> },
    Stop,
    SetBpm(f64),
}

/// One process window, expressed in frames and in the JACK microsecond
/// clock. Ticks are derived from the microsecond end so the tick clock
/// cannot drift against the server.
#[derive(Debug, Copy, Clone)]
pub struct FrameWindow {
    pub start: jack::Frames,
    pub nframes: jack::Frames,
    pub start_us: u64,
    pub end_us: u64,
}

impl FrameWindow {
    pub fn from_client(client: &jack::Client, ps: &jack::ProcessScope) -> Self {
        let start = ps.last_frame_time();
        let nframes = ps.n_frames();
        FrameWindow {
            start,
            nframes,
            start_us: client.frames_to_time(start),
            end_us: client.frames_to_time(start + nframes),
        }
    }

    /// Frame for an absolute microsecond stamp, clamped into the window.
    fn frame_at_us(&self, us: f64) -> jack::Frames {
        if self.nframes == 0 || self.end_us <= self.start_us {
            return self.start;
        }
        let us_per_frame = (self.end_us - self.start_us) as f64 / self.nframes as f64;
        let offset = ((us - self.start_us as f64) / us_per_frame).round();
        let offset = offset.clamp(0.0, (self.nframes - 1) as f64) as jack::Frames;
        self.start + offset
    }
}

/// Edit-thread face of the sequencer. Validates against the project and
/// reports scheduling failures as `false` instead of panicking.
#[derive(Clone)]
pub struct SequencerHandle {
    tx: Sender<SchedulerCommand>,
    project: Arc<Project>,
}

impl SequencerHandle {
    /// Schedule to follow the playing sequence, or at the next bar when the
    /// track is idle.
    pub fn schedule_sequence(&self, track: usize, seq: usize) -> bool {
        self.schedule(track, seq, None)
    }

    pub fn schedule_sequence_at(&self, track: usize, seq: usize, when: Ticks) -> bool {
        self.schedule(track, seq, Some(when))
    }

    fn schedule(&self, track: usize, seq: usize, when: Option<Ticks>) -> bool {
        if self.project.track(track).and_then(|t| t.sequence(seq)).is_none() {
            return false;
        }
        self.tx.try_send(SchedulerCommand::Launch { track, seq, when }).is_ok()
    }

    /// Stops all playback as soon as the next process call runs.
    pub fn stop(&self) {
        let _ = self.tx.try_send(SchedulerCommand::Stop);
    }

    /// Takes effect immediately while idle, otherwise at the next sequence
    /// transition.
    pub fn set_bpm(&self, bpm: f64) -> bool {
        if !(bpm.is_finite() && bpm > 0.0) {
            return false;
        }
        self.tx.try_send(SchedulerCommand::SetBpm(bpm)).is_ok()
    }
}

struct TrackStatus {
    current: Option<usize>,
    next: Option<usize>,
    when_change: Ticks,
    when_started: Ticks,
    // touched only on the audio thread
    playing_notes: [bool; 128],
}

impl TrackStatus {
    fn new() -> Self {
        TrackStatus {
            current: None,
            next: None,
            when_change: 0,
            when_started: 0,
            playing_notes: [false; 128],
        }
    }
}

/// Wraps everything needed to walk one playing sequence: the scoped read
/// handle (holding the sequence lock for this window) and a cursor into
/// its sorted events. Ticks are absolute, offset by the track start.
struct SequenceWalker<'a> {
    track: usize,
    channel: u8,
    muted: bool,
    start: Ticks,
    handle: SeqHandle<'a>,
    cursor: usize,
}

impl SequenceWalker<'_> {
    fn due(&self, w_stop: Ticks) -> Option<(Ticks, i32)> {
        let ev = self.handle.events().get(self.cursor)?;
        let abs = ev.tick() + self.start;
        if abs >= w_stop {
            return None;
        }
        Some((abs, ev.rank()))
    }
}

pub struct Sequencer {
    project: Arc<Project>,
    rx: Receiver<SchedulerCommand>,
    queued: MsgWriter,
    bpm: f64,
    pending_bpm: Option<f64>,
    current_ticks: Ticks,
    last_ticks: Option<Ticks>,
    tracks: [TrackStatus; MAX_TRACKS],
}

impl Sequencer {
    pub fn new(project: Arc<Project>, queued: MsgWriter) -> (SequencerHandle, Sequencer) {
        let (tx, rx) = bounded(COMMAND_QUEUE_DEPTH);
        let bpm = project.bpm();
        let handle = SequencerHandle { tx, project: project.clone() };
        let sequencer = Sequencer {
            project,
            rx,
            queued,
            bpm,
            pending_bpm: None,
            current_ticks: 0,
            last_ticks: None,
            tracks: std::array::from_fn(|_| TrackStatus::new()),
        };
        (handle, sequencer)
    }

    /// Runs in the process callback.
    pub fn process(&mut self, window: &FrameWindow) {
        let w_start = us_to_ticks(window.start_us as f64, self.bpm);
        let w_stop = us_to_ticks(window.end_us as f64, self.bpm);
        self.current_ticks = w_start;

        self.consume_commands(window);

        if self.last_ticks == Some(w_start) {
            return;
        }
        self.last_ticks = Some(w_start);

        self.swap_sequences(w_start, window);
        self.schedule_notes(w_start, w_stop, window);
    }

    fn consume_commands(&mut self, window: &FrameWindow) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                SchedulerCommand::Launch { track, seq, when } => {
                    if self.project.track(track).and_then(|t| t.sequence(seq)).is_none() {
                        continue;
                    }
                    let when = when.unwrap_or_else(|| self.follow_up_ticks(track)).max(0);
                    if let Some(status) = self.tracks.get_mut(track) {
                        status.next = Some(seq);
                        status.when_change = when;
                    }
                }
                SchedulerCommand::Stop => self.stop_all(window),
                SchedulerCommand::SetBpm(bpm) => {
                    if self.all_idle() {
                        self.bpm = bpm;
                        self.pending_bpm = None;
                    } else {
                        self.pending_bpm = Some(bpm);
                    }
                }
            }
        }
    }

    /// End tick of the playing sequence, or the next bar boundary when the
    /// track is idle.
    fn follow_up_ticks(&self, track: usize) -> Ticks {
        let Some(status) = self.tracks.get(track) else {
            return next_multiple(self.current_ticks, TICKS_PER_BAR);
        };
        match status.current {
            Some(index) => {
                let length = self
                    .project
                    .track(track)
                    .and_then(|t| t.sequence(index))
                    .map(|s| s.get_length())
                    .unwrap_or(0);
                status.when_started + length
            }
            None => next_multiple(self.current_ticks, TICKS_PER_BAR),
        }
    }

    fn all_idle(&self) -> bool {
        self.tracks.iter().all(|t| t.current.is_none() && t.next.is_none())
    }

    fn stop_all(&mut self, window: &FrameWindow) {
        for track in 0..MAX_TRACKS {
            self.tracks[track].current = None;
            self.tracks[track].next = None;
            self.tracks[track].when_change = 0;
            self.flush_playing_notes(track, window);
        }
        if let Some(bpm) = self.pending_bpm.take() {
            self.bpm = bpm;
        }
    }

    /// Note-offs for everything still sounding on the track, stamped at the
    /// window start so they leave in this cycle.
    fn flush_playing_notes(&mut self, track: usize, window: &FrameWindow) {
        let channel =
            self.project.track(track).map(|t| t.midi_channel()).unwrap_or(0);
        let status = &mut self.tracks[track];
        for note in 0..NOTE_MAX as usize {
            if status.playing_notes[note] {
                status.playing_notes[note] = false;
                self.queued
                    .push(&MidiMessage::note_off(channel, note as u8).at(window.start));
            }
        }
    }

    /// Promotes armed tracks whose change tick has been reached.
    fn swap_sequences(&mut self, w_start: Ticks, window: &FrameWindow) {
        let mut swapped = false;
        for track in 0..MAX_TRACKS {
            let (next, when) = {
                let status = &self.tracks[track];
                (status.next, status.when_change)
            };
            let Some(index) = next else { continue };
            if when > w_start {
                continue;
            }

            let Some((length, flags)) = self
                .project
                .track(track)
                .and_then(|t| t.sequence(index))
                .map(|s| {
                    let handle = s.handle();
                    (handle.length(), handle.flags())
                })
            else {
                self.tracks[track].next = None;
                self.tracks[track].when_change = 0;
                continue;
            };

            {
                let status = &mut self.tracks[track];
                status.current = Some(index);
                status.when_started = w_start;
                if flags & SEQF_REPEATED != 0 {
                    // keep `next` armed so the loop re-fires at its end
                    status.when_change = w_start + length.max(1);
                } else {
                    status.next = None;
                    status.when_change = 0;
                }
            }
            self.flush_playing_notes(track, window);
            swapped = true;
        }
        if swapped {
            if let Some(bpm) = self.pending_bpm.take() {
                self.bpm = bpm;
            }
        }
    }

    /// Emits every event of the active sequences due inside the tick
    /// window, merged across tracks in (tick, rank, track) order.
    fn schedule_notes(&mut self, w_start: Ticks, w_stop: Ticks, window: &FrameWindow) {
        let project = &self.project;
        let mut walkers: ArrayVec<SequenceWalker<'_>, MAX_TRACKS> = ArrayVec::new();

        for track in 0..MAX_TRACKS {
            let Some(index) = self.tracks[track].current else { continue };
            let Some(project_track) = project.track(track) else { continue };
            let Some(sequence) = project_track.sequence(index) else { continue };
            let handle = sequence.handle();
            let start = self.tracks[track].when_started;
            let repeated = handle.flags() & SEQF_REPEATED != 0;
            let cursor = handle.events().partition_point(|ev| ev.tick() + start < w_start);
            if cursor >= handle.events().len() && !repeated {
                // played out, nothing left to stream
                self.tracks[track].current = None;
                continue;
            }
            walkers.push(SequenceWalker {
                track,
                channel: project_track.midi_channel(),
                muted: project_track.is_muted(),
                start,
                handle,
                cursor,
            });
        }

        loop {
            let mut best: Option<((Ticks, i32, usize), usize)> = None;
            for (i, walker) in walkers.iter().enumerate() {
                if let Some((tick, rank)) = walker.due(w_stop) {
                    let key = (tick, rank, walker.track);
                    if best.map_or(true, |(k, _)| key < k) {
                        best = Some((key, i));
                    }
                }
            }
            let Some(((abs_tick, _, _), i)) = best else { break };

            let walker = &mut walkers[i];
            let event = walker.handle.events()[walker.cursor];
            walker.cursor += 1;

            let status = &mut self.tracks[walker.track];
            let mut emit = true;
            if event.is_note_on() {
                if walker.muted {
                    emit = false;
                } else {
                    status.playing_notes[event.note() as usize] = true;
                }
            } else if event.is_note_off() {
                // a muted track still releases notes it started earlier
                emit = status.playing_notes[event.note() as usize] || !walker.muted;
                status.playing_notes[event.note() as usize] = false;
            }
            if emit {
                let frame = window.frame_at_us(ticks_to_us(abs_tick, self.bpm));
                self.queued.push(&event.to_message(walker.channel).at(frame));
            }
        }
    }
}
