// Project data: a fixed grid of tracks and sequences that lives as long
// as the process. Nothing here is reallocated during playback; the fields
// the audio thread reads are atomics.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::seq::Sequence;
use crate::timing::DEFAULT_BPM;

pub const MAX_TRACKS: usize = 16;
pub const MAX_SEQUENCES: usize = 64;

pub struct Track {
    sequences: Vec<Sequence>,
    midi_chan: AtomicU8,
    muted: AtomicBool,
}

impl Default for Track {
    fn default() -> Self {
        Track {
            sequences: (0..MAX_SEQUENCES).map(|_| Sequence::default()).collect(),
            midi_chan: AtomicU8::new(0),
            muted: AtomicBool::new(false),
        }
    }
}

impl Track {
    pub fn sequence(&self, index: usize) -> Option<&Sequence> {
        self.sequences.get(index)
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn midi_channel(&self) -> u8 {
        self.midi_chan.load(Ordering::Relaxed)
    }

    pub fn set_midi_channel(&self, channel: u8) {
        self.midi_chan.store(channel & 0x0F, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn toggle_mute(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::Relaxed)
    }
}

pub struct Project {
    tracks: Vec<Track>,
    bpm: AtomicU64,
}

impl Default for Project {
    fn default() -> Self {
        Project {
            tracks: (0..MAX_TRACKS).map(|_| Track::default()).collect(),
            bpm: AtomicU64::new(DEFAULT_BPM.to_bits()),
        }
    }
}

impl Project {
    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn bpm(&self) -> f64 {
        f64::from_bits(self.bpm.load(Ordering::Relaxed))
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.bpm.store(bpm.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::SEQUENCE_DEFAULT_LENGTH;

    #[test]
    fn defaults() {
        let project = Project::default();
        assert_eq!(project.tracks().len(), MAX_TRACKS);
        assert_eq!(project.bpm(), DEFAULT_BPM);
        let track = project.track(0).unwrap();
        assert_eq!(track.sequences().len(), MAX_SEQUENCES);
        assert!(!track.is_muted());
        let seq = track.sequence(0).unwrap();
        assert_eq!(seq.get_length(), SEQUENCE_DEFAULT_LENGTH);
        assert!(seq.is_repeated());
        assert!(project.track(MAX_TRACKS).is_none());
        assert!(track.sequence(MAX_SEQUENCES).is_none());
    }

    #[test]
    fn channel_is_masked_to_four_bits() {
        let track = Track::default();
        track.set_midi_channel(0x1F);
        assert_eq!(track.midi_channel(), 0x0F);
    }

    #[test]
    fn mute_toggles() {
        let track = Track::default();
        assert!(track.toggle_mute());
        assert!(track.is_muted());
        assert!(!track.toggle_mute());
        assert!(!track.is_muted());
    }
}
