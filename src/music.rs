// Musical scales map grid rows to pitches. A scale is a set of semitone
// offsets within one octave; rows step through scale positions, not
// semitones, so every reachable row is in key.

use crate::timing::NOTE_MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Scale {
    pub name: &'static str,
    offsets: &'static [u8],
}

pub const SCALES: [Scale; 11] = [
    Scale { name: "Chromatic", offsets: &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11] },
    Scale { name: "Major", offsets: &[0, 2, 4, 5, 7, 9, 11] },
    Scale { name: "Minor", offsets: &[0, 2, 3, 5, 7, 8, 10] },
    Scale { name: "Melodic Minor", offsets: &[0, 2, 3, 5, 7, 9, 11] },
    Scale { name: "Harmonic Minor", offsets: &[0, 2, 3, 5, 7, 8, 11] },
    Scale { name: "Blues", offsets: &[0, 3, 5, 6, 7, 10] },
    Scale { name: "Mixolydian", offsets: &[0, 2, 4, 5, 7, 9, 10] },
    Scale { name: "Dorian", offsets: &[0, 2, 3, 5, 7, 9, 10] },
    Scale { name: "Major Pentatonic", offsets: &[0, 2, 4, 7, 9] },
    Scale { name: "Minor Pentatonic", offsets: &[0, 3, 5, 7, 10] },
    Scale { name: "Diminished", offsets: &[0, 2, 3, 5, 6, 8, 9, 11] },
];

impl Scale {
    pub fn count(&self) -> i64 {
        self.offsets.len() as i64
    }

    /// MIDI note for a scale position above `base`. None when the result
    /// does not fit the MIDI note range.
    pub fn position_to_note(&self, base: u8, position: i64) -> Option<u8> {
        let octave = position.div_euclid(self.count());
        let index = position.rem_euclid(self.count()) as usize;
        let note = octave * 12 + base as i64 + self.offsets[index] as i64;
        if (0..=NOTE_MAX as i64).contains(&note) {
            Some(note as u8)
        } else {
            None
        }
    }

    /// Scale position of a MIDI note relative to `base`, or None when the
    /// note is not part of the scale.
    pub fn note_to_position(&self, base: u8, note: u8) -> Option<i64> {
        let rel = note as i64 - base as i64;
        let octave = rel.div_euclid(12);
        let semitone = rel.rem_euclid(12) as u8;
        let index = self.offsets.iter().position(|&o| o == semitone)?;
        Some(octave * self.count() + index as i64)
    }

    pub fn contains(&self, base: u8, note: u8) -> bool {
        self.note_to_position(base, note).is_some()
    }
}

/// Maps grid rows to notes within the active scale, with a scroll offset
/// expressed in scale positions. Row 0 is the top of the matrix.
#[derive(Debug, Clone)]
pub struct NoteScaler {
    offset: i64,
    mtx_h: i64,
    scale: usize,
    base: u8,
}

impl NoteScaler {
    pub fn new(offset: i64, mtx_h: i64) -> Self {
        NoteScaler { offset, mtx_h, scale: 0, base: 0 }
    }

    pub fn scroll(&mut self, direction: i32) {
        if direction < 0 {
            self.offset -= 1;
        } else if direction > 0 {
            self.offset += 1;
        }
    }

    fn position_for(&self, y: i64) -> i64 {
        self.offset + self.mtx_h - 1 - y
    }

    pub fn to_note(&self, y: i64) -> u8 {
        let position = self.position_for(y);
        if position < 0 {
            return 0;
        }
        self.scale().position_to_note(self.base, position).unwrap_or(NOTE_MAX)
    }

    /// Grid row of a note, or None when the note has no row in the active
    /// scale. The row may lie outside the visible matrix.
    pub fn to_grid(&self, note: u8) -> Option<i64> {
        let position = self.scale().note_to_position(self.base, note)?;
        Some(self.mtx_h - 1 - (position - self.offset))
    }

    pub fn is_in_scale(&self, note: u8) -> bool {
        self.scale().contains(self.base, note)
    }

    /// Rows holding the scale root get a background mark.
    pub fn is_scale_mark(&self, y: i64) -> bool {
        self.position_for(y).rem_euclid(self.scale().count()) == 0
    }

    /// Move a note by whole scale steps, pinning notes that do not fit.
    pub fn transpose(&self, note: u8, steps: i64) -> u8 {
        let scale = self.scale();
        match scale.note_to_position(self.base, note) {
            Some(position) => scale
                .position_to_note(self.base, position + steps)
                .unwrap_or(note),
            None => note,
        }
    }

    pub fn cycle_scale(&mut self) {
        self.scale = (self.scale + 1) % SCALES.len();
    }

    pub fn scale_name(&self) -> &'static str {
        self.scale().name
    }

    fn scale(&self) -> &'static Scale {
        &SCALES[self.scale]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::NOTE_C3;

    #[test]
    fn position_round_trip_every_scale() {
        for scale in &SCALES {
            for base in [0u8, 36, 60] {
                let mut p = 0;
                while let Some(note) = scale.position_to_note(base, p) {
                    assert_eq!(
                        scale.note_to_position(base, note),
                        Some(p),
                        "{} base {} position {}",
                        scale.name,
                        base,
                        p
                    );
                    p += 1;
                }
            }
        }
    }

    #[test]
    fn major_scale_spans_octaves() {
        let major = &SCALES[1];
        assert_eq!(major.position_to_note(60, 0), Some(60));
        assert_eq!(major.position_to_note(60, 7), Some(72));
        assert_eq!(major.position_to_note(60, 2), Some(64));
        assert!(!major.contains(60, 61));
        assert!(major.contains(60, 62));
    }

    #[test]
    fn note_scaler_boundaries() {
        let scaler = NoteScaler::new(0, 8);
        assert_eq!(scaler.to_note(7), 0);
        assert_eq!(scaler.to_note(0), 7);
        // scrolled below zero pins to the bottom of the range
        let mut low = NoteScaler::new(0, 8);
        low.scroll(-1);
        assert_eq!(low.to_note(7), 0);
        // far above the range pins to the top
        let high = NoteScaler::new(200, 8);
        assert_eq!(high.to_note(0), NOTE_MAX);
    }

    #[test]
    fn grid_round_trip_chromatic() {
        let scaler = NoteScaler::new(NOTE_C3 as i64, 8);
        for y in 0..8 {
            let note = scaler.to_note(y);
            assert_eq!(scaler.to_grid(note), Some(y));
        }
    }

    #[test]
    fn scale_marks_hit_roots() {
        let scaler = NoteScaler::new(0, 8);
        assert!(scaler.is_scale_mark(7)); // position 0, a C
        assert!(!scaler.is_scale_mark(6));
    }

    #[test]
    fn transpose_steps_through_scale() {
        let mut scaler = NoteScaler::new(0, 8);
        scaler.cycle_scale(); // Major
        assert_eq!(scaler.scale_name(), "Major");
        assert_eq!(scaler.transpose(60, 1), 62);
        assert_eq!(scaler.transpose(60, 7), 72);
        assert_eq!(scaler.transpose(60, -1), 59);
        // out of scale notes stay put
        assert_eq!(scaler.transpose(61, 1), 61);
    }
}
