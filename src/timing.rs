// Tick time. Ticks are tempo-independent: 4 * PPQN is a whole note no
// matter what the BPM says. Microseconds only appear at the JACK boundary.

pub type Ticks = i64;

pub const PPQN: Ticks = 192;
pub const TICKS_PER_BAR: Ticks = 4 * PPQN;
pub const SEQUENCE_DEFAULT_LENGTH: Ticks = 8 * PPQN;

pub const DEFAULT_BPM: f64 = 120.0;
pub const DEFAULT_VELOCITY: u8 = 100;
pub const NOTE_C3: u8 = 60;
pub const NOTE_MAX: u8 = 127;

/// Microsecond length of one tick at the given tempo.
pub fn pulse_length_us(bpm: f64) -> f64 {
    60_000_000.0 / PPQN as f64 / bpm
}

pub fn ticks_to_us(t: Ticks, bpm: f64) -> f64 {
    t as f64 * pulse_length_us(bpm)
}

pub fn us_to_ticks(us: f64, bpm: f64) -> Ticks {
    (us / pulse_length_us(bpm)).floor() as Ticks
}

/// Smallest multiple of `m` that is >= `t`.
pub fn next_multiple(t: Ticks, m: Ticks) -> Ticks {
    if t % m == 0 {
        t
    } else {
        (t / m + 1) * m
    }
}

/// Scaling table. Even rows are straight, odd rows are the triplet pairing.
/// The name is the time quantity of one grid cell.
pub const SCALINGS: [(&str, Ticks); 16] = [
    ("1", PPQN * 4),
    ("1", PPQN * 4), // no point in a triplet whole
    ("1/2", PPQN * 2),
    ("1/3", PPQN * 4 / 3),
    ("1/4", PPQN),
    ("1/6", PPQN * 2 / 3),
    ("1/8", PPQN / 2),
    ("1/12", PPQN / 3),
    ("1/16", PPQN / 4),
    ("1/24", PPQN / 6),
    ("1/32", PPQN / 8),
    ("1/48", PPQN / 12),
    ("1/64", PPQN / 16),
    ("1/96", PPQN / 24),
    ("1/128", PPQN / 32),
    ("1/192", PPQN / 48),
];

const DEFAULT_SCALING: usize = 4; // one quarter note per cell
const MAX_SCALING: usize = 14;

/// Quantizes ticks to grid cells based on an offset and a step picked from
/// the scaling table.
#[derive(Debug, Clone)]
pub struct TimeScaler {
    offset: Ticks,
    step: Ticks,
    scaling: usize,
    triplet: bool,
}

impl TimeScaler {
    pub fn new(offset: Ticks) -> Self {
        TimeScaler {
            offset,
            step: SCALINGS[DEFAULT_SCALING].1,
            scaling: DEFAULT_SCALING,
            triplet: false,
        }
    }

    pub fn to_quantum(&self, t: Ticks) -> i64 {
        (t - self.offset).div_euclid(self.step)
    }

    pub fn to_ticks(&self, quantum: i64) -> Ticks {
        (quantum * self.step + self.offset).max(0)
    }

    pub fn length_to_quantum(&self, l: Ticks) -> i64 {
        l / self.step
    }

    pub fn is_scale_accurate(&self, t: Ticks) -> bool {
        (t - self.offset).rem_euclid(self.step) == 0
    }

    pub fn scroll(&mut self, direction: i32) {
        if direction < 0 {
            self.offset -= self.step;
        } else if direction > 0 {
            self.offset += self.step;
        }
        if self.offset < 0 {
            self.offset = 0;
        }
    }

    pub fn get_offset(&self) -> Ticks {
        self.offset
    }

    pub fn get_step(&self) -> Ticks {
        self.step
    }

    /// Move scaling in/out by the given number of steps. Negative zooms out.
    pub fn scale(&mut self, amount: i32) {
        for _ in 0..amount.unsigned_abs() {
            if amount < 0 {
                self.scale_out();
            } else {
                self.scale_in();
            }
        }
    }

    /// Each cell covers more ticks.
    pub fn scale_out(&mut self) {
        self.scaling = self.scaling.saturating_sub(2);
        self.update_scaling();
    }

    /// Each cell covers fewer ticks.
    pub fn scale_in(&mut self) {
        self.scaling = (self.scaling + 2).min(MAX_SCALING);
        self.update_scaling();
    }

    pub fn get_triplets(&self) -> bool {
        self.triplet
    }

    pub fn switch_triplets(&mut self) {
        self.triplet = !self.triplet;
        self.update_scaling();
    }

    pub fn scale_name(&self) -> &'static str {
        SCALINGS[self.scale_index()].0
    }

    fn scale_index(&self) -> usize {
        (self.scaling + self.triplet as usize).min(SCALINGS.len() - 1)
    }

    fn update_scaling(&mut self) {
        self.step = SCALINGS[self.scale_index()].1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_us_round_trip_at_default_tempo() {
        for t in [0, 1, 192, 1536, 100_000] {
            let us = ticks_to_us(t, DEFAULT_BPM);
            assert_eq!(us_to_ticks(us, DEFAULT_BPM), t);
        }
        assert_eq!(pulse_length_us(DEFAULT_BPM), 60_000_000.0 / 192.0 / 120.0);
    }

    #[test]
    fn next_multiple_boundaries() {
        assert_eq!(next_multiple(0, TICKS_PER_BAR), 0);
        assert_eq!(next_multiple(1, TICKS_PER_BAR), TICKS_PER_BAR);
        assert_eq!(next_multiple(TICKS_PER_BAR, TICKS_PER_BAR), TICKS_PER_BAR);
        assert_eq!(next_multiple(TICKS_PER_BAR + 1, TICKS_PER_BAR), 2 * TICKS_PER_BAR);
    }

    #[test]
    fn quantum_round_trip_when_accurate() {
        let mut scaler = TimeScaler::new(0);
        assert_eq!(scaler.get_step(), PPQN);
        for t in (0..PPQN * 8).step_by(PPQN as usize) {
            assert!(scaler.is_scale_accurate(t));
            assert_eq!(scaler.to_ticks(scaler.to_quantum(t)), t);
        }
        assert!(!scaler.is_scale_accurate(1));

        scaler.scroll(1);
        assert_eq!(scaler.get_offset(), PPQN);
        for t in (0..PPQN * 8).step_by(PPQN as usize) {
            assert_eq!(scaler.to_ticks(scaler.to_quantum(t)), t);
        }
    }

    #[test]
    fn scroll_clamps_at_zero() {
        let mut scaler = TimeScaler::new(0);
        scaler.scroll(-1);
        assert_eq!(scaler.get_offset(), 0);
        scaler.scroll(1);
        scaler.scroll(-1);
        assert_eq!(scaler.get_offset(), 0);
    }

    #[test]
    fn zoom_keeps_triplet_parity() {
        let mut scaler = TimeScaler::new(0);
        scaler.scale_in();
        assert_eq!(scaler.get_step(), PPQN / 2); // 1/8
        scaler.switch_triplets();
        assert_eq!(scaler.get_step(), PPQN / 3); // 1/12
        scaler.scale_in();
        assert_eq!(scaler.get_step(), PPQN / 6); // 1/24
        scaler.switch_triplets();
        assert_eq!(scaler.get_step(), PPQN / 4); // 1/16
    }

    #[test]
    fn zoom_stops_at_table_ends() {
        let mut scaler = TimeScaler::new(0);
        for _ in 0..20 {
            scaler.scale_out();
        }
        assert_eq!(scaler.get_step(), PPQN * 4);
        for _ in 0..20 {
            scaler.scale_in();
        }
        assert_eq!(scaler.get_step(), PPQN / 32);
        scaler.switch_triplets();
        assert_eq!(scaler.get_step(), PPQN / 48);
    }
}
