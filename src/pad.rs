// Launchpad MK1 driver. The device speaks plain 3-byte MIDI: grid and
// side buttons arrive as note on/off, the top row as control changes.
// Display updates leave through a ring buffer drained by the process
// callback, so the edit thread never touches a port.
//
// Protocol reference: Novation "Launchpad programmer's reference".

use std::ops::{BitAndAssign, BitOrAssign, Not};
use std::sync::{Arc, Mutex, PoisonError};

use crate::midi::MidiMessage;
use crate::ring::{self, drain_due, FrameClock, MsgReader, MsgWriter};

pub const MATRIX_W: u8 = 8;
pub const MATRIX_H: u8 = 8;

/// Messages buffered towards the device.
pub const RING_CAPACITY: usize = 1024;

// top row button codes, shifted out of the device's 0..127 key space
pub const BC_UP: u16 = 200;
pub const BC_DOWN: u16 = 201;
pub const BC_LEFT: u16 = 202;
pub const BC_RIGHT: u16 = 203;
pub const BC_SESSION: u16 = 204;
pub const BC_USER1: u16 = 205;
pub const BC_USER2: u16 = 206;
pub const BC_MIXER: u16 = 207;

// red and green brightness pairs packed the way the device wants them
pub const CL_BLACK: u8 = 0x00;
pub const CL_GREEN: u8 = 0x30;
pub const CL_GREEN_M: u8 = 0x20;
pub const CL_GREEN_L: u8 = 0x10;
pub const CL_RED: u8 = 0x03;
pub const CL_RED_M: u8 = 0x02;
pub const CL_RED_L: u8 = 0x01;
pub const CL_AMBER: u8 = 0x33;
pub const CL_AMBER_M: u8 = 0x22;
pub const CL_AMBER_L: u8 = 0x11;
pub const CL_YELLOW: u8 = 0x32;
pub const CL_YELLOW_M: u8 = 0x21;

pub const fn color(r: u8, g: u8) -> u8 {
    let r = if r > 3 { 3 } else { r };
    let g = if g > 3 { 3 } else { g };
    g << 4 | r
}

pub fn coord_to_btn(x: u8, y: u8) -> u16 {
    (x | y << 4) as u16
}

/// Ports belonging to a Launchpad match one of these prefixes.
pub fn match_name(name: &str) -> bool {
    name.starts_with("Launchpad:") || name.starts_with("Launchpad MIDI")
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ButtonType {
    Grid,
    Side,
    Top,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub kind: ButtonType,
    pub code: u16,
    pub x: u8,
    pub y: u8,
    pub press: bool,
}

/// Classifies one incoming message. Anything that is not a 3-byte key
/// message is discarded.
pub fn classify(bytes: &[u8]) -> Option<KeyEvent> {
    let &[status, data1, data2] = bytes else { return None };
    let press = data2 > 0 && status != 0x80;
    match status {
        0x80 | 0x90 => {
            // buttons with a low nibble of 8 sit in the side column
            let kind = if data1 & 0x0F == 0x08 { ButtonType::Side } else { ButtonType::Grid };
            Some(KeyEvent { kind, code: data1 as u16, x: data1 & 0x0F, y: data1 >> 4, press })
        }
        0xB0 if (104..=111).contains(&data1) => {
            let code = data1 as u16 + 96;
            Some(KeyEvent { kind: ButtonType::Top, code, x: (code - BC_UP) as u8, y: 0, press })
        }
        _ => None,
    }
}

pub fn lowest_bit_set(c: u8) -> i32 {
    if c == 0 {
        -1
    } else {
        c.trailing_zeros() as i32
    }
}

pub fn highest_bit_set(c: u8) -> i32 {
    if c == 0 {
        -1
    } else {
        7 - c.leading_zeros() as i32
    }
}

/// Highest set bit at or below `pos`, or `pos` itself when there is none.
pub fn nearest_lower_bit(c: u8, pos: u8) -> u8 {
    let pos = pos.min(7);
    let masked = c & (0xFF >> (7 - pos));
    match highest_bit_set(masked) {
        -1 => pos,
        h => h as u8,
    }
}

/// Packed dirtiness flags for the 8x8 grid: two u32 banks of four rows
/// each. This is the coalescing primitive passed between the key thread
/// and the edit thread.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    bits: [u32; 2],
}

impl Bitmap {
    fn slot(x: u8, y: u8) -> Option<(usize, u32)> {
        if x >= MATRIX_W || y >= MATRIX_H {
            return None;
        }
        Some(((y / 4) as usize, 1 << (x + (y & 0x03) * 8)))
    }

    pub fn mark(&mut self, x: u8, y: u8) {
        if let Some((bank, bit)) = Self::slot(x, y) {
            self.bits[bank] |= bit;
        }
    }

    pub fn unmark(&mut self, x: u8, y: u8) {
        if let Some((bank, bit)) = Self::slot(x, y) {
            self.bits[bank] &= !bit;
        }
    }

    pub fn get(&self, x: u8, y: u8) -> bool {
        Self::slot(x, y).map_or(false, |(bank, bit)| self.bits[bank] & bit != 0)
    }

    pub fn row(&self, y: u8) -> u8 {
        match Self::slot(0, y) {
            Some((bank, _)) => (self.bits[bank] >> ((y & 0x03) * 8)) as u8,
            None => 0,
        }
    }

    pub fn clear(&mut self) {
        self.bits = [0, 0];
    }

    pub fn has_value(&self) -> bool {
        self.bits[0] | self.bits[1] != 0
    }

    pub fn iterate<F: FnMut(u8, u8)>(&self, mut f: F) {
        for x in 0..MATRIX_W {
            for y in 0..MATRIX_H {
                if self.get(x, y) {
                    f(x, y);
                }
            }
        }
    }
}

impl BitOrAssign for Bitmap {
    fn bitor_assign(&mut self, rhs: Bitmap) {
        self.bits[0] |= rhs.bits[0];
        self.bits[1] |= rhs.bits[1];
    }
}

impl BitAndAssign for Bitmap {
    fn bitand_assign(&mut self, rhs: Bitmap) {
        self.bits[0] &= rhs.bits[0];
        self.bits[1] &= rhs.bits[1];
    }
}

impl Not for Bitmap {
    type Output = Bitmap;
    fn not(self) -> Bitmap {
        Bitmap { bits: [!self.bits[0], !self.bits[1]] }
    }
}

pub type KeyCallback = Arc<dyn Fn(&KeyEvent) + Send + Sync>;

type CallbackSlot = Arc<Mutex<Option<KeyCallback>>>;

/// Audio-thread half: the ports and the drained end of the display ring.
pub struct PadIo {
    in_port: jack::Port<jack::MidiIn>,
    out_port: jack::Port<jack::MidiOut>,
    reader: MsgReader,
    callback: CallbackSlot,
    underruns: u64,
}

impl PadIo {
    pub fn process(&mut self, ps: &jack::ProcessScope) {
        for raw in self.in_port.iter(ps) {
            let Some(event) = classify(raw.bytes) else { continue };
            // copy the callback out so it runs unlocked
            let callback = {
                self.callback.lock().unwrap_or_else(PoisonError::into_inner).clone()
            };
            if let Some(callback) = callback {
                callback(&event);
            }
        }

        let last = ps.last_frame_time();
        let nframes = ps.n_frames();
        let mut writer = self.out_port.writer(ps);
        self.underruns += drain_due(&mut self.reader, last, nframes, |t, bytes| {
            writer.write(&jack::RawMidi { time: t, bytes }).is_ok()
        });
    }
}

/// Edit-thread half: buffers display commands and owns the double-buffer
/// page state.
pub struct PadDisplay {
    writer: MsgWriter,
    clock: Arc<FrameClock>,
    callback: CallbackSlot,
    cur_page: bool,
}

impl PadDisplay {
    pub fn new(writer: MsgWriter, clock: Arc<FrameClock>) -> Self {
        Self::with_slot(writer, clock, Arc::new(Mutex::new(None)))
    }

    fn with_slot(writer: MsgWriter, clock: Arc<FrameClock>, callback: CallbackSlot) -> Self {
        let mut display = PadDisplay { writer, clock, callback, cur_page: false };
        display.reset();
        display.set_grid_layout();
        // start updating page 0 while page 1 shows
        display.set_double_buffer(false, true, false, false);
        display
    }

    pub fn set_callback(&self, callback: KeyCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn send(&mut self, bytes: [u8; 3]) {
        let msg = MidiMessage::new(self.clock.now(), &bytes);
        self.writer.push(&msg);
    }

    /// Resets lighting to a known state.
    pub fn reset(&mut self) {
        self.send([0xB0, 0x00, 0x00]);
    }

    pub fn set_grid_layout(&mut self) {
        self.send([0xB0, 0x00, 0x01]);
    }

    /// Swaps the updated and displayed pages. With `copy` the device
    /// copies the page that was showing into the new update page, so
    /// partial updates are preserved.
    pub fn flip(&mut self, copy: bool) {
        self.cur_page = !self.cur_page;
        self.set_double_buffer(self.cur_page, !self.cur_page, copy, false);
    }

    pub fn set_double_buffer(&mut self, update: bool, display: bool, copy: bool, flash: bool) {
        self.send([
            0xB0,
            0x00,
            0x20 | (update as u8) << 2 | display as u8 | (copy as u8) << 4 | (flash as u8) << 3,
        ]);
    }

    /// Sets one button by its key-event code.
    pub fn set_color(&mut self, btn: u16, col: u8) {
        if btn >= BC_UP {
            if btn > BC_MIXER {
                return;
            }
            self.send([0xB0, (btn - 96) as u8, col]);
        } else {
            self.send([0x90, btn as u8, col]);
        }
    }

    /// Fills the whole matrix through the rapid-update command, two cells
    /// per message, rows top to bottom.
    pub fn fill_matrix<F: FnMut(u8, u8) -> u8>(&mut self, mut color: F) {
        for y in 0..MATRIX_H {
            for x in (0..MATRIX_W).step_by(2) {
                self.send([0x92, color(x, y), color(x + 1, y)]);
            }
        }
        // a no-op so the next rapid fill starts from the top again
        self.send([0xB0, 0x01, 0x00]);
    }

    pub fn overruns(&self) -> u64 {
        self.writer.overruns()
    }
}

/// Registers the pad's ports and wires both halves to a fresh ring.
pub fn open(
    client: &jack::Client,
    index: usize,
    clock: Arc<FrameClock>,
) -> Result<(PadIo, PadDisplay), jack::Error> {
    let in_port = client.register_port(&format!("launchpad_{index}_in"), jack::MidiIn::default())?;
    let out_port =
        client.register_port(&format!("launchpad_{index}_out"), jack::MidiOut::default())?;
    let (reader, writer) = ring::message_ring(RING_CAPACITY)?;
    let callback: CallbackSlot = Arc::new(Mutex::new(None));
    let io = PadIo { in_port, out_port, reader, callback: callback.clone(), underruns: 0 };
    let display = PadDisplay::with_slot(writer, clock, callback);
    Ok((io, display))
}
