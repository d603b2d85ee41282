// Sequence editing on the 8x8 grid. Columns are time quanta, rows are
// scale positions. The key thread only marks bitmaps and counters in the
// update block; everything that touches the sequence happens in update().

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::music::NoteScaler;
use crate::pad::{self, Bitmap, ButtonType, KeyEvent, PadDisplay, MATRIX_H, MATRIX_W};
use crate::project::Project;
use crate::router::Audition;
use crate::seq::Sequence;
use crate::timing::{TimeScaler, DEFAULT_VELOCITY, NOTE_C3};

use super::{set_active_mode_button, Screen, UiRequest, Wake, VELOCITIES};

// field status bits of one view cell
const FS_HAS_NOTE: u8 = 1; // at least one note starts here
const FS_MULTIPLE: u8 = 2; // more than one note starts here
const FS_INACCURATE: u8 = 4; // a note here is off the current grid
const FS_CONT: u8 = 8; // continuation of a longer note
const FS_IN_SCALE: u8 = 16;
const FS_SCALE_MARK: u8 = 32; // background mark on scale roots
const FS_IS_SELECTED: u8 = 64;
const FS_SEQ_END: u8 = 128; // the sequence ends in this column

type View = [[u8; MATRIX_H as usize]; MATRIX_W as usize];

#[derive(Debug, Default, Clone)]
struct UpdateBlock {
    left_right: i32,
    up_down: i32,
    time_scale: i32,
    switch_triplets: bool,
    switch_scale: bool,
    side_buttons: u8,
    shift_only: bool,
    grid_on: Bitmap,
    grid_off: Bitmap,
    shift_grid_on: Bitmap,
}

/// State owned by the key thread.
#[derive(Default)]
struct KeyState {
    shift: bool,
    shift_only: bool,
    shift_start: Option<Instant>,
    updates: UpdateBlock,
}

/// State owned by the edit thread.
struct EditState {
    target: Option<(usize, usize)>,
    time_scaler: TimeScaler,
    note_scaler: NoteScaler,
    held_buttons: Bitmap,
    modified_notes: Bitmap,
    view: View,
}

pub struct SequenceScreen {
    project: Arc<Project>,
    audition: Arc<Audition>,
    wake: Wake,
    dirty: AtomicBool,
    keys: Mutex<KeyState>,
    state: Mutex<EditState>,
}

impl SequenceScreen {
    pub fn new(project: Arc<Project>, audition: Arc<Audition>, wake: Wake) -> Self {
        SequenceScreen {
            project,
            audition,
            wake,
            dirty: AtomicBool::new(false),
            keys: Mutex::new(KeyState::default()),
            state: Mutex::new(EditState {
                target: Some((0, 0)),
                time_scaler: TimeScaler::new(0),
                note_scaler: NoteScaler::new(NOTE_C3 as i64, MATRIX_H as i64),
                held_buttons: Bitmap::default(),
                modified_notes: Bitmap::default(),
                view: [[0; MATRIX_H as usize]; MATRIX_W as usize],
            }),
        }
    }

    pub(crate) fn set_active(&self, track: usize, seq: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.target = Some((track, seq));
        state.held_buttons.clear();
        state.modified_notes.clear();
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.wake.wake();
    }
}

impl Screen for SequenceScreen {
    fn on_key(&self, ev: &KeyEvent) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);

        if ev.code == pad::BC_MIXER {
            keys.shift = ev.press;
            if ev.press {
                keys.shift_only = true;
                keys.shift_start = Some(Instant::now());
            } else if keys.shift_only {
                let held = keys.shift_start.map(|t| t.elapsed()).unwrap_or_default();
                if held >= Duration::from_secs(1) {
                    keys.updates.shift_only = true;
                    self.mark_dirty();
                }
            }
            return;
        }
        if keys.shift && ev.press {
            keys.shift_only = false;
        }

        if !keys.shift {
            if ev.press {
                match ev.code {
                    pad::BC_LEFT => {
                        keys.updates.left_right -= 1;
                        return self.mark_dirty();
                    }
                    pad::BC_RIGHT => {
                        keys.updates.left_right += 1;
                        return self.mark_dirty();
                    }
                    pad::BC_DOWN => {
                        keys.updates.up_down -= 1;
                        return self.mark_dirty();
                    }
                    pad::BC_UP => {
                        keys.updates.up_down += 1;
                        return self.mark_dirty();
                    }
                    _ => {}
                }
            }
            match ev.kind {
                ButtonType::Grid => {
                    // distinct press and release bitmaps allow combos
                    if ev.press {
                        keys.updates.grid_on.mark(ev.x, ev.y);
                    } else {
                        keys.updates.grid_off.mark(ev.x, ev.y);
                    }
                    self.mark_dirty();
                }
                ButtonType::Side if ev.press => {
                    keys.updates.side_buttons |= 1 << ev.y.min(7);
                    self.mark_dirty();
                }
                _ => {}
            }
        } else {
            if !ev.press {
                return;
            }
            match ev.kind {
                ButtonType::Side => match ev.y {
                    0 => {
                        keys.updates.switch_triplets = true;
                        self.mark_dirty();
                    }
                    1 => {
                        keys.updates.switch_scale = true;
                        self.mark_dirty();
                    }
                    _ => {}
                },
                ButtonType::Grid => {
                    keys.updates.shift_grid_on.mark(ev.x, ev.y);
                    self.mark_dirty();
                }
                ButtonType::Top => match ev.code {
                    pad::BC_LEFT => {
                        keys.updates.time_scale -= 1;
                        self.mark_dirty();
                    }
                    pad::BC_RIGHT => {
                        keys.updates.time_scale += 1;
                        self.mark_dirty();
                    }
                    _ => {}
                },
            }
        }
    }

    fn on_enter(&self, pad: &mut PadDisplay) {
        {
            let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
            keys.updates = UpdateBlock::default();
        }
        self.dirty.store(false, Ordering::Release);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *state;
        if let Some((track, index)) = state.target {
            if let Some(seq) = self.project.track(track).and_then(|t| t.sequence(index)) {
                repaint(pad, seq, &state.time_scaler, &state.note_scaler, &mut state.view);
                return;
            }
        }
        set_active_mode_button(pad, 2);
        pad.fill_matrix(|_, _| pad::CL_BLACK);
        pad.flip(false);
    }

    fn update(&self, pad: &mut PadDisplay, _requests: &mut Vec<UiRequest>) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let block = {
            let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut keys.updates)
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *state;
        let Some((track_index, seq_index)) = state.target else { return };
        let Some(track) = self.project.track(track_index) else { return };
        let Some(seq) = track.sequence(seq_index) else { return };
        let channel = track.midi_channel();

        let mut repaint_all = false;

        // arrows move the selection when one exists, otherwise they scroll
        let selection_active = seq.selected_count() > 0;
        if selection_active && (block.left_right != 0 || block.up_down != 0) {
            let dt = block.left_right as i64 * state.time_scaler.get_step();
            let dy = block.up_down as i64;
            let note_scaler = &state.note_scaler;
            seq.move_selected_notes(|tick, note| {
                ((tick + dt).max(0), note_scaler.transpose(note, dy))
            });
            repaint_all = true;
        } else {
            for _ in 0..block.left_right.unsigned_abs() {
                state.time_scaler.scroll(block.left_right.signum());
                repaint_all = true;
            }
            for _ in 0..block.up_down.unsigned_abs() {
                state.note_scaler.scroll(block.up_down.signum());
                repaint_all = true;
            }
        }
        if block.time_scale != 0 {
            state.time_scaler.scale(block.time_scale);
            repaint_all = true;
        }
        if block.switch_triplets {
            state.time_scaler.switch_triplets();
            repaint_all = true;
        }
        if block.switch_scale {
            state.note_scaler.cycle_scale();
            repaint_all = true;
        }
        if block.shift_only {
            seq.unselect_all();
            repaint_all = true;
        }

        let EditState { time_scaler, note_scaler, held_buttons, modified_notes, view, .. } = state;
        let mut flip = false;

        block.shift_grid_on.iterate(|x, y| {
            // select or toggle, never create
            let start = time_scaler.to_ticks(x as i64);
            let step = time_scaler.get_step();
            let note = note_scaler.to_note(y as i64);
            seq.select_range(start, start + step, note, note.saturating_add(1), true);
            repaint_all = true;
        });

        block.grid_on.iterate(|x, y| {
            let row = held_buttons.row(y);
            if row != 0 {
                // a held button in this row turns the press into a length
                let near_x = pad::nearest_lower_bit(row, x);
                if near_x < x {
                    let toggle: u32 =
                        if view[x as usize][y as usize] & FS_CONT != 0 { 0 } else { 1 };
                    let len = (x - near_x) as u32 + toggle;
                    set_note_lengths_cells(
                        pad,
                        seq,
                        time_scaler,
                        note_scaler,
                        view,
                        near_x,
                        y,
                        len,
                        !repaint_all,
                    );
                    modified_notes.mark(near_x, y);
                    flip = !repaint_all;
                    return;
                }
            }
            if view[x as usize][y as usize] & FS_HAS_NOTE == 0 {
                add_note_cell(pad, seq, time_scaler, note_scaler, view, x, y, !repaint_all);
                modified_notes.mark(x, y);
                self.audition.note_on(channel, note_scaler.to_note(y as i64), DEFAULT_VELOCITY);
                flip = !repaint_all;
            }
        });

        block.grid_off.iterate(|x, y| {
            if view[x as usize][y as usize] & FS_HAS_NOTE != 0 && !modified_notes.get(x, y) {
                remove_note_cell(pad, seq, time_scaler, note_scaler, view, x, y, !repaint_all);
            }
            self.audition.note_off(channel, note_scaler.to_note(y as i64));
            modified_notes.unmark(x, y);
            flip = !repaint_all;
        });

        if block.side_buttons != 0 && held_buttons.has_value() {
            // highest pressed side button wins
            let level = pad::highest_bit_set(block.side_buttons);
            let velocity = VELOCITIES[level as usize];
            seq.unmark_all();
            held_buttons.iterate(|x, y| {
                let start = time_scaler.to_ticks(x as i64);
                let note = note_scaler.to_note(y as i64);
                seq.mark_range(start, start + time_scaler.get_step(), note, note.saturating_add(1));
            });
            seq.set_note_velocities(velocity);
            paint_sidebar_value(pad, velocity);
            flip = !repaint_all;
        }

        *held_buttons |= block.grid_on;
        *held_buttons &= !block.grid_off;

        // holding notes shows their average velocity on the sidebar
        if block.side_buttons == 0 && block.grid_on.has_value() && held_buttons.has_value() {
            seq.unmark_all();
            held_buttons.iterate(|x, y| {
                let start = time_scaler.to_ticks(x as i64);
                let note = note_scaler.to_note(y as i64);
                seq.mark_range(start, start + time_scaler.get_step(), note, note.saturating_add(1));
            });
            paint_sidebar_value(pad, seq.get_average_velocity());
            flip = !repaint_all;
        }

        if repaint_all {
            repaint(pad, seq, time_scaler, note_scaler, view);
        } else if flip {
            // partial updates copy the visible page so older cells survive
            pad.flip(true);
        }
    }
}

fn cell_target(ts: &TimeScaler, ns: &NoteScaler, x: u8, y: u8) -> (i64, i64, u8) {
    (ts.to_ticks(x as i64), ts.get_step(), ns.to_note(y as i64))
}

fn bg_flags(ns: &NoteScaler, y: u8) -> u8 {
    if ns.is_scale_mark(y as i64) {
        FS_SCALE_MARK
    } else {
        0
    }
}

fn to_color(flags: u8) -> u8 {
    let mut col = pad::CL_BLACK;
    if flags & FS_SCALE_MARK != 0 {
        col = pad::CL_AMBER_L;
    }
    if flags & FS_SEQ_END != 0 {
        col = pad::CL_YELLOW_M;
    }
    if flags & FS_CONT != 0 {
        col = pad::CL_RED_L;
    }
    if flags & FS_HAS_NOTE != 0 {
        col = pad::CL_RED;
    }
    if flags & (FS_INACCURATE | FS_MULTIPLE) != 0 {
        col = pad::CL_AMBER;
    }
    if flags & FS_IS_SELECTED != 0 {
        col = pad::CL_GREEN;
    }
    col
}

fn add_note_cell(
    pad: &mut PadDisplay,
    seq: &Sequence,
    ts: &TimeScaler,
    ns: &NoteScaler,
    view: &mut View,
    x: u8,
    y: u8,
    paint: bool,
) {
    let (start, step, note) = cell_target(ts, ns, x, y);
    seq.add_note(start, step, note, DEFAULT_VELOCITY);
    view[x as usize][y as usize] |= FS_HAS_NOTE;
    if paint {
        pad.set_color(pad::coord_to_btn(x, y), to_color(view[x as usize][y as usize]));
    }
}

fn remove_note_cell(
    pad: &mut PadDisplay,
    seq: &Sequence,
    ts: &TimeScaler,
    ns: &NoteScaler,
    view: &mut View,
    x: u8,
    y: u8,
    paint: bool,
) {
    let (start, step, note) = cell_target(ts, ns, x, y);
    seq.unmark_all();
    seq.mark_range(start, start + step, note, note.saturating_add(1));
    seq.remove_marked();

    let had = view[x as usize][y as usize];
    view[x as usize][y as usize] = bg_flags(ns, y);

    let mut last_x = x;
    if had & FS_CONT != 0 {
        for xc in x + 1..MATRIX_W {
            let cell = view[xc as usize][y as usize];
            if cell & FS_CONT == 0 || cell & FS_HAS_NOTE != 0 {
                break;
            }
            view[xc as usize][y as usize] = bg_flags(ns, y);
            last_x = xc;
        }
    }
    if paint {
        for xc in x..=last_x {
            pad.set_color(pad::coord_to_btn(xc, y), to_color(view[xc as usize][y as usize]));
        }
    }
}

fn set_note_lengths_cells(
    pad: &mut PadDisplay,
    seq: &Sequence,
    ts: &TimeScaler,
    ns: &NoteScaler,
    view: &mut View,
    x: u8,
    y: u8,
    len: u32,
    paint: bool,
) {
    let (start, step, note) = cell_target(ts, ns, x, y);
    seq.unmark_all();
    seq.mark_range(start, start + step, note, note.saturating_add(1));
    seq.set_note_lengths(step * len as i64);

    let mut last_x = x;
    for xc in x..MATRIX_W {
        let cl = (xc - x) as u32;
        let cell = view[xc as usize][y as usize];
        if cell & FS_CONT == 0 && cl >= len {
            break;
        }
        if cell & FS_HAS_NOTE != 0 && xc != x {
            // the next note starts here, leave it alone
            break;
        }
        if cl < len {
            if len > 1 {
                view[xc as usize][y as usize] |= FS_CONT;
            }
        } else {
            view[xc as usize][y as usize] = bg_flags(ns, y);
        }
        last_x = xc;
    }
    if paint {
        for xc in x..=last_x {
            pad.set_color(pad::coord_to_btn(xc, y), to_color(view[xc as usize][y as usize]));
        }
    }
}

/// Lights the side column as a bar showing the velocity level.
fn paint_sidebar_value(pad: &mut PadDisplay, velocity: u8) {
    for y in 0..MATRIX_H {
        let code = ((y << 4) | 0x08) as u16;
        let col = if VELOCITIES[y as usize] >= velocity { pad::CL_GREEN } else { pad::CL_BLACK };
        pad.set_color(code, col);
    }
}

/// Rebuilds the whole view from the sequence and pushes it to the device.
fn repaint(
    pad: &mut PadDisplay,
    seq: &Sequence,
    ts: &TimeScaler,
    ns: &NoteScaler,
    view: &mut View,
) {
    set_active_mode_button(pad, 2);

    for x in 0..MATRIX_W as usize {
        for y in 0..MATRIX_H {
            view[x][y as usize] = bg_flags(ns, y);
        }
    }

    {
        let handle = seq.handle();
        let events = handle.events();
        for ev in events {
            if !ev.is_note_on() {
                continue;
            }
            let x = ts.to_quantum(ev.tick());
            let accurate = ts.is_scale_accurate(ev.tick());
            let Some(y) = ns.to_grid(ev.note()) else { continue };
            if !(0..MATRIX_H as i64).contains(&y) {
                continue;
            }
            let l = ts.length_to_quantum(ev.length_in(events));
            if x + l < 0 || x >= MATRIX_W as i64 {
                continue;
            }
            if x >= 0 {
                let cell = &mut view[x as usize][y as usize];
                if *cell & FS_HAS_NOTE != 0 {
                    *cell |= FS_MULTIPLE;
                }
                *cell |= FS_HAS_NOTE;
                if !accurate {
                    *cell |= FS_INACCURATE;
                }
                if ev.is_selected() {
                    *cell |= FS_IS_SELECTED;
                }
                if ns.is_in_scale(ev.note()) {
                    *cell |= FS_IN_SCALE;
                }
            }
            // continuation cells, the base cell included
            for c in 0..l {
                let xc = x + c;
                if xc < 0 {
                    continue;
                }
                if xc >= MATRIX_W as i64 {
                    break;
                }
                view[xc as usize][y as usize] |= FS_CONT;
            }
        }
        let end = ts.to_quantum(handle.length());
        if (0..MATRIX_W as i64).contains(&end) {
            for y in 0..MATRIX_H as usize {
                view[end as usize][y] |= FS_SEQ_END;
            }
        }
    }

    pad.fill_matrix(|x, y| to_color(view[x as usize][y as usize]));
    pad.flip(true);
}
