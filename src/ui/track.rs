// Track overview: rows are tracks, columns are their sequences, with the
// arrows panning an 8x8 window over the 16x64 project. A grid press
// launches the sequence on its track, shift + press opens it for editing,
// the side column mutes the row's track.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::pad::{self, Bitmap, ButtonType, KeyEvent, PadDisplay, MATRIX_H, MATRIX_W};
use crate::project::{Project, MAX_SEQUENCES, MAX_TRACKS};
use crate::sequencer::SequencerHandle;

use super::{set_active_mode_button, Screen, UiRequest, Wake};

#[derive(Debug, Default, Clone)]
struct UpdateBlock {
    left_right: i32,
    up_down: i32,
    side_buttons: u8,
    grid_on: Bitmap,
    grid_off: Bitmap,
    shift_grid_on: Bitmap,
}

#[derive(Default)]
struct KeyState {
    shift: bool,
    updates: UpdateBlock,
}

struct EditState {
    vx: usize,
    vy: usize,
    held: Bitmap,
}

pub struct TrackScreen {
    project: Arc<Project>,
    sequencer: SequencerHandle,
    wake: Wake,
    dirty: AtomicBool,
    keys: Mutex<KeyState>,
    state: Mutex<EditState>,
}

impl TrackScreen {
    pub fn new(project: Arc<Project>, sequencer: SequencerHandle, wake: Wake) -> Self {
        TrackScreen {
            project,
            sequencer,
            wake,
            dirty: AtomicBool::new(false),
            keys: Mutex::new(KeyState::default()),
            state: Mutex::new(EditState { vx: 0, vy: 0, held: Bitmap::default() }),
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.wake.wake();
    }

    fn cell_color(&self, state: &EditState, x: u8, y: u8) -> u8 {
        if state.held.get(x, y) {
            return pad::CL_GREEN;
        }
        let occupied = self
            .project
            .track(state.vy + y as usize)
            .and_then(|t| t.sequence(state.vx + x as usize))
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if occupied {
            pad::CL_AMBER_M
        } else {
            pad::CL_BLACK
        }
    }

    fn repaint(&self, pad: &mut PadDisplay, state: &EditState) {
        set_active_mode_button(pad, 0);
        pad.fill_matrix(|x, y| self.cell_color(state, x, y));
        for y in 0..MATRIX_H {
            let muted = self
                .project
                .track(state.vy + y as usize)
                .map(|t| t.is_muted())
                .unwrap_or(false);
            let code = ((y << 4) | 0x08) as u16;
            pad.set_color(code, if muted { pad::CL_RED_M } else { pad::CL_GREEN_L });
        }
        pad.flip(true);
    }
}

impl Screen for TrackScreen {
    fn on_key(&self, ev: &KeyEvent) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);

        if ev.code == pad::BC_MIXER {
            keys.shift = ev.press;
            return;
        }

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
                if keys.shift {
                    if ev.press {
                        keys.updates.shift_grid_on.mark(ev.x, ev.y);
                        self.mark_dirty();
                    }
                } else {
                    if ev.press {
                        keys.updates.grid_on.mark(ev.x, ev.y);
                    } else {
                        keys.updates.grid_off.mark(ev.x, ev.y);
                    }
                    self.mark_dirty();
                }
            }
            ButtonType::Side if ev.press => {
                keys.updates.side_buttons |= 1 << ev.y.min(7);
                self.mark_dirty();
            }
            _ => {}
        }
    }

    fn on_enter(&self, pad: &mut PadDisplay) {
        {
            let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
            keys.updates = UpdateBlock::default();
        }
        self.dirty.store(false, Ordering::Release);
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.repaint(pad, &state);
    }

    fn update(&self, pad: &mut PadDisplay, requests: &mut Vec<UiRequest>) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let block = {
            let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut keys.updates)
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut repaint_all = false;

        if block.left_right != 0 || block.up_down != 0 {
            let vx = (state.vx as i32 + block.left_right)
                .clamp(0, (MAX_SEQUENCES - MATRIX_W as usize) as i32) as usize;
            let vy = (state.vy as i32 - block.up_down)
                .clamp(0, (MAX_TRACKS - MATRIX_H as usize) as i32) as usize;
            if (vx, vy) != (state.vx, state.vy) {
                state.vx = vx;
                state.vy = vy;
                repaint_all = true;
            }
        }

        if block.side_buttons != 0 {
            for y in 0..MATRIX_H {
                if block.side_buttons & (1 << y) != 0 {
                    if let Some(track) = self.project.track(state.vy + y as usize) {
                        track.toggle_mute();
                    }
                }
            }
            repaint_all = true;
        }

        block.shift_grid_on.iterate(|x, y| {
            requests.push(UiRequest::OpenSequence {
                track: state.vy + y as usize,
                seq: state.vx + x as usize,
            });
        });

        let mut flip = false;
        let mut launches: Vec<(u8, u8)> = Vec::new();
        block.grid_on.iterate(|x, y| launches.push((x, y)));
        for (x, y) in launches {
            self.sequencer.schedule_sequence(state.vy + y as usize, state.vx + x as usize);
            state.held.mark(x, y);
            if !repaint_all {
                pad.set_color(pad::coord_to_btn(x, y), pad::CL_GREEN);
                flip = true;
            }
        }

        let mut releases: Vec<(u8, u8)> = Vec::new();
        block.grid_off.iterate(|x, y| releases.push((x, y)));
        for (x, y) in releases {
            state.held.unmark(x, y);
            if !repaint_all {
                pad.set_color(pad::coord_to_btn(x, y), self.cell_color(&state, x, y));
                flip = true;
            }
        }

        if repaint_all {
            self.repaint(pad, &state);
        } else if flip {
            pad.flip(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{message_ring, FrameClock, MsgReader};
    use crate::sequencer::Sequencer;
    use crate::timing::PPQN;
    use crossbeam::channel::bounded;

    fn grid(x: u8, y: u8, press: bool) -> KeyEvent {
        KeyEvent { kind: ButtonType::Grid, code: pad::coord_to_btn(x, y), x, y, press }
    }

    fn side(y: u8) -> KeyEvent {
        KeyEvent { kind: ButtonType::Side, code: ((y << 4) | 0x08) as u16, x: 8, y, press: true }
    }

    fn mixer(press: bool) -> KeyEvent {
        KeyEvent { kind: ButtonType::Top, code: pad::BC_MIXER, x: 7, y: 0, press }
    }

    struct Fixture {
        screen: TrackScreen,
        pad: PadDisplay,
        sequencer: Sequencer,
        sequencer_out: MsgReader,
        project: Arc<Project>,
        _pad_out: MsgReader,
    }

    fn fixture() -> Fixture {
        let project = Arc::new(Project::default());
        let clock = Arc::new(FrameClock::default());
        let (sequencer_out, q_writer) = message_ring(64).unwrap();
        let (handle, sequencer) = Sequencer::new(project.clone(), q_writer);
        let (pad_out, pad_writer) = message_ring(4096).unwrap();
        let pad = PadDisplay::new(pad_writer, clock);
        let (wake_tx, _) = bounded(16);
        let screen = TrackScreen::new(project.clone(), handle, Wake::new(wake_tx));
        Fixture { screen, pad, sequencer, sequencer_out, project, _pad_out: pad_out }
    }

    #[test]
    fn grid_press_schedules_the_cell_sequence() {
        let mut f = fixture();
        f.project.track(2).unwrap().sequence(1).unwrap().add_note(0, PPQN, 60, 100);
        let mut requests = Vec::new();
        f.screen.on_key(&grid(1, 2, true));
        f.screen.update(&mut f.pad, &mut requests);
        assert!(requests.is_empty());

        // the launch command reaches the sequencer on its next cycle and
        // the armed sequence starts at the next bar, which is tick 0 here
        let window = crate::sequencer::FrameWindow {
            start: 0,
            nframes: 48_000,
            start_us: 0,
            end_us: 1_000_000,
        };
        f.sequencer.process(&window);
        let msg = f.sequencer_out.pop().expect("note from the launched sequence");
        assert_eq!(msg.bytes(), &[0x90, 60, 100]);
    }

    #[test]
    fn shift_press_requests_the_sequence_screen() {
        let mut f = fixture();
        let mut requests = Vec::new();
        f.screen.on_key(&mixer(true));
        f.screen.on_key(&grid(3, 1, true));
        f.screen.on_key(&mixer(false));
        f.screen.update(&mut f.pad, &mut requests);
        assert!(matches!(requests.as_slice(), [UiRequest::OpenSequence { track: 1, seq: 3 }]));
    }

    #[test]
    fn side_buttons_toggle_mute() {
        let mut f = fixture();
        let mut requests = Vec::new();
        f.screen.on_key(&side(2));
        f.screen.update(&mut f.pad, &mut requests);
        assert!(f.project.track(2).unwrap().is_muted());
        f.screen.on_key(&side(2));
        f.screen.update(&mut f.pad, &mut requests);
        assert!(!f.project.track(2).unwrap().is_muted());
    }

    #[test]
    fn arrows_pan_and_clamp() {
        let mut f = fixture();
        let mut requests = Vec::new();
        for _ in 0..3 {
            f.screen.on_key(&KeyEvent {
                kind: ButtonType::Top,
                code: pad::BC_RIGHT,
                x: 3,
                y: 0,
                press: true,
            });
        }
        f.screen.update(&mut f.pad, &mut requests);
        {
            let state = f.screen.state.lock().unwrap();
            assert_eq!(state.vx, 3);
            assert_eq!(state.vy, 0);
        }
        // panning far left clamps at zero
        for _ in 0..10 {
            f.screen.on_key(&KeyEvent {
                kind: ButtonType::Top,
                code: pad::BC_LEFT,
                x: 2,
                y: 0,
                press: true,
            });
        }
        f.screen.update(&mut f.pad, &mut requests);
        {
            let state = f.screen.state.lock().unwrap();
            assert_eq!(state.vx, 0);
        }
        // a shifted window offsets the launched cell
        f.screen.on_key(&KeyEvent {
            kind: ButtonType::Top,
            code: pad::BC_DOWN,
            x: 1,
            y: 0,
            press: true,
        });
        f.screen.update(&mut f.pad, &mut requests);
        let state = f.screen.state.lock().unwrap();
        assert_eq!(state.vy, 1);
    }
}
