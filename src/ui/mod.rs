// Screen machine. Key events arrive on the pad's callback thread and are
// accumulated into per-screen update blocks; the edit thread wakes up,
// snapshots the block and applies it. The top-row SESSION/USER1/USER2
// buttons switch screens, MIXER is the modal shift key.

mod sequence;
mod song;
mod track;

pub use sequence::SequenceScreen;
pub use song::SongScreen;
pub use track::TrackScreen;

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam::channel::Sender;

use crate::pad::{self, KeyEvent, PadDisplay};
use crate::project::Project;
use crate::router::Audition;
use crate::sequencer::SequencerHandle;

/// Velocity levels on the side buttons, top button loudest.
pub const VELOCITIES: [u8; 8] = [127, 112, 96, 80, 64, 48, 32, 16];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScreenType {
    Track,
    Song,
    Sequence,
}

pub enum UiRequest {
    OpenSequence { track: usize, seq: usize },
}

pub trait Screen: Send + Sync {
    /// Runs on the pad callback thread; must only accumulate.
    fn on_key(&self, ev: &KeyEvent);

    fn on_enter(&self, pad: &mut PadDisplay);

    fn on_exit(&self, _pad: &mut PadDisplay) {}

    /// Runs on the edit thread after a wake-up.
    fn update(&self, pad: &mut PadDisplay, requests: &mut Vec<UiRequest>);
}

/// Wakes the edit loop. Sending never blocks; a full queue means a wake-up
/// is already pending.
#[derive(Clone)]
pub struct Wake(Sender<()>);

impl Wake {
    pub fn new(tx: Sender<()>) -> Self {
        Wake(tx)
    }

    pub fn wake(&self) {
        let _ = self.0.try_send(());
    }
}

/// Lights the mode buttons, highlighting the active screen.
fn set_active_mode_button(pad: &mut PadDisplay, mode: usize) {
    for (i, code) in [pad::BC_SESSION, pad::BC_USER1, pad::BC_USER2, pad::BC_MIXER]
        .into_iter()
        .enumerate()
    {
        pad.set_color(code, if i == mode { pad::CL_GREEN } else { pad::CL_BLACK });
    }
}

/// One pad's user interface: the three screens plus the display they
/// share. Lock order is `current` before `display`; `on_key` paths take
/// only the per-screen key mutex.
pub struct Ui {
    display: Mutex<PadDisplay>,
    current: Mutex<ScreenType>,
    track_screen: TrackScreen,
    song_screen: SongScreen,
    sequence_screen: SequenceScreen,
}

impl Ui {
    pub fn new(
        display: PadDisplay,
        project: Arc<Project>,
        sequencer: SequencerHandle,
        audition: Arc<Audition>,
        wake: Wake,
    ) -> Arc<Ui> {
        let ui = Arc::new(Ui {
            display: Mutex::new(display),
            current: Mutex::new(ScreenType::Track),
            track_screen: TrackScreen::new(project.clone(), sequencer, wake.clone()),
            song_screen: SongScreen::new(),
            sequence_screen: SequenceScreen::new(project, audition, wake),
        });
        {
            let mut pad = ui.display.lock().unwrap_or_else(PoisonError::into_inner);
            ui.track_screen.on_enter(&mut pad);
            let weak = Arc::downgrade(&ui);
            pad.set_callback(Arc::new(move |ev| {
                if let Some(ui) = weak.upgrade() {
                    ui.dispatch(ev);
                }
            }));
        }
        ui
    }

    fn screen(&self, kind: ScreenType) -> &dyn Screen {
        match kind {
            ScreenType::Track => &self.track_screen,
            ScreenType::Song => &self.song_screen,
            ScreenType::Sequence => &self.sequence_screen,
        }
    }

    pub fn current_screen(&self) -> ScreenType {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entry point for classified key events; runs on the pad callback
    /// thread.
    pub fn dispatch(&self, ev: &KeyEvent) {
        if ev.press {
            match ev.code {
                pad::BC_SESSION => return self.set_screen(ScreenType::Track),
                pad::BC_USER1 => return self.set_screen(ScreenType::Song),
                pad::BC_USER2 => return self.set_screen(ScreenType::Sequence),
                _ => {}
            }
        }
        self.screen(self.current_screen()).on_key(ev);
    }

    pub fn set_screen(&self, kind: ScreenType) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == kind {
            return;
        }
        let mut pad = self.display.lock().unwrap_or_else(PoisonError::into_inner);
        self.screen(*current).on_exit(&mut pad);
        self.screen(kind).on_enter(&mut pad);
        *current = kind;
    }

    /// Applies pending edits for the active screen; runs on the edit
    /// thread.
    pub fn update(&self) {
        let kind = self.current_screen();
        let mut requests = Vec::new();
        {
            let mut pad = self.display.lock().unwrap_or_else(PoisonError::into_inner);
            self.screen(kind).update(&mut pad, &mut requests);
        }
        for request in requests {
            match request {
                UiRequest::OpenSequence { track, seq } => {
                    self.sequence_screen.set_active(track, seq);
                    self.set_screen(ScreenType::Sequence);
                }
            }
        }
    }

    pub fn display_overruns(&self) -> u64 {
        self.display.lock().unwrap_or_else(PoisonError::into_inner).overruns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pad::{ButtonType, KeyEvent};
    use crate::ring::{message_ring, FrameClock};
    use crate::sequencer::Sequencer;

    fn press(code: u16) -> KeyEvent {
        KeyEvent { kind: ButtonType::Top, code, x: (code - pad::BC_UP) as u8, y: 0, press: true }
    }

    fn test_ui() -> (Arc<Ui>, Vec<crate::ring::MsgReader>) {
        let project = Arc::new(Project::default());
        let (imm_reader, imm_writer) = message_ring(64).unwrap();
        let (q_reader, q_writer) = message_ring(64).unwrap();
        let clock = Arc::new(FrameClock::default());
        let audition = Arc::new(Audition::new(imm_writer, clock.clone()));
        let (handle, _sequencer) = Sequencer::new(project.clone(), q_writer);
        let (pad_reader, pad_writer) = message_ring(2048).unwrap();
        let display = PadDisplay::new(pad_writer, clock);
        let (wake_tx, _wake_rx) = crossbeam::channel::bounded(16);
        let ui = Ui::new(display, project, handle, audition, Wake::new(wake_tx));
        (ui, vec![imm_reader, q_reader, pad_reader])
    }

    #[test]
    fn mode_buttons_switch_screens() {
        let (ui, _readers) = test_ui();
        assert_eq!(ui.current_screen(), ScreenType::Track);
        ui.dispatch(&press(pad::BC_USER2));
        assert_eq!(ui.current_screen(), ScreenType::Sequence);
        ui.dispatch(&press(pad::BC_USER1));
        assert_eq!(ui.current_screen(), ScreenType::Song);
        ui.dispatch(&press(pad::BC_SESSION));
        assert_eq!(ui.current_screen(), ScreenType::Track);
        // releases do not switch
        let mut release = press(pad::BC_USER1);
        release.press = false;
        ui.dispatch(&release);
        assert_eq!(ui.current_screen(), ScreenType::Track);
    }
}
