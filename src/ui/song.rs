// Song arrangement view. Not built out yet; it identifies itself with a
// checker pattern so a stray USER1 press is obvious on the device.

use crate::pad::{self, KeyEvent, PadDisplay};

use super::{set_active_mode_button, Screen, UiRequest};

pub struct SongScreen;

impl SongScreen {
    pub fn new() -> Self {
        SongScreen
    }
}

impl Default for SongScreen {
    fn default() -> Self {
        SongScreen::new()
    }
}

impl Screen for SongScreen {
    fn on_key(&self, _ev: &KeyEvent) {}

    fn on_enter(&self, pad: &mut PadDisplay) {
        set_active_mode_button(pad, 1);
        pad.fill_matrix(|x, y| if (x + y) % 2 == 0 { pad::CL_AMBER_L } else { pad::CL_BLACK });
        pad.flip(false);
    }

    fn update(&self, _pad: &mut PadDisplay, _requests: &mut Vec<UiRequest>) {}
}
