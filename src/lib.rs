//! Live MIDI step sequencer for JACK, played from a Novation Launchpad
//! MK1. The pad is both the controller and the display; sequencing output
//! leaves through a plain MIDI port for whatever synth sits behind it.

pub mod app;
pub mod midi;
pub mod music;
pub mod pad;
pub mod project;
pub mod ring;
pub mod router;
pub mod seq;
pub mod sequencer;
pub mod timing;
pub mod ui;
