// Wires the whole instrument together: one JACK client, a router for the
// synth-facing output, a sequencer fed by commands, and one pad + UI pair
// per connected Launchpad. The process handler owns every audio-thread
// half; the main thread becomes the edit loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::bounded;
use log::{info, warn};
use thiserror::Error;

use crate::pad::{self, PadIo};
use crate::project::Project;
use crate::ring::{self, FrameClock};
use crate::router::{Audition, Router};
use crate::sequencer::{FrameWindow, Sequencer};
use crate::ui::{Ui, Wake};

pub const CLIENT_NAME: &str = "lseq";

/// Queue depth towards the router, in messages.
const ROUTER_RING_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("cannot set up the JACK client, is the server running?")]
    Jack(#[from] jack::Error),
    #[error("no Launchpad ports found (looked for the \"Launchpad:\" and \"Launchpad MIDI\" prefixes)")]
    NoPads,
}

struct Handler {
    clock: Arc<FrameClock>,
    pads: Vec<PadIo>,
    sequencer: Sequencer,
    router: Router,
}

impl jack::ProcessHandler for Handler {
    fn process(&mut self, client: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        self.clock.store(ps.last_frame_time());
        for pad in &mut self.pads {
            pad.process(ps);
        }
        let window = FrameWindow::from_client(client, ps);
        self.sequencer.process(&window);
        self.router.process(ps);
        jack::Control::Continue
    }
}

struct Notifications {
    do_exit: Arc<AtomicBool>,
    wake: Wake,
}

impl jack::NotificationHandler for Notifications {
    fn shutdown(&mut self, _status: jack::ClientStatus, _reason: &str) {
        self.do_exit.store(true, Ordering::Relaxed);
        self.wake.wake();
    }
}

/// Pads show up as one capture and one playback port each; pair them up
/// in enumeration order.
fn discover_pads(client: &jack::Client) -> Vec<(String, String)> {
    let sources = client.ports(None, Some("midi"), jack::PortFlags::IS_OUTPUT);
    let sinks = client.ports(None, Some("midi"), jack::PortFlags::IS_INPUT);
    sources
        .into_iter()
        .filter(|name| pad::match_name(name))
        .zip(sinks.into_iter().filter(|name| pad::match_name(name)))
        .collect()
}

pub fn run() -> anyhow::Result<()> {
    let (client, _status) = jack::Client::new(
        CLIENT_NAME,
        jack::ClientOptions::NO_START_SERVER | jack::ClientOptions::USE_EXACT_NAME,
    )
    .map_err(StartupError::Jack)?;
    info!("connected to JACK at {} frames/s", client.sample_rate());

    let pairs = discover_pads(&client);
    if pairs.is_empty() {
        return Err(StartupError::NoPads.into());
    }

    let clock = Arc::new(FrameClock::default());
    let project = Arc::new(Project::default());

    let (immediate_reader, immediate_writer) =
        ring::message_ring(ROUTER_RING_CAPACITY).map_err(StartupError::Jack)?;
    let (queued_reader, queued_writer) =
        ring::message_ring(ROUTER_RING_CAPACITY).map_err(StartupError::Jack)?;
    let router =
        Router::new(&client, immediate_reader, queued_reader).map_err(StartupError::Jack)?;
    let audition = Arc::new(Audition::new(immediate_writer, clock.clone()));
    let (sequencer_handle, sequencer) = Sequencer::new(project.clone(), queued_writer);

    let (wake_tx, wake_rx) = bounded::<()>(16);
    let wake = Wake::new(wake_tx);
    let do_exit = Arc::new(AtomicBool::new(false));

    let mut pad_ios = Vec::with_capacity(pairs.len());
    let mut uis = Vec::with_capacity(pairs.len());
    for (index, (source, sink)) in pairs.iter().enumerate() {
        info!("launchpad {}: {} / {}", index, source, sink);
        let (io, display) = pad::open(&client, index, clock.clone()).map_err(StartupError::Jack)?;
        pad_ios.push(io);
        uis.push(Ui::new(
            display,
            project.clone(),
            sequencer_handle.clone(),
            audition.clone(),
            wake.clone(),
        ));
    }

    let client_name = client.name().to_string();
    let handler = Handler { clock, pads: pad_ios, sequencer, router };
    let notifications = Notifications { do_exit: do_exit.clone(), wake: wake.clone() };
    let active = client.activate_async(notifications, handler).map_err(StartupError::Jack)?;

    for (index, (source, sink)) in pairs.iter().enumerate() {
        let c = active.as_client();
        c.connect_ports_by_name(source, &format!("{client_name}:launchpad_{index}_in"))
            .map_err(StartupError::Jack)?;
        c.connect_ports_by_name(&format!("{client_name}:launchpad_{index}_out"), sink)
            .map_err(StartupError::Jack)?;
    }

    {
        let do_exit = do_exit.clone();
        let wake = wake.clone();
        ctrlc::set_handler(move || {
            do_exit.store(true, Ordering::Relaxed);
            wake.wake();
        })?;
    }

    info!("running with {} pad(s)", uis.len());
    while !do_exit.load(Ordering::Relaxed) {
        if wake_rx.recv().is_err() {
            break;
        }
        // collapse a burst of wake-ups into one pass
        while wake_rx.try_recv().is_ok() {}
        if do_exit.load(Ordering::Relaxed) {
            break;
        }
        for ui in &uis {
            ui.update();
        }
    }

    for (index, ui) in uis.iter().enumerate() {
        let dropped = ui.display_overruns();
        if dropped > 0 {
            warn!("launchpad {}: display queue dropped {} messages", index, dropped);
        }
    }
    if audition.overruns() > 0 {
        warn!("audition queue dropped {} messages", audition.overruns());
    }

    let _ = active.deactivate();
    info!("stopped");
    Ok(())
}
