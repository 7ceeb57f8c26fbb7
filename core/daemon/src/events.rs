//! Window-manager event subscription.
//!
//! Runs on its own thread, translating `window`, `tick` and `shutdown` events
//! into event-loop jobs. The subscription is re-established with a capped
//! backoff whenever the window manager goes away.

use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use winscope_core::ipc::{socket_from_env, IpcConnection, WmEvent};
use winscope_core::{IpcSettings, Trigger};
use winscope_daemon_protocol::parse_tick_payload;

use crate::event_loop::Job;

const SUBSCRIBED_EVENTS: &[&str] = &["window", "tick", "shutdown"];
const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// What the listener should do after one event.
enum Next {
    Forward(Job),
    Skip,
    Reconnect,
}

pub fn spawn_listener(settings: IpcSettings, jobs: Sender<Job>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("winscope-wm-events".to_string())
        .spawn(move || listen(settings, jobs))
}

fn listen(settings: IpcSettings, jobs: Sender<Job>) {
    let mut delay = RECONNECT_INITIAL;
    loop {
        match subscribe(&settings) {
            Ok((path, mut stream)) => {
                info!(path = %path.display(), "Subscribed to window manager events");
                delay = RECONNECT_INITIAL;
                loop {
                    let event = match stream.next_event() {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(error = %err, "Window manager event stream broke");
                            break;
                        }
                    };
                    match translate(event) {
                        Next::Forward(job) => {
                            if jobs.send(job).is_err() {
                                debug!("Event loop gone; stopping listener");
                                return;
                            }
                        }
                        Next::Skip => {}
                        Next::Reconnect => {
                            info!("Window manager is shutting down");
                            break;
                        }
                    }
                }
            }
            Err(err) => debug!(error = %err, "Window manager subscription failed"),
        }
        thread::sleep(delay);
        delay = (delay * 2).min(RECONNECT_MAX);
    }
}

fn subscribe(
    settings: &IpcSettings,
) -> winscope_core::Result<(PathBuf, winscope_core::ipc::EventStream)> {
    let path = settings
        .socket_path
        .clone()
        .or_else(socket_from_env)
        .ok_or_else(|| {
            winscope_core::ScopeError::ipc("resolve socket", "no window manager socket configured")
        })?;
    let connection = IpcConnection::connect(&path, Some(settings.timeout))?;
    let stream = connection.subscribe(SUBSCRIBED_EVENTS)?;
    Ok((path, stream))
}

fn translate(event: WmEvent) -> Next {
    match event {
        WmEvent::WindowNew(node) => Next::Forward(Job::Trigger(Trigger::WindowCreated {
            window_id: node.id,
            pid: node.pid,
            marks: Some(node.marks),
        })),
        WmEvent::WindowClose { window_id } => Next::Forward(Job::WindowClosed { window_id }),
        WmEvent::Tick { payload } => match parse_tick_payload(&payload) {
            Ok(Some(project)) => Next::Forward(Job::Trigger(Trigger::TickSwitch { project })),
            Ok(None) => Next::Skip,
            Err(err) => {
                warn!(payload = %payload, error = %err.message, "Ignoring malformed switch tick");
                Next::Skip
            }
        },
        WmEvent::Shutdown => Next::Reconnect,
        WmEvent::Other => Next::Skip,
    }
}
