//! The single writer.
//!
//! Socket connections and the window-manager listener only enqueue [`Job`]s;
//! one thread owns the [`ScopeEngine`] and drains the queue in arrival order.
//! A job is never interrupted once popped. While it runs, newly arriving jobs
//! pile up in the channel and are moved into the [`TriggerQueue`] before the
//! next pop, which is where a newer project switch supersedes a queued one.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use winscope_core::{Result, ScopeEngine, Trigger};
use winscope_daemon_protocol::{Method, Request, Response, ERROR_SUPERSEDED};

use crate::dispatch;

const STARTUP_RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub enum Job {
    /// A socket request; the answer goes back through `reply`.
    Request {
        request: Request,
        reply: Sender<Response>,
    },
    /// A trigger observed on the window-manager event stream.
    Trigger(Trigger),
    WindowClosed { window_id: i64 },
}

impl Job {
    fn is_switch(&self) -> bool {
        match self {
            Job::Request { request, .. } => request.method == Method::SwitchProject,
            Job::Trigger(trigger) => trigger.is_switch(),
            Job::WindowClosed { .. } => false,
        }
    }

    fn supersede(self) {
        match self {
            Job::Request { request, reply } => {
                let _ = reply.send(Response::error(
                    request.id,
                    ERROR_SUPERSEDED,
                    "a newer project switch replaced this request before it ran",
                ));
            }
            Job::Trigger(trigger) => debug!(trigger = ?trigger, "Queued switch superseded"),
            Job::WindowClosed { .. } => {}
        }
    }
}

/// FIFO of pending jobs holding at most one project switch.
#[derive(Default)]
pub struct TriggerQueue {
    jobs: VecDeque<Job>,
    superseded: u64,
}

impl TriggerQueue {
    pub fn push(&mut self, job: Job) {
        if job.is_switch() {
            if let Some(index) = self.jobs.iter().position(Job::is_switch) {
                if let Some(stale) = self.jobs.remove(index) {
                    stale.supersede();
                    self.superseded += 1;
                }
            }
        }
        self.jobs.push_back(job);
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn superseded(&self) -> u64 {
        self.superseded
    }
}

/// Starts the loop thread. The engine is built on that thread because its
/// collaborators are not `Send`.
pub fn spawn<F>(build_engine: F) -> std::io::Result<(Sender<Job>, JoinHandle<()>)>
where
    F: FnOnce() -> Result<ScopeEngine> + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("winscope-event-loop".to_string())
        .spawn(move || match build_engine() {
            Ok(engine) => EventLoop::new(engine).run(receiver),
            Err(err) => {
                error!(error = %err, "Failed to build engine");
                for job in receiver {
                    if let Job::Request { request, reply } = job {
                        let _ = reply.send(dispatch::unavailable(request.id, &err));
                    }
                }
            }
        })?;
    Ok((sender, handle))
}

struct EventLoop {
    engine: ScopeEngine,
    queue: TriggerQueue,
    rebuilt: bool,
    last_rebuild_attempt: Option<Instant>,
}

impl EventLoop {
    fn new(engine: ScopeEngine) -> Self {
        Self {
            engine,
            queue: TriggerQueue::default(),
            rebuilt: false,
            last_rebuild_attempt: None,
        }
    }

    fn run(mut self, receiver: Receiver<Job>) {
        self.rebuild_state();
        loop {
            if self.queue.is_empty() {
                match receiver.recv() {
                    Ok(job) => self.queue.push(job),
                    Err(_) => break,
                }
            }
            while let Ok(job) = receiver.try_recv() {
                self.queue.push(job);
            }
            if let Some(job) = self.queue.pop() {
                self.handle(job);
            }
        }
        info!("Event loop stopped");
    }

    /// The window manager may not be reachable yet when the daemon starts;
    /// keep trying on later jobs.
    fn rebuild_state(&mut self) {
        if self.rebuilt {
            return;
        }
        let due = self
            .last_rebuild_attempt
            .map_or(true, |at| at.elapsed() >= STARTUP_RETRY_INTERVAL);
        if !due {
            return;
        }
        self.last_rebuild_attempt = Some(Instant::now());
        match self.engine.startup() {
            Ok(_) => self.rebuilt = true,
            Err(err) => warn!(error = %err, "Engine state rebuild deferred"),
        }
    }

    fn handle(&mut self, job: Job) {
        if !matches!(&job, Job::Request { request, .. } if request.method == Method::GetHealth) {
            self.rebuild_state();
        }
        match job {
            Job::Request { request, reply } => {
                let is_health = request.method == Method::GetHealth;
                let mut response = dispatch::handle_request(&mut self.engine, request);
                if is_health {
                    if let Some(data) = response.data.as_mut() {
                        data["state_rebuilt"] = self.rebuilt.into();
                        data["queued_jobs"] = self.queue.len().into();
                        data["superseded_switches"] = self.queue.superseded().into();
                    }
                }
                if reply.send(response).is_err() {
                    debug!("Client went away before the response was ready");
                }
            }
            Job::Trigger(trigger) => {
                let path = trigger.path();
                match self.engine.dispatch(trigger) {
                    Ok(report) => debug!(
                        trigger = ?path,
                        hidden = report.hidden.len(),
                        shown = report.shown.len(),
                        failed = report.failed.len(),
                        "Trigger applied"
                    ),
                    Err(err) => warn!(trigger = ?path, error = %err, "Trigger failed"),
                }
            }
            Job::WindowClosed { window_id } => {
                if let Err(err) = self.engine.window_closed(window_id) {
                    warn!(window_id, error = %err, "Failed to clean up closed window");
                }
            }
        }
    }
}
