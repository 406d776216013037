//! The process-local worker pool.
//!
//! A fixed number of workers is spawned up front, each on its own
//! dedicated thread so that a blocked or crashing processor can never
//! stall or corrupt the parent or its siblings. All communication is
//! message passing over channels; the only state a worker shares with
//! the parent is the read-only parameter snapshot taken at spawn time
//! and the process-wide shutdown token.

use crate::error::Error;
use crate::processor::ProcessorFactory;
use crate::shutdown::ShutdownToken;
use crate::work_package::{Scheme, WorkPackage};
use log::warn;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

mod worker;

/// One typed value in a worker's spawn-time parameter map.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// The typed name-to-value map injected into every worker at spawn
/// time. Copied per worker; never shared mutable state.
#[derive(Debug, Clone, Default)]
pub struct Params {
    map: HashMap<String, ParamValue>,
}

impl Params {
    pub fn new() -> Self {
        Params { map: HashMap::new() }
    }

    pub fn set_str(&mut self, name: &str, value: &str) {
        self.map
            .insert(name.to_string(), ParamValue::Str(value.to_string()));
    }

    pub fn set_int(&mut self, name: &str, value: i64) {
        self.map.insert(name.to_string(), ParamValue::Int(value));
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.map.insert(name.to_string(), ParamValue::Bool(value));
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.map.get(name) {
            Some(ParamValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.map.get(name) {
            Some(ParamValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.map.get(name) {
            Some(ParamValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
}

/// Commands a parent may send a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCommand {
    /// Keep going
    Continue,
    /// Disregard the previous command
    Ignore,
    /// Finish the current package, then stop
    Exit,
    /// Stop after the in-progress record
    QuickExit,
    /// Stop immediately
    TermExit,
}

/// A worker's report on one dispatched package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Every element processed cleanly
    Ok,
    /// At least one element failed; the rest were still processed
    Failed,
    /// The worker is stopping, either on command or because the
    /// processor requested job termination
    Exit,
}

/// Classifies messages on the parent/worker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    /// Lifecycle traffic: exits, signals
    Control,
    /// Work results
    Data,
    /// Out-of-band traffic relayed for someone else, e.g. a
    /// MessageCenter client
    Oob,
}

#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Dispatch(WorkPackage),
    Signal(TaskCommand),
}

/// What a worker reported back to the pool.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker_id: usize,
    pub tag: MessageTag,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub enum WorkerEventKind {
    /// A dispatched package finished, one way or another
    Completion {
        status: TaskStatus,
        error: Option<String>,
        /// `true` when the processor raised a job-termination request
        terminate: bool,
    },
    /// The worker's thread ended; it accepts no further dispatches
    Exited,
}

/// The parent's non-owning handle to one worker.
///
/// Relationship is one parent to N workers; workers never hold a
/// reference back to their controller.
pub struct WorkerController {
    id: usize,
    commands: mpsc::Sender<WorkerCommand>,
    working: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl WorkerController {
    pub fn id(&self) -> usize {
        self.id
    }

    /// `true` while the worker is mid-package.
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// `true` until the worker's thread ends.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Hands the worker one package. The caller must only dispatch to
    /// an idle worker; the pool's [`WorkerPool::dispatch`] takes care
    /// of that.
    pub async fn dispatch(&self, package: WorkPackage) -> Result<(), Error> {
        self.working.store(true, Ordering::SeqCst);
        if let Err(e) =
            self.commands.send(WorkerCommand::Dispatch(package)).await
        {
            self.working.store(false, Ordering::SeqCst);
            drop(e);
            return Err(Error::WorkerGone(self.id));
        }
        Ok(())
    }

    /// Sends the worker a control command.
    pub async fn signal(&self, cmd: TaskCommand) -> Result<(), Error> {
        self.commands
            .send(WorkerCommand::Signal(cmd))
            .await
            .map_err(|_| Error::WorkerGone(self.id))
    }

    /// Marks the controller ready for a fresh task. Fails while the
    /// worker is mid-task.
    pub fn reset(&self) -> Result<(), Error> {
        if self.is_working() {
            return Err(Error::Protocol(format!(
                "worker {} is mid-task and cannot be reset",
                self.id
            )));
        }
        Ok(())
    }
}

/// A fixed-size pool of workers bound to one processor implementation.
pub struct WorkerPool {
    controllers: Vec<WorkerController>,
    events: mpsc::Receiver<WorkerEvent>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `n` workers. Each gets its own processor instance built
    /// by `factory` from a copy of `params`, its own command channel,
    /// and a sender onto the shared event channel.
    pub fn spawn<F: ProcessorFactory>(
        n: usize,
        params: Params,
        factory: &F,
        scheme: Scheme,
        token: ShutdownToken,
    ) -> Result<Self, Error> {
        if n == 0 {
            return Err(Error::Config(
                "worker pool size must be positive".to_string(),
            ));
        }
        let (event_tx, events) = mpsc::channel(n * 4);
        let mut controllers = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for id in 0..n {
            let processor = factory.make(&params)?;
            let (cmd_tx, cmd_rx) = mpsc::channel(1);
            let working = Arc::new(AtomicBool::new(false));
            let alive = Arc::new(AtomicBool::new(true));
            let handle = worker::spawn_worker(
                id,
                processor,
                cmd_rx,
                event_tx.clone(),
                working.clone(),
                alive.clone(),
                scheme,
                token.clone(),
            );
            controllers.push(WorkerController {
                id,
                commands: cmd_tx,
                working,
                alive,
            });
            handles.push(handle);
        }
        Ok(WorkerPool { controllers, events, handles })
    }

    /// The controllers for every spawned worker, dead or alive.
    pub fn controllers(&self) -> &[WorkerController] {
        &self.controllers
    }

    /// The number of workers still able to accept dispatches.
    pub fn num_alive(&self) -> usize {
        self.controllers.iter().filter(|c| c.is_alive()).count()
    }

    /// Routes `package` to the next idle worker, blocking until one
    /// frees up if all are busy. Events observed while waiting are
    /// returned so the caller can handle the completions they carry.
    ///
    /// ## Errors
    /// `Error::WorkerGone` once no live workers remain.
    pub async fn dispatch(
        &mut self,
        package: WorkPackage,
    ) -> Result<(usize, Vec<WorkerEvent>), Error> {
        let mut seen = Vec::new();
        let mut package = Some(package);
        loop {
            let idle = self
                .controllers
                .iter()
                .find(|c| c.is_alive() && !c.is_working());
            if let Some(ctl) = idle {
                let id = ctl.id();
                match ctl.dispatch(package.take().unwrap()).await {
                    Ok(()) => return Ok((id, seen)),
                    Err(Error::WorkerGone(_)) => {
                        // that worker died between the check and the
                        // send; the package is lost with it
                        warn!("worker {} died before accepting work", id);
                        return Err(Error::WorkerGone(id));
                    }
                    Err(e) => return Err(e),
                }
            }
            if self.num_alive() == 0 {
                return Err(Error::WorkerGone(self.controllers.len()));
            }
            match self.events.recv().await {
                Some(event) => seen.push(event),
                None => return Err(Error::StreamClosed),
            }
        }
    }

    /// Sends `cmd` to every live worker.
    pub async fn broadcast(&mut self, cmd: TaskCommand) -> Result<(), Error> {
        for ctl in self.controllers.iter().filter(|c| c.is_alive()) {
            // a worker dying mid-broadcast is not an error here; its
            // Exited event is already on the channel
            let _ = ctl.signal(cmd).await;
        }
        Ok(())
    }

    /// Waits for the next event from any worker. `None` blocks
    /// indefinitely, `Some(Duration::ZERO)` polls, anything else
    /// bounds the wait; `Ok(None)` means the wait elapsed.
    pub async fn next_event(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<WorkerEvent>, Error> {
        match timeout {
            None => Ok(self.events.recv().await),
            Some(d) if d.is_zero() => match self.events.try_recv() {
                Ok(event) => Ok(Some(event)),
                Err(_) => Ok(None),
            },
            Some(d) => match tokio::time::timeout(d, self.events.recv())
                .await
            {
                Ok(event) => Ok(event),
                Err(_) => Ok(None),
            },
        }
    }

    /// Graceful teardown: closes every command channel and joins the
    /// worker threads after they finish their current package.
    pub fn shutdown(self) {
        drop(self.controllers);
        drop(self.events);
        for handle in self.handles {
            let _ = handle.join();
        }
    }

    /// Forced teardown for `TermExit`: drops the channels and detaches
    /// the threads without waiting for them.
    pub fn abort(self) {
        drop(self.controllers);
        drop(self.events);
        // handles are dropped unjoined; the process is exiting anyway
    }
}
