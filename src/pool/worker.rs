//! The loop each pool worker runs on its dedicated thread.

use crate::pool::{
    MessageTag, TaskCommand, TaskStatus, WorkerCommand, WorkerEvent,
    WorkerEventKind,
};
use crate::processor::WorkPackageProcessor;
use crate::shutdown::ShutdownToken;
use crate::work_package::{ElementReader, Scheme, WorkPackage};
use log::{error, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What one package's processing run boiled down to.
struct PackageOutcome {
    record_errors: u64,
    last_error: Option<String>,
    /// `Some(reason)` when the processor requested job termination
    terminated: Option<String>,
    /// `true` when an urgent shutdown cut the package short
    stopped_early: bool,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_worker<P: WorkPackageProcessor>(
    id: usize,
    mut processor: P,
    mut commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
    working: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    scheme: Scheme,
    token: ShutdownToken,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("worker-{}", id))
        .spawn(move || {
            loop {
                let cmd = match commands.blocking_recv() {
                    None => break,
                    Some(cmd) => cmd,
                };
                match cmd {
                    WorkerCommand::Signal(
                        TaskCommand::Continue | TaskCommand::Ignore,
                    ) => continue,
                    WorkerCommand::Signal(_) => {
                        let _ = events.blocking_send(WorkerEvent {
                            worker_id: id,
                            tag: MessageTag::Control,
                            kind: WorkerEventKind::Completion {
                                status: TaskStatus::Exit,
                                error: None,
                                terminate: false,
                            },
                        });
                        break;
                    }
                    WorkerCommand::Dispatch(package) => {
                        let caught = catch_unwind(AssertUnwindSafe(|| {
                            process_package(
                                &mut processor,
                                &package,
                                scheme,
                                &token,
                            )
                        }));
                        working.store(false, Ordering::SeqCst);
                        let (event, stop) = match caught {
                            Ok(outcome) => completion_for(id, outcome),
                            Err(_) => {
                                error!(
                                    "worker {} panicked while processing \
                                     a package",
                                    id
                                );
                                (
                                    WorkerEvent {
                                        worker_id: id,
                                        tag: MessageTag::Data,
                                        kind: WorkerEventKind::Completion {
                                            status: TaskStatus::Failed,
                                            error: Some(
                                                "worker panicked"
                                                    .to_string(),
                                            ),
                                            terminate: false,
                                        },
                                    },
                                    true,
                                )
                            }
                        };
                        let _ = events.blocking_send(event);
                        if stop || token.is_urgent() {
                            break;
                        }
                    }
                }
            }
            alive.store(false, Ordering::SeqCst);
            let _ = events.blocking_send(WorkerEvent {
                worker_id: id,
                tag: MessageTag::Control,
                kind: WorkerEventKind::Exited,
            });
        })
        .expect("failed to spawn worker thread")
}

/// Decodes and processes one package, record by record. The shutdown
/// token is consulted between records only; application logic already
/// running for one record is never preempted.
fn process_package<P: WorkPackageProcessor>(
    processor: &mut P,
    package: &WorkPackage,
    scheme: Scheme,
    token: &ShutdownToken,
) -> Result<PackageOutcome, String> {
    let mut reader = ElementReader::new(package, scheme);
    let mut outcome = PackageOutcome {
        record_errors: 0,
        last_error: None,
        terminated: None,
        stopped_early: false,
    };
    loop {
        if token.is_urgent() {
            outcome.stopped_early = true;
            break;
        }
        let element = match reader.next_element() {
            Ok(None) => break,
            Ok(Some(element)) => element,
            Err(e) => return Err(e.to_string()),
        };
        match processor.process_element(&element) {
            Ok(()) => (),
            Err(crate::error::Error::Record(msg)) => {
                warn!("element failed: {}", msg);
                outcome.record_errors += 1;
                outcome.last_error = Some(msg);
            }
            Err(crate::error::Error::TerminateJob(reason)) => {
                outcome.terminated = Some(reason);
                break;
            }
            Err(other) => return Err(other.to_string()),
        }
    }
    if outcome.terminated.is_none() && !outcome.stopped_early {
        if let Err(e) = processor.package_finished() {
            return Err(e.to_string());
        }
    }
    Ok(outcome)
}

/// Maps a processing outcome to the completion event the parent sees,
/// plus whether this worker should stop afterwards.
fn completion_for(
    id: usize,
    outcome: Result<PackageOutcome, String>,
) -> (WorkerEvent, bool) {
    let (status, error, terminate, stop) = match outcome {
        Err(msg) => (TaskStatus::Failed, Some(msg), false, false),
        Ok(PackageOutcome { terminated: Some(reason), .. }) => {
            (TaskStatus::Exit, Some(reason), true, true)
        }
        Ok(PackageOutcome { stopped_early: true, .. }) => {
            (TaskStatus::Exit, None, false, true)
        }
        Ok(PackageOutcome { record_errors, last_error, .. })
            if record_errors > 0 =>
        {
            (TaskStatus::Failed, last_error, false, false)
        }
        Ok(_) => (TaskStatus::Ok, None, false, false),
    };
    (
        WorkerEvent {
            worker_id: id,
            tag: MessageTag::Data,
            kind: WorkerEventKind::Completion { status, error, terminate },
        },
        stop,
    )
}
