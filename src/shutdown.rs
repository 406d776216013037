//! The three-level cooperative shutdown protocol.
//!
//! A [`ShutdownToken`] is a write-once tri-state flag shared by every
//! component of a process. Signal handlers only raise the token and wake
//! blocked waiters; the distributor, receiver, and worker loops read it
//! cooperatively at package and record boundaries and are never
//! preempted mid-record.

use crate::error::Error;
use log::info;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

/// The shutdown level of a process. At most one of the three raised
/// levels is ever set for a process's lifetime; once set it is never
/// cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// No shutdown has been requested
    None,
    /// Finish in-flight packages, then stop
    Exit,
    /// Stop after the in-progress record, skip the rest of the package
    QuickExit,
    /// Stop immediately, do not wait for children
    TermExit,
}

struct Inner {
    state: AtomicU8,
    notify: Notify,
}

/// A cheaply cloneable handle to a process-wide shutdown flag. Safe to
/// read from any task; safe to raise from a signal-handling context
/// since it is a single atomic store.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        ShutdownToken {
            inner: Arc::new(Inner {
                state: AtomicU8::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Raises the given shutdown level. The first raise wins; returns
    /// `false` if some level was already set. Wakes every blocked
    /// [`wait`](Self::wait).
    pub fn raise(&self, kind: Shutdown) -> bool {
        let value = match kind {
            Shutdown::None => return false,
            Shutdown::Exit => 1,
            Shutdown::QuickExit => 2,
            Shutdown::TermExit => 3,
        };
        let won = self
            .inner
            .state
            .compare_exchange(0, value, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.inner.notify.notify_waiters();
        }
        won
    }

    /// The current shutdown level.
    pub fn state(&self) -> Shutdown {
        match self.inner.state.load(Ordering::SeqCst) {
            0 => Shutdown::None,
            1 => Shutdown::Exit,
            2 => Shutdown::QuickExit,
            _ => Shutdown::TermExit,
        }
    }

    /// `true` once any shutdown level has been raised.
    pub fn is_raised(&self) -> bool {
        self.state() != Shutdown::None
    }

    /// `true` once `QuickExit` or `TermExit` has been raised; the levels
    /// that abandon the remainder of the current package.
    pub fn is_urgent(&self) -> bool {
        matches!(self.state(), Shutdown::QuickExit | Shutdown::TermExit)
    }

    /// Blocks until some shutdown level is raised. Returns immediately
    /// if one already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        ShutdownToken::new()
    }
}

/// Installs the three signal handlers: SIGINT raises `Exit`, SIGTERM
/// raises `QuickExit`, SIGQUIT raises `TermExit`. Each handler does
/// nothing beyond raising the token and waking blocked waits.
pub fn install_signal_handlers(token: &ShutdownToken) -> Result<(), Error> {
    let handlers = [
        (SignalKind::interrupt(), Shutdown::Exit),
        (SignalKind::terminate(), Shutdown::QuickExit),
        (SignalKind::quit(), Shutdown::TermExit),
    ];
    for (kind, level) in handlers {
        let mut sig = signal(kind)?;
        let token = token.clone();
        tokio::spawn(async move {
            if sig.recv().await.is_some() {
                info!("signal received, raising {:?}", level);
                token.raise(level);
            }
        });
    }
    Ok(())
}
