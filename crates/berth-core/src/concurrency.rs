use crate::EngineError;
use berth_runtime::RuntimeError;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, finishing current operation...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Cooperative cancellation flag shared between a caller and an engine.
///
/// Cancelling never interrupts a runtime call in progress; the engine checks
/// the token between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    follow_shutdown: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token nobody else holds.
    pub fn never() -> Self {
        Self::default()
    }

    /// A token that also reports cancelled once Ctrl-C was pressed.
    pub fn from_shutdown() -> Self {
        Self {
            flag: Arc::default(),
            follow_shutdown: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.follow_shutdown && shutdown_requested())
    }
}

/// Run a blocking runtime call on a helper thread, giving up after `timeout`.
///
/// On timeout the helper thread is left to finish on its own and its result
/// is discarded. Use [`run_tracked`] when a late result must be cleaned up.
pub fn run_with_timeout<T, F>(
    op: &'static str,
    target: &str,
    timeout: Duration,
    f: F,
) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RuntimeError> + Send + 'static,
{
    run_tracked(op, target, timeout, f).map_err(|failed| failed.error)
}

/// A failed [`run_tracked`] call. `late` is set when the call overran its
/// timeout and may still complete.
pub struct CallFailed<T> {
    pub error: EngineError,
    pub late: Option<LateCall<T>>,
}

/// A runtime call still running past its timeout.
pub struct LateCall<T> {
    op: &'static str,
    target: String,
    rx: Receiver<Result<T, RuntimeError>>,
}

impl<T> LateCall<T> {
    /// Wait up to `grace` for the call to finish. Returns its value only if
    /// it finished and succeeded.
    pub fn settle(self, grace: Duration) -> Option<T> {
        match self.rx.recv_timeout(grace) {
            Ok(Ok(value)) => {
                debug!("late {} of '{}' completed", self.op, self.target);
                Some(value)
            }
            Ok(Err(e)) => {
                debug!("late {} of '{}' failed: {e}", self.op, self.target);
                None
            }
            Err(_) => {
                warn!(
                    "{} of '{}' still unfinished after {grace:?} grace, giving up on it",
                    self.op, self.target
                );
                None
            }
        }
    }
}

/// Like [`run_with_timeout`], but on timeout hands back a [`LateCall`] so the
/// caller can collect whatever the call eventually produces.
pub fn run_tracked<T, F>(
    op: &'static str,
    target: &str,
    timeout: Duration,
    f: F,
) -> Result<T, CallFailed<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RuntimeError> + Send + 'static,
{
    let failed = |error| CallFailed { error, late: None };
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name(format!("berth-{op}"))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| failed(EngineError::Io(e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result.map_err(|source| {
            failed(EngineError::Machine {
                machine: target.to_owned(),
                op,
                source,
            })
        }),
        Err(RecvTimeoutError::Timeout) => {
            warn!("{op} of '{target}' still running after {timeout:?}, abandoning it");
            Err(CallFailed {
                error: EngineError::Timeout {
                    op,
                    target: target.to_owned(),
                    after: timeout,
                },
                late: Some(LateCall {
                    op,
                    target: target.to_owned(),
                    rx,
                }),
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(failed(EngineError::WorkerLost {
            op,
            target: target.to_owned(),
        })),
    }
}
