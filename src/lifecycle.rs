use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::debug;

use crate::error::{PeerError, Result};

/// Construction state of a component.
///
/// `Initializing` is the only non-terminal status. `Active` and
/// `Incapacitated` are reached by the initializer's outcome; `Destroyed` is
/// reached by cancelling a still-initializing component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Initializing,
    Active,
    Incapacitated,
    Destroyed,
}

impl LifecycleStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Initializing
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

struct Shared {
    subject: &'static str,
    status: watch::Sender<LifecycleStatus>,
    error: Mutex<Option<PeerError>>,
    started: AtomicBool,
    cancel_hook: Mutex<Option<CancelHook>>,
}

/// Handle that completes a component's initialization off its constructor.
///
/// The handle is cloneable; the owning component keeps one copy and exposes
/// it so dependents can `assert()` (synchronous) or `wait()` (awaitable)
/// before touching the target. When initialization is synchronous (the
/// common case, because most state is eagerly loaded), `active()` or
/// `start_sync` make every later `wait()` resolve without suspending.
#[derive(Clone)]
pub struct AsyncConstruction {
    shared: Arc<Shared>,
}

impl AsyncConstruction {
    /// A handle whose initializer will be supplied later via `start` or
    /// `start_sync`.
    pub fn new(subject: &'static str) -> Self {
        Self::with_status(subject, LifecycleStatus::Initializing)
    }

    /// Fast path for components that construct synchronously: immediately
    /// `Active`, awaiters never suspend.
    pub fn active(subject: &'static str) -> Self {
        let handle = Self::with_status(subject, LifecycleStatus::Active);
        handle.shared.started.store(true, Ordering::SeqCst);
        handle
    }

    fn with_status(subject: &'static str, status: LifecycleStatus) -> Self {
        let (status_tx, _) = watch::channel(status);
        Self {
            shared: Arc::new(Shared {
                subject,
                status: status_tx,
                error: Mutex::new(None),
                started: AtomicBool::new(false),
                cancel_hook: Mutex::new(None),
            }),
        }
    }

    /// Runs the deferred initializer on a background task. Awaiters parked
    /// on `wait()` resolve once it completes. A second `start` (or a start
    /// after `start_sync`) is refused.
    pub fn start<F>(&self, init: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.claim_start()?;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let outcome = init.await;
            finish(&shared, outcome);
        });
        Ok(())
    }

    /// Applies a synchronously computed initializer outcome.
    pub fn start_sync(&self, outcome: Result<()>) -> Result<()> {
        self.claim_start()?;
        finish(&self.shared, outcome);
        Ok(())
    }

    fn claim_start(&self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(PeerError::implementation(format!(
                "{} was started twice",
                self.shared.subject
            )));
        }
        Ok(())
    }

    pub fn ready(&self) -> bool {
        self.status() == LifecycleStatus::Active
    }

    pub fn status(&self) -> LifecycleStatus {
        *self.shared.status.borrow()
    }

    pub fn error(&self) -> Option<PeerError> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Synchronous usability check.
    ///
    /// Not-yet-ready and cancelled states report as an uninitialized
    /// dependency; a failed construction reports as incapacitated, carrying
    /// the original cause.
    pub fn assert(&self) -> Result<()> {
        match self.status() {
            LifecycleStatus::Active => Ok(()),
            LifecycleStatus::Incapacitated => Err(PeerError::IncapacitatedDependency {
                subject: self.shared.subject.to_string(),
                cause: Arc::new(self.error().unwrap_or_else(|| {
                    PeerError::implementation("initialization failed without a recorded cause")
                })),
            }),
            status => Err(PeerError::UninitializedDependency {
                subject: self.shared.subject.to_string(),
                status,
            }),
        }
    }

    /// Awaits the terminal construction status.
    ///
    /// Resolves once the component is `Active`; rejects with the original
    /// failure when construction failed, and with an uninitialized-dependency
    /// error when it was cancelled. Awaiting before `start` simply parks
    /// until an initializer is supplied and finishes.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.shared.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return match status {
                    LifecycleStatus::Active => Ok(()),
                    _ => self.assert(),
                };
            }
            if rx.changed().await.is_err() {
                // Owner dropped while initializing; report as uninitialized.
                return Err(PeerError::UninitializedDependency {
                    subject: self.shared.subject.to_string(),
                    status: LifecycleStatus::Destroyed,
                });
            }
        }
    }

    /// Installs the hook invoked by `cancel()`.
    pub fn set_cancel_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self
            .shared
            .cancel_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    /// Cancels an in-flight construction.
    ///
    /// Without a cancel hook this is a no-op. With one, the hook runs, the
    /// status becomes `Destroyed`, and every awaiter observes the rejection;
    /// cancellation never leaves awaiters hanging. Terminal states are left
    /// untouched.
    pub fn cancel(&self) {
        if self.status().is_terminal() {
            return;
        }
        let hook = self
            .shared
            .cancel_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(hook) = hook else {
            return;
        };
        hook();
        self.shared.status.send_modify(|status| {
            if !status.is_terminal() {
                *status = LifecycleStatus::Destroyed;
            }
        });
        debug!(subject = self.shared.subject, "construction cancelled");
    }
}

fn finish(shared: &Shared, outcome: Result<()>) {
    if let Err(err) = &outcome {
        *shared.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.clone());
    }
    shared.status.send_modify(|status| {
        // A cancellation that won the race keeps its terminal status.
        if !status.is_terminal() {
            *status = match outcome {
                Ok(()) => LifecycleStatus::Active,
                Err(_) => LifecycleStatus::Incapacitated,
            };
        }
    });
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
