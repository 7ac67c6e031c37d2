//! Cleanup actions run when the hypervisor connection drops.
//!
//! Hooks are registered by any subsystem that holds host-side state tied to
//! the connection. [`HookRegistry::on_disconnect`] starts every registered
//! hook on its own thread and then waits for each one, bounded by that
//! hook's own timeout. All hooks share one start instant, so waiting on them
//! one after another does not add their budgets together.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Handle returned by [`HookRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

type HookAction = Box<dyn FnOnce() + Send + 'static>;

/// A named cleanup action with an optional time budget.
pub struct DisconnectHook {
    name: String,
    timeout: Option<Duration>,
    action: HookAction,
}

impl DisconnectHook {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout: None,
            action: Box::new(action),
        }
    }

    /// Abandon the hook if it has not finished this long after disconnect.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl std::fmt::Debug for DisconnectHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisconnectHook")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Outcome of one [`HookRegistry::on_disconnect`] run, by hook name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    pub completed: Vec<String>,
    /// Still running when their timeout expired; left to finish on their own.
    pub abandoned: Vec<String>,
    /// Panicked, or could not be started.
    pub failed: Vec<String>,
}

impl DisconnectReport {
    pub fn total(&self) -> usize {
        self.completed.len() + self.abandoned.len() + self.failed.len()
    }
}

/// Thread-safe set of pending disconnect hooks.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: Mutex<Vec<(HookId, DisconnectHook)>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: DisconnectHook) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(hook = %hook.name, timeout = ?hook.timeout, "registered disconnect hook");
        self.hooks.lock().push((id, hook));
        id
    }

    /// Remove a hook before it runs. Returns false if it was already gone.
    pub fn remove(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.lock();
        match hooks.iter().position(|(hid, _)| *hid == id) {
            Some(idx) => {
                let (_, hook) = hooks.remove(idx);
                tracing::debug!(hook = %hook.name, "removed disconnect hook");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }

    /// Run every registered hook concurrently and wait for each within its
    /// budget. The registry is empty when this returns.
    pub fn on_disconnect(&self) -> DisconnectReport {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        let mut report = DisconnectReport::default();
        if hooks.is_empty() {
            return report;
        }

        tracing::info!(hooks = hooks.len(), "running disconnect hooks");
        let started = Instant::now();

        let mut pending = Vec::with_capacity(hooks.len());
        for (_, hook) in hooks {
            let DisconnectHook {
                name,
                timeout,
                action,
            } = hook;
            let (tx, rx) = mpsc::channel::<()>();
            let spawned = thread::Builder::new()
                .name(format!("hook-{}", name))
                .spawn(move || {
                    action();
                    // Receiver may be gone if the hook was abandoned.
                    let _ = tx.send(());
                });
            match spawned {
                Ok(_) => pending.push((name, timeout, rx)),
                Err(e) => {
                    tracing::error!(hook = %name, error = %e, "failed to start disconnect hook");
                    report.failed.push(name);
                }
            }
        }

        for (name, timeout, rx) in pending {
            let outcome = match timeout {
                Some(budget) => {
                    let remaining = (started + budget).saturating_duration_since(Instant::now());
                    rx.recv_timeout(remaining)
                }
                None => rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
            };
            match outcome {
                Ok(()) => report.completed.push(name),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    tracing::warn!(hook = %name, timeout = ?timeout, "disconnect hook timed out, abandoning");
                    report.abandoned.push(name);
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    tracing::warn!(hook = %name, "disconnect hook panicked");
                    report.failed.push(name);
                }
            }
        }

        tracing::info!(
            completed = report.completed.len(),
            abandoned = report.abandoned.len(),
            failed = report.failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "disconnect hooks finished"
        );
        report
    }
}
