//! Periodic runner: one background task that invokes a callback on a fixed
//! period.
//!
//! The callback runs once immediately on [`PeriodicRunner::start`], then
//! after every `interval` of quiet. [`PeriodicRunner::wake`] runs it early;
//! [`PeriodicRunner::stop`] lets the current invocation finish, starts no
//! new one, and waits for the task to exit.
//!
//! ```text
//! Idle --start--> Running --stop--> Stopping --task exited--> Idle
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};

type Callback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type StopCallback = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle of a [`PeriodicRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Stopping,
}

/// Signals shared with one background task. Fresh per start, so a stale
/// wake permit from a previous run never leaks into the next.
#[derive(Default)]
struct Signals {
    stopped: AtomicBool,
    stop: Notify,
    wake: Notify,
}

struct Active {
    signals: Arc<Signals>,
    task: JoinHandle<()>,
}

struct Inner {
    state: RunnerState,
    active: Option<Active>,
}

pub struct PeriodicRunner {
    name: String,
    interval: Duration,
    callback: Callback,
    on_stop: Option<StopCallback>,
    inner: Mutex<Inner>,
}

impl PeriodicRunner {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            callback: Arc::new(move || callback().boxed()),
            on_stop: None,
            inner: Mutex::new(Inner {
                state: RunnerState::Idle,
                active: None,
            }),
        }
    }

    /// Invoked from [`stop`](Self::stop) before the task is signalled.
    pub fn on_stop<F>(mut self, on_stop: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(on_stop));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> RunnerState {
        self.lock().map(|inner| inner.state).unwrap_or(RunnerState::Idle)
    }

    /// Launch the background task. Fails unless the runner is idle.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.state != RunnerState::Idle {
            return Err(Error::InvalidState(format!(
                "runner {} is already {:?}",
                self.name, inner.state
            )));
        }

        let signals = Arc::new(Signals::default());
        let task = tokio::spawn(run_loop(
            self.name.clone(),
            self.interval,
            Arc::clone(&self.callback),
            Arc::clone(&signals),
        ));

        inner.active = Some(Active { signals, task });
        inner.state = RunnerState::Running;
        info!(runner = %self.name, interval_ms = self.interval.as_millis() as u64, "runner started");
        Ok(())
    }

    /// Run the callback as soon as the current wait ends. No-op when idle.
    pub fn wake(&self) {
        if let Ok(inner) = self.lock() {
            if let Some(ref active) = inner.active {
                active.signals.wake.notify_one();
            }
        }
    }

    /// Stop the background task and wait for it to exit. No-op when idle.
    pub async fn stop(&self) -> Result<()> {
        let active = {
            let mut inner = self.lock()?;
            let Some(active) = inner.active.take() else {
                return Ok(());
            };
            inner.state = RunnerState::Stopping;
            active
        };

        active.signals.stopped.store(true, Ordering::SeqCst);
        if let Some(ref on_stop) = self.on_stop {
            on_stop();
        }
        active.signals.stop.notify_one();

        let joined = active.task.await;
        self.lock()?.state = RunnerState::Idle;

        match joined {
            Ok(()) => {
                info!(runner = %self.name, "runner stopped");
                Ok(())
            }
            Err(e) => Err(Error::Other(format!("runner {} task failed: {e}", self.name))),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other(format!("runner {} state poisoned", self.name)))
    }
}

impl Drop for PeriodicRunner {
    fn drop(&mut self) {
        // Dropped without stop(): let the task wind down on its own.
        let Ok(inner) = self.inner.get_mut() else {
            return;
        };
        if let Some(active) = inner.active.take() {
            active.signals.stopped.store(true, Ordering::SeqCst);
            active.signals.stop.notify_one();
        }
    }
}

async fn run_loop(name: String, interval: Duration, callback: Callback, signals: Arc<Signals>) {
    callback().await;

    loop {
        tokio::select! {
            _ = signals.stop.notified() => {
                if signals.stopped.load(Ordering::SeqCst) {
                    break;
                }
            }
            _ = signals.wake.notified() => {
                if signals.stopped.load(Ordering::SeqCst) {
                    break;
                }
                debug!(runner = %name, "woken early");
                callback().await;
            }
            _ = tokio::time::sleep(interval) => {
                if signals.stopped.load(Ordering::SeqCst) {
                    break;
                }
                callback().await;
            }
        }
    }

    debug!(runner = %name, "runner loop exited");
}
