//! Work schedule: the local worker pool plus the claim → run → release
//! state machine for one work type.
//!
//! Many processes can run a schedule for the same work type against the
//! same table. They never talk to each other about ownership: a record is
//! owned by whoever commits the claim transaction. The local bookkeeping
//! here (tracked ids, pending counter) only cuts down on claim attempts
//! that would lose anyway.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::handler::WorkHandler;
use super::pool::PoolPublisher;
use crate::config::ScheduleConfig;
use crate::error::{Error, Result};
use crate::model::*;
use crate::runner::PeriodicRunner;
use crate::storage::WorkStore;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// Why `do_work` returned without running the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another worker in this process is already executing the id.
    RunningLocally,
    /// The record handed in was already claimed when it was read.
    AcquiredSnapshot,
    /// The row was gone by the time the claim transaction read it.
    Missing,
    /// Another executor committed its claim first.
    ClaimedElsewhere,
}

/// What one `do_work` pass did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Skipped(SkipReason),
    /// Handler reported done; the row is deleted.
    Completed,
    /// Handler asked for another run; the row is released until then.
    Rescheduled(DateTime<Utc>),
    /// The row was removed while the handler ran.
    Vanished,
}

/// Snapshot of local scheduler load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleStats {
    /// Records queued locally or executing.
    pub pending: usize,
    /// Records whose handler is executing right now.
    pub running: usize,
    pub started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalState {
    Queued,
    Running,
}

enum Enqueue {
    Queued,
    AlreadyTracked,
    Stopped,
}

/// Scheduler for one work type. Cheap to clone; clones share state.
pub struct WorkSchedule<P: Payload> {
    inner: Arc<Inner<P>>,
}

impl<P: Payload> Clone for WorkSchedule<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<P: Payload> {
    work_type: String,
    config: ScheduleConfig,
    store: Arc<dyn WorkStore<P>>,
    handler: Arc<dyn WorkHandler<P>>,
    local: Mutex<HashMap<String, LocalState>>,
    pending: AtomicUsize,
    polling: AtomicBool,
    started: AtomicBool,
    last_sweep: Mutex<Option<Instant>>,
    queue_tx: mpsc::Sender<WorkRecord<P>>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkRecord<P>>>>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    runner: Mutex<Option<PeriodicRunner>>,
    publisher: RwLock<Option<PoolPublisher>>,
}

/// Clears the single-flight flag when a poll cycle ends, however it ends.
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<P: Payload> WorkSchedule<P> {
    pub fn new(
        work_type: impl Into<String>,
        config: ScheduleConfig,
        store: impl WorkStore<P> + 'static,
        handler: impl WorkHandler<P>,
    ) -> Result<Self> {
        config.validate()?;
        let (queue_tx, queue_rx) = mpsc::channel(config.parallelism);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                work_type: work_type.into(),
                config,
                store: Arc::new(store),
                handler: Arc::new(handler),
                local: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                polling: AtomicBool::new(false),
                started: AtomicBool::new(false),
                last_sweep: Mutex::new(None),
                queue_tx,
                queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
                stop_tx,
                workers: Mutex::new(Vec::new()),
                runner: Mutex::new(None),
                publisher: RwLock::new(None),
            }),
        })
    }

    pub fn work_type(&self) -> &str {
        &self.inner.work_type
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> ScheduleStats {
        let running = self
            .local()
            .map(|local| {
                local
                    .values()
                    .filter(|s| **s == LocalState::Running)
                    .count()
            })
            .unwrap_or(0);
        ScheduleStats {
            pending: self.inner.pending.load(Ordering::Acquire),
            running,
            started: self.inner.started.load(Ordering::Acquire),
        }
    }

    /// Route `PostMode::Immediate` posts through the pool bus from now on.
    pub fn attach_publisher(&self, publisher: PoolPublisher) {
        if let Ok(mut slot) = self.inner.publisher.write() {
            *slot = Some(publisher);
        }
    }

    fn publisher(&self) -> Option<PoolPublisher> {
        self.inner
            .publisher
            .read()
            .ok()
            .and_then(|slot| slot.clone())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the workers and start the poll runner.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidState(format!(
                "work schedule {} is already started",
                inner.work_type
            )));
        }
        inner.stop_tx.send_replace(false);

        {
            let mut workers = lock(&inner.workers)?;
            for index in 0..inner.config.parallelism {
                let schedule = self.clone();
                workers.push(tokio::spawn(schedule.worker_loop(index)));
            }
        }

        let poll_target = Arc::downgrade(inner);
        let stop_target = Arc::downgrade(inner);
        let runner = PeriodicRunner::new(
            format!("{}.poll", inner.work_type),
            inner.config.poll_interval(),
            move || {
                let target: Weak<Inner<P>> = poll_target.clone();
                async move {
                    if let Some(inner) = target.upgrade() {
                        WorkSchedule { inner }.process_works().await;
                    }
                }
            },
        )
        .on_stop(move || {
            if let Some(inner) = stop_target.upgrade() {
                inner.stop_tx.send_replace(true);
            }
        });
        runner.start()?;
        *lock(&inner.runner)? = Some(runner);

        info!(
            work_type = %inner.work_type,
            parallelism = inner.config.parallelism,
            bucket_size = inner.config.bucket_size,
            "work schedule started"
        );
        Ok(())
    }

    /// Stop polling, let the workers drain the local queue, and wait for
    /// them. A running handler is never interrupted.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.started.load(Ordering::Acquire) {
            return Ok(());
        }
        inner.stop_tx.send_replace(true);

        let runner = lock(&inner.runner)?.take();
        if let Some(runner) = runner {
            runner.stop().await?;
        }

        let workers = std::mem::take(&mut *lock(&inner.workers)?);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(work_type = %inner.work_type, "worker task failed: {e}");
            }
        }

        inner.started.store(false, Ordering::Release);
        info!(work_type = %inner.work_type, "work schedule stopped");
        Ok(())
    }

    fn is_stopping(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    // -----------------------------------------------------------------------
    // Posting
    // -----------------------------------------------------------------------

    /// Durably record work, then hand it to the fast path if `mode` asks.
    ///
    /// Only the durable write can fail the call. Once it succeeds the record
    /// will run eventually; fast-path trouble is logged and absorbed.
    pub async fn post_work(
        &self,
        new: NewWork<P>,
        mode: PostMode,
        scope: Option<&str>,
    ) -> Result<WorkRecord<P>> {
        let inner = &self.inner;
        let now = Utc::now();
        let next_time = new.next_time.unwrap_or_else(|| {
            if mode.is_immediate() {
                now
            } else {
                offset(now, inner.config.invocation_interval())
            }
        });

        let record = inner.store.upsert(&new, next_time, now).await?;
        metrics::work_posted().add(
            1,
            &[
                KeyValue::new("work_type", inner.work_type.clone()),
                KeyValue::new("mode", mode.to_string()),
            ],
        );
        debug!(
            work_type = %inner.work_type,
            reference_id = %record.reference_id,
            %mode,
            next_time = %record.next_time,
            "work posted"
        );

        match mode {
            PostMode::Scheduled => {}
            PostMode::Immediate => match self.publisher() {
                Some(publisher) => {
                    if let Err(e) = publisher.invoke_work(&record, mode, scope).await {
                        warn!(
                            work_type = %inner.work_type,
                            reference_id = %record.reference_id,
                            error = %e,
                            "fast-path publish failed, leaving work to the poll cycle"
                        );
                    }
                }
                None => {
                    self.invoke_work(record.clone());
                }
            },
            PostMode::Local => {
                self.invoke_work(record.clone());
            }
        }

        Ok(record)
    }

    /// Delete a record by reference id. Absent records are not an error.
    pub async fn remove_work(&self, reference_id: &str) -> Result<bool> {
        let removed = self.inner.store.remove(reference_id).await?;
        debug!(work_type = %self.inner.work_type, reference_id, removed, "work removed");
        Ok(removed)
    }

    pub async fn get_work(&self, reference_id: &str) -> Result<Option<WorkRecord<P>>> {
        self.inner.store.get(reference_id).await
    }

    pub async fn list_work(&self, limit: usize) -> Result<Vec<WorkRecord<P>>> {
        self.inner.store.list(limit).await
    }

    /// Fast path: queue a record on this process without waiting for the
    /// next poll tick. Returns false if the schedule isn't running or the id
    /// is already queued or executing here.
    pub fn invoke_work(&self, record: WorkRecord<P>) -> bool {
        if !self.inner.started.load(Ordering::Acquire) || self.is_stopping() {
            return false;
        }
        if !self.track(&record.reference_id) {
            return false;
        }
        let schedule = self.clone();
        tokio::spawn(async move {
            schedule.push(record).await;
        });
        true
    }

    // -----------------------------------------------------------------------
    // Poll cycle
    // -----------------------------------------------------------------------

    /// One poll cycle: sweep stuck claims when due, then pull due records
    /// into the local queue until capacity or due records run out.
    ///
    /// Overlapping calls collapse: while one cycle runs, others return
    /// immediately.
    pub async fn process_works(&self) {
        let inner = &self.inner;
        if inner
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _guard = PollGuard(&inner.polling);

        if self.is_stopping() {
            return;
        }

        if self.sweep_due() {
            if let Err(e) = self.sweep_stuck().await {
                error!(work_type = %inner.work_type, error = %e, "stuck-claim sweep failed");
            }
        }

        loop {
            let pending = inner.pending.load(Ordering::Acquire);
            let capacity = inner.config.bucket_size.saturating_sub(pending);
            if capacity == 0 {
                debug!(work_type = %inner.work_type, pending, "local bucket full");
                return;
            }

            // Rows queued here but not yet claimed still look due; fetch past them.
            let tracked = self.local().map(|local| local.len()).unwrap_or(0);
            let due = match inner.store.fetch_due(Utc::now(), capacity + tracked).await {
                Ok(due) => due,
                Err(e) => {
                    error!(work_type = %inner.work_type, error = %e, "failed to fetch due work");
                    return;
                }
            };
            if due.is_empty() || self.is_stopping() {
                return;
            }

            let mut queued = 0usize;
            for record in due {
                if queued == capacity {
                    break;
                }
                match self.enqueue(record).await {
                    Enqueue::Queued => queued += 1,
                    Enqueue::AlreadyTracked => {}
                    Enqueue::Stopped => return,
                }
            }
            // Everything returned is already queued or running here.
            if queued == 0 {
                return;
            }
            debug!(work_type = %inner.work_type, queued, "due work queued");
        }
    }

    /// Release claims older than the stuck threshold. Returns how many.
    pub async fn sweep_stuck(&self) -> Result<usize> {
        let inner = &self.inner;
        let now = Utc::now();
        let cutoff = offset_back(now, inner.config.stuck_threshold());
        let released = inner.store.release_stuck(cutoff, now).await?;

        if !released.is_empty() {
            metrics::stuck_released().add(
                released.len() as u64,
                &[KeyValue::new("work_type", inner.work_type.clone())],
            );
            for reference_id in &released {
                warn!(
                    work_type = %inner.work_type,
                    reference_id = %reference_id,
                    "released abandoned claim"
                );
            }
        }
        Ok(released.len())
    }

    fn sweep_due(&self) -> bool {
        let Ok(mut last) = lock(&self.inner.last_sweep) else {
            return false;
        };
        let interval = self.inner.config.sweep_interval();
        let due = last.is_none_or(|at| at.elapsed() >= interval);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// Track, then block on the queue until a worker has room or the
    /// schedule stops.
    async fn enqueue(&self, record: WorkRecord<P>) -> Enqueue {
        if !self.track(&record.reference_id) {
            return Enqueue::AlreadyTracked;
        }
        if self.push(record).await {
            Enqueue::Queued
        } else {
            Enqueue::Stopped
        }
    }

    /// Push an already tracked record. Undoes the tracking if the schedule
    /// stops first.
    async fn push(&self, record: WorkRecord<P>) -> bool {
        let inner = &self.inner;
        inner.pending.fetch_add(1, Ordering::AcqRel);
        let reference_id = record.reference_id.clone();
        let mut stop_rx = inner.stop_tx.subscribe();

        let sent = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => false,
            sent = inner.queue_tx.send(record) => sent.is_ok(),
        };

        if !sent {
            inner.pending.fetch_sub(1, Ordering::AcqRel);
            self.untrack(&reference_id);
        }
        sent
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    async fn worker_loop(self, index: usize) {
        let inner = Arc::clone(&self.inner);
        let mut stop_rx = inner.stop_tx.subscribe();
        debug!(work_type = %inner.work_type, worker = index, "worker started");

        loop {
            let next = {
                let mut rx = inner.queue_rx.lock().await;
                if *stop_rx.borrow() {
                    rx.try_recv().ok()
                } else {
                    tokio::select! {
                        record = rx.recv() => record,
                        _ = stop_rx.wait_for(|stopped| *stopped) => rx.try_recv().ok(),
                    }
                }
            };
            let Some(record) = next else {
                break;
            };

            let reference_id = record.reference_id.clone();
            match self.do_work(record).await {
                Ok(disposition) => {
                    debug!(
                        work_type = %inner.work_type,
                        reference_id = %reference_id,
                        ?disposition,
                        "work pass finished"
                    );
                }
                Err(e) => {
                    warn!(
                        work_type = %inner.work_type,
                        reference_id = %reference_id,
                        error = %e,
                        "work pass failed"
                    );
                }
            }

            inner.pending.fetch_sub(1, Ordering::AcqRel);
            self.untrack(&reference_id);
            self.trigger_poll();
        }

        debug!(work_type = %inner.work_type, worker = index, "worker exited");
    }

    /// Refill freed capacity without waiting for the next tick.
    fn trigger_poll(&self) {
        if self.is_stopping() {
            return;
        }
        let schedule = self.clone();
        tokio::spawn(async move {
            schedule.process_works().await;
        });
    }

    // -----------------------------------------------------------------------
    // Claim → run → release
    // -----------------------------------------------------------------------

    /// Claim the record, run the handler, and write back the outcome.
    ///
    /// Races (already running here, claimed elsewhere, deleted) come back as
    /// `Disposition::Skipped`. An error means storage failed; when finalize
    /// fails the claim stays in place until the stuck sweep releases it, and
    /// a handler error takes priority in the returned error.
    pub async fn do_work(&self, record: WorkRecord<P>) -> Result<Disposition> {
        let span = start_work_span(&self.inner.work_type, &record.reference_id);
        self.execute(record, span.clone()).instrument(span).await
    }

    async fn execute(&self, record: WorkRecord<P>, span: Span) -> Result<Disposition> {
        let inner = &self.inner;
        let reference_id = record.reference_id.clone();

        if let Some(reason) = self.mark_running(&record) {
            warn!(reference_id = %reference_id, ?reason, "skipping work already claimed");
            return Ok(Disposition::Skipped(reason));
        }
        let _running = RunningGuard {
            schedule: self,
            reference_id: &reference_id,
        };

        // Claim. The provisional next_time is the floor the stuck sweep works
        // from if this process dies mid-run.
        let now = Utc::now();
        let provisional = offset(now, inner.config.claim_interval());
        let claim = inner.store.claim(&reference_id, now, provisional).await;
        let claim_result = match &claim {
            Ok(ClaimOutcome::Claimed(_)) => "claimed",
            Ok(ClaimOutcome::Missing) => "missing",
            Ok(ClaimOutcome::AlreadyAcquired) => "acquired",
            Err(_) => "error",
        };
        metrics::work_claims().add(
            1,
            &[
                KeyValue::new("work_type", inner.work_type.clone()),
                KeyValue::new("result", claim_result),
            ],
        );
        let claimed = match claim {
            Ok(ClaimOutcome::Claimed(claimed)) => claimed,
            Ok(ClaimOutcome::Missing) => {
                debug!(reference_id = %reference_id, "work gone before claim");
                return Ok(Disposition::Skipped(SkipReason::Missing));
            }
            Ok(ClaimOutcome::AlreadyAcquired) => {
                debug!(reference_id = %reference_id, "work claimed by another executor");
                return Ok(Disposition::Skipped(SkipReason::ClaimedElsewhere));
            }
            Err(e) => {
                error!(reference_id = %reference_id, error = %e, "claim transaction failed");
                return Err(e);
            }
        };
        record_state_transition(&span, "due", "claimed");

        // Run.
        let started = Instant::now();
        let outcome = AssertUnwindSafe(inner.handler.handle(&claimed))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| WorkOutcome::retry().with_error("work handler panicked"));
        metrics::work_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("work_type", inner.work_type.clone())],
        );
        if let Some(ref err) = outcome.error {
            warn!(
                reference_id = %reference_id,
                done = outcome.done,
                error = %err,
                "work handler reported an error"
            );
        }

        // Finalize.
        let now = Utc::now();
        let release = if outcome.done {
            Release::Complete
        } else {
            Release::Reschedule {
                next_time: outcome
                    .next_time
                    .unwrap_or_else(|| offset(now, inner.config.invocation_interval())),
                now,
            }
        };

        let disposition = match inner.store.finalize(&reference_id, release).await {
            Ok(true) => match release {
                Release::Complete => Disposition::Completed,
                Release::Reschedule { next_time, .. } => Disposition::Rescheduled(next_time),
            },
            Ok(false) => Disposition::Vanished,
            Err(e) => {
                error!(
                    reference_id = %reference_id,
                    error = %e,
                    "finalize failed, claim left for the stuck sweep"
                );
                self.count_finalized("failed");
                return Err(match outcome.error {
                    Some(err) => Error::Handler(err),
                    None => e,
                });
            }
        };

        let (state, label) = match disposition {
            Disposition::Completed => ("completed", "completed"),
            Disposition::Rescheduled(_) => ("released", "rescheduled"),
            _ => ("vanished", "vanished"),
        };
        record_state_transition(&span, "claimed", state);
        self.count_finalized(label);
        Ok(disposition)
    }

    fn count_finalized(&self, result: &'static str) {
        metrics::work_finalized().add(
            1,
            &[
                KeyValue::new("work_type", self.inner.work_type.clone()),
                KeyValue::new("result", result),
            ],
        );
    }

    // -----------------------------------------------------------------------
    // Local bookkeeping
    // -----------------------------------------------------------------------

    fn local(&self) -> Result<MutexGuard<'_, HashMap<String, LocalState>>> {
        lock(&self.inner.local)
    }

    /// Start tracking an id as queued. False if it's already tracked.
    fn track(&self, reference_id: &str) -> bool {
        let Ok(mut local) = self.local() else {
            return false;
        };
        if local.contains_key(reference_id) {
            return false;
        }
        local.insert(reference_id.to_string(), LocalState::Queued);
        true
    }

    fn untrack(&self, reference_id: &str) {
        if let Ok(mut local) = self.local() {
            local.remove(reference_id);
        }
    }

    /// Local fast-reject, then mark the id as executing here.
    fn mark_running(&self, record: &WorkRecord<P>) -> Option<SkipReason> {
        let Ok(mut local) = self.local() else {
            return Some(SkipReason::RunningLocally);
        };
        if local.get(&record.reference_id) == Some(&LocalState::Running) {
            return Some(SkipReason::RunningLocally);
        }
        if record.acquired {
            return Some(SkipReason::AcquiredSnapshot);
        }
        local.insert(record.reference_id.clone(), LocalState::Running);
        None
    }
}

/// Drops the running mark however `execute` exits.
struct RunningGuard<'a, P: Payload> {
    schedule: &'a WorkSchedule<P>,
    reference_id: &'a str,
}

impl<P: Payload> Drop for RunningGuard<'_, P> {
    fn drop(&mut self) {
        self.schedule.untrack(self.reference_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Other("work schedule state poisoned".to_string()))
}

/// `now + by`, saturating at the far future.
pub(crate) fn offset(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - by`, saturating at the far past.
fn offset_back(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_saturates_instead_of_overflowing() {
        let now = Utc::now();
        assert_eq!(offset(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(offset_back(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn offset_adds_exact_interval() {
        let now = Utc::now();
        let later = offset(now, Duration::from_secs(90));
        assert_eq!(later - now, TimeDelta::seconds(90));
    }
}
