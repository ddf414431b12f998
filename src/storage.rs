//! Storage seam for work records.
//!
//! The record table is the single source of truth for the whole pool.
//! Every method that must be atomic (claim, finalize, sweep) is one call
//! here, so each backend can wrap it in its own transaction.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::*;

/// Durable storage for one work type's records.
#[async_trait]
pub trait WorkStore<P: Payload>: Send + Sync {
    /// Insert a record, or update payload and `next_time` of the record with
    /// the same reference id. Identity and claim state survive the update.
    async fn upsert(
        &self,
        new: &NewWork<P>,
        next_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WorkRecord<P>>;

    /// Get a record by reference id.
    async fn get(&self, reference_id: &str) -> Result<Option<WorkRecord<P>>>;

    /// List records, earliest `next_time` first.
    async fn list(&self, limit: usize) -> Result<Vec<WorkRecord<P>>>;

    /// Delete by reference id. Returns whether a row was removed.
    async fn remove(&self, reference_id: &str) -> Result<bool>;

    /// Unclaimed records due at `now`, earliest `next_time` first.
    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkRecord<P>>>;

    /// Read the row for update and take the claim if nobody holds it.
    async fn claim(
        &self,
        reference_id: &str,
        now: DateTime<Utc>,
        provisional_next: DateTime<Utc>,
    ) -> Result<ClaimOutcome<P>>;

    /// Read the row for update and apply the release. Returns false if the
    /// row no longer exists.
    async fn finalize(&self, reference_id: &str, release: Release) -> Result<bool>;

    /// Force-release claims taken before `claimed_before`. Returns the
    /// reference ids that were released.
    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;
}

#[async_trait]
impl<P: Payload, S: WorkStore<P> + ?Sized> WorkStore<P> for Arc<S> {
    async fn upsert(
        &self,
        new: &NewWork<P>,
        next_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WorkRecord<P>> {
        (**self).upsert(new, next_time, now).await
    }

    async fn get(&self, reference_id: &str) -> Result<Option<WorkRecord<P>>> {
        (**self).get(reference_id).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<WorkRecord<P>>> {
        (**self).list(limit).await
    }

    async fn remove(&self, reference_id: &str) -> Result<bool> {
        (**self).remove(reference_id).await
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkRecord<P>>> {
        (**self).fetch_due(now, limit).await
    }

    async fn claim(
        &self,
        reference_id: &str,
        now: DateTime<Utc>,
        provisional_next: DateTime<Utc>,
    ) -> Result<ClaimOutcome<P>> {
        (**self).claim(reference_id, now, provisional_next).await
    }

    async fn finalize(&self, reference_id: &str, release: Release) -> Result<bool> {
        (**self).finalize(reference_id, release).await
    }

    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        (**self).release_stuck(claimed_before, now).await
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Store that keeps records in process memory, for tests or single-process
/// runs. The map lock plays the role of the row lock, so every call is
/// serialized exactly like a read-for-update transaction.
///
/// Clones share the same records; hand one clone to each schedule to model
/// several pool instances over one table.
pub struct MemoryWorkStore<P> {
    records: Arc<Mutex<HashMap<String, WorkRecord<P>>>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for MemoryWorkStore<P> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            _payload: PhantomData,
        }
    }
}

impl<P> Default for MemoryWorkStore<P> {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            _payload: PhantomData,
        }
    }
}

impl<P: Payload> MemoryWorkStore<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a raw record, bypassing upsert rules.
    pub fn put(&self, record: WorkRecord<P>) -> Result<()> {
        self.lock()?.insert(record.reference_id.clone(), record);
        Ok(())
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, WorkRecord<P>>>> {
        self.records
            .lock()
            .map_err(|_| Error::Other("memory work store poisoned".to_string()))
    }
}

fn sorted_by_next_time<P: Clone>(
    records: impl Iterator<Item = WorkRecord<P>>,
    limit: usize,
) -> Vec<WorkRecord<P>> {
    let mut out: Vec<_> = records.collect();
    out.sort_by(|a, b| {
        a.next_time
            .cmp(&b.next_time)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    out.truncate(limit);
    out
}

#[async_trait]
impl<P: Payload> WorkStore<P> for MemoryWorkStore<P> {
    async fn upsert(
        &self,
        new: &NewWork<P>,
        next_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WorkRecord<P>> {
        let mut records = self.lock()?;
        let record = records
            .entry(new.reference_id.clone())
            .and_modify(|existing| {
                existing.payload = new.payload.clone();
                existing.next_time = next_time;
                existing.updated_at = now;
            })
            .or_insert_with(|| WorkRecord {
                id: WorkId::new(),
                reference_id: new.reference_id.clone(),
                acquired: false,
                next_time,
                acquiring_time: None,
                payload: new.payload.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(record.clone())
    }

    async fn get(&self, reference_id: &str) -> Result<Option<WorkRecord<P>>> {
        Ok(self.lock()?.get(reference_id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<WorkRecord<P>>> {
        let records = self.lock()?;
        Ok(sorted_by_next_time(records.values().cloned(), limit))
    }

    async fn remove(&self, reference_id: &str) -> Result<bool> {
        Ok(self.lock()?.remove(reference_id).is_some())
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkRecord<P>>> {
        let records = self.lock()?;
        let due = records.values().filter(|r| r.is_due(now)).cloned();
        Ok(sorted_by_next_time(due, limit))
    }

    async fn claim(
        &self,
        reference_id: &str,
        now: DateTime<Utc>,
        provisional_next: DateTime<Utc>,
    ) -> Result<ClaimOutcome<P>> {
        let mut records = self.lock()?;
        let Some(record) = records.get_mut(reference_id) else {
            return Ok(ClaimOutcome::Missing);
        };
        if record.acquired {
            return Ok(ClaimOutcome::AlreadyAcquired);
        }
        record.acquired = true;
        record.acquiring_time = Some(now);
        record.next_time = provisional_next;
        record.updated_at = now;
        Ok(ClaimOutcome::Claimed(record.clone()))
    }

    async fn finalize(&self, reference_id: &str, release: Release) -> Result<bool> {
        let mut records = self.lock()?;
        match release {
            Release::Complete => Ok(records.remove(reference_id).is_some()),
            Release::Reschedule { next_time, now } => {
                let Some(record) = records.get_mut(reference_id) else {
                    return Ok(false);
                };
                record.acquired = false;
                record.next_time = next_time;
                record.acquiring_time = Some(now);
                record.updated_at = now;
                Ok(true)
            }
        }
    }

    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut records = self.lock()?;
        let mut released = Vec::new();
        for record in records.values_mut() {
            if record.is_stuck(claimed_before) {
                record.acquired = false;
                record.updated_at = now;
                released.push(record.reference_id.clone());
            }
        }
        Ok(released)
    }
}
