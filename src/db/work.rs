//! Work record operations: upsert by reference id, row claims, release.
//!
//! Claim and finalize each run in their own transaction around a
//! `SELECT ... FOR UPDATE`, so two claimants of the same row serialize on
//! the row lock and exactly one of them sees it unclaimed.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::model::*;
use crate::storage::WorkStore;

const RECORD_COLUMNS: &str =
    "id, reference_id, acquired, next_time, acquiring_time, payload, created_at, updated_at";

/// Postgres-backed record store for one work type.
pub struct PgWorkStore<P> {
    pool: PgPool,
    work_type: String,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for PgWorkStore<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            work_type: self.work_type.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P: Payload> PgWorkStore<P> {
    pub fn new(pool: PgPool, work_type: impl Into<String>) -> Self {
        Self {
            pool,
            work_type: work_type.into(),
            _payload: PhantomData,
        }
    }

    pub fn work_type(&self) -> &str {
        &self.work_type
    }
}

#[async_trait]
impl<P: Payload> WorkStore<P> for PgWorkStore<P> {
    async fn upsert(
        &self,
        new: &NewWork<P>,
        next_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WorkRecord<P>> {
        let payload = serde_json::to_value(&new.payload)?;

        // A re-post of a claimed row keeps the claim; the running executor
        // overwrites next_time when it finalizes.
        let row: WorkRecordRow = sqlx::query_as(&format!(
            "INSERT INTO work_records (id, work_type, reference_id, acquired, next_time, payload, created_at, updated_at)
             VALUES ($1, $2, $3, FALSE, $4, $5, $6, $6)
             ON CONFLICT (work_type, reference_id)
             DO UPDATE SET next_time = EXCLUDED.next_time,
                           payload = EXCLUDED.payload,
                           updated_at = EXCLUDED.updated_at
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&self.work_type)
        .bind(&new.reference_id)
        .bind(next_time)
        .bind(&payload)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into_record()
    }

    async fn get(&self, reference_id: &str) -> Result<Option<WorkRecord<P>>> {
        let row: Option<WorkRecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM work_records WHERE work_type = $1 AND reference_id = $2"
        ))
        .bind(&self.work_type)
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkRecordRow::try_into_record).transpose()
    }

    async fn list(&self, limit: usize) -> Result<Vec<WorkRecord<P>>> {
        let rows: Vec<WorkRecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM work_records
             WHERE work_type = $1
             ORDER BY next_time ASC
             LIMIT $2"
        ))
        .bind(&self.work_type)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkRecordRow::try_into_record).collect()
    }

    async fn remove(&self, reference_id: &str) -> Result<bool> {
        let rows_affected =
            sqlx::query("DELETE FROM work_records WHERE work_type = $1 AND reference_id = $2")
                .bind(&self.work_type)
                .bind(reference_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkRecord<P>>> {
        let rows: Vec<WorkRecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM work_records
             WHERE work_type = $1 AND acquired = FALSE AND next_time <= $2
             ORDER BY next_time ASC
             LIMIT $3"
        ))
        .bind(&self.work_type)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkRecordRow::try_into_record).collect()
    }

    async fn claim(
        &self,
        reference_id: &str,
        now: DateTime<Utc>,
        provisional_next: DateTime<Utc>,
    ) -> Result<ClaimOutcome<P>> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<(Uuid, bool)> = sqlx::query_as(
            "SELECT id, acquired FROM work_records
             WHERE work_type = $1 AND reference_id = $2
             FOR UPDATE",
        )
        .bind(&self.work_type)
        .bind(reference_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match locked {
            None => ClaimOutcome::Missing,
            Some((_, true)) => ClaimOutcome::AlreadyAcquired,
            Some((id, false)) => {
                let row: WorkRecordRow = sqlx::query_as(&format!(
                    "UPDATE work_records
                     SET acquired = TRUE, acquiring_time = $1, next_time = $2, updated_at = $1
                     WHERE id = $3
                     RETURNING {RECORD_COLUMNS}"
                ))
                .bind(now)
                .bind(provisional_next)
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
                ClaimOutcome::Claimed(row.try_into_record()?)
            }
        };

        tx.commit().await?;

        Ok(outcome)
    }

    async fn finalize(&self, reference_id: &str, release: Release) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM work_records
             WHERE work_type = $1 AND reference_id = $2
             FOR UPDATE",
        )
        .bind(&self.work_type)
        .bind(reference_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = locked else {
            tx.commit().await?;
            return Ok(false);
        };

        match release {
            Release::Complete => {
                sqlx::query("DELETE FROM work_records WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            Release::Reschedule { next_time, now } => {
                sqlx::query(
                    "UPDATE work_records
                     SET acquired = FALSE, next_time = $1, acquiring_time = $2, updated_at = $2
                     WHERE id = $3",
                )
                .bind(next_time)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        // SKIP LOCKED: a row being finalized right now is not stuck.
        let released: Vec<(String,)> = sqlx::query_as(
            "UPDATE work_records SET acquired = FALSE, updated_at = $3
             WHERE id IN (
                 SELECT id FROM work_records
                 WHERE work_type = $1 AND acquired = TRUE AND acquiring_time < $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING reference_id",
        )
        .bind(&self.work_type)
        .bind(claimed_before)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(released.into_iter().map(|(r,)| r).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkRecordRow {
    id: Uuid,
    reference_id: String,
    acquired: bool,
    next_time: DateTime<Utc>,
    acquiring_time: Option<DateTime<Utc>>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkRecordRow {
    fn try_into_record<P: Payload>(self) -> Result<WorkRecord<P>> {
        Ok(WorkRecord {
            id: WorkId(self.id),
            reference_id: self.reference_id,
            acquired: self.acquired,
            next_time: self.next_time,
            acquiring_time: self.acquiring_time,
            payload: serde_json::from_value(self.payload)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
