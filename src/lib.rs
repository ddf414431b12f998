//! # workpool
//!
//! Durable, distributed work scheduling over Postgres.
//!
//! Work records live in one table shared by every process in a pool. Each
//! process runs a [`engine::WorkSchedule`] per work type: a periodic poll
//! pulls due records into a bounded local worker pool, a transactional
//! claim makes sure only one executor runs a record at a time, and the
//! handler's outcome either deletes the record or reschedules it. An
//! optional LISTEN/NOTIFY fast path lets any instance pick up freshly
//! posted work without waiting for its next poll tick.

pub mod bus;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod runner;
pub mod storage;
pub mod telemetry;
