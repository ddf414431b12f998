//! Scheduler engine: work schedules, handlers, and the pool relay.

pub mod command;
pub mod handler;
pub mod pool;
pub mod schedule;

pub use command::CommandHandler;
pub use handler::{FnHandler, WorkHandler, handler_fn};
pub use pool::{Envelope, PoolPublisher, PoolSubscriber, ScheduleRegistry};
pub use schedule::{Disposition, ScheduleStats, SkipReason, WorkSchedule};
