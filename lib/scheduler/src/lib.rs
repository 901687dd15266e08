//! Scheduler for recurring workflow runs.
//!
//! This crate provides:
//!
//! - **Schedules**: schedule records derived from schedule-trigger nodes and
//!   the next-occurrence arithmetic that advances them
//! - **Repository**: the get-due-and-claim storage contract with an in-memory
//!   backend
//! - **Scheduler**: the poll loop that launches due workflows under the run
//!   lock and drains in-flight dispatches on shutdown

pub mod error;
pub mod repository;
pub mod schedule;
pub mod scheduler;

pub use error::{ScheduleError, SchedulerError};
pub use repository::{InMemoryScheduleRepository, ScheduleRepository};
pub use schedule::{ScheduleState, WorkflowSchedule, schedules_for_graph};
pub use scheduler::{Phase, Scheduler, SchedulerConfig};
