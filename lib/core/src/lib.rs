//! Core domain types and utilities for the runwright workflow engine.
//!
//! This crate provides the foundational types, error handling, and shared
//! utilities used by the orchestration, scheduling and trigger crates.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    NodeId, NodeRunId, ParseIdError, ScheduleId, TriggerWatchId, UserId, WorkflowId,
    WorkflowRunId,
};
