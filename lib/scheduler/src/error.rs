//! Error types for the scheduler crate.
//!
//! - `ScheduleError`: a schedule record that cannot be dispatched or advanced
//! - `SchedulerError`: failures of a whole poll cycle

use chrono::{DateTime, Utc};
use runwright_core::ScheduleId;
use runwright_workflow::RepositoryError;
use std::fmt;

/// Errors from validating or advancing a single schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The schedule has no next run time.
    MissingNextRun { schedule_id: ScheduleId },
    /// The next run time lies further in the past than one poll interval.
    Stale {
        schedule_id: ScheduleId,
        next_run_at: DateTime<Utc>,
    },
    /// The next occurrence is not representable.
    OutOfRange { schedule_id: ScheduleId },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingNextRun { schedule_id } => {
                write!(f, "schedule {schedule_id} has no next run time")
            }
            Self::Stale {
                schedule_id,
                next_run_at,
            } => write!(f, "schedule {schedule_id} is stale (was due at {next_run_at})"),
            Self::OutOfRange { schedule_id } => {
                write!(f, "next occurrence of schedule {schedule_id} is out of range")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Errors from a scheduler poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Fetching due schedules failed.
    Fetch(RepositoryError),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "failed to fetch due schedules: {e}"),
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fetch(e) => Some(e),
        }
    }
}

impl From<RepositoryError> for SchedulerError {
    fn from(e: RepositoryError) -> Self {
        Self::Fetch(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_error_display() {
        let err = ScheduleError::MissingNextRun {
            schedule_id: ScheduleId::new(),
        };
        assert!(err.to_string().contains("no next run time"));
    }

    #[test]
    fn scheduler_error_keeps_source() {
        let err = SchedulerError::from(RepositoryError::Storage {
            message: "connection reset".to_string(),
        });
        assert!(err.to_string().contains("connection reset"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
