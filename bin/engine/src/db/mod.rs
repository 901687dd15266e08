//! Postgres repositories for the engine.
//!
//! This module provides data access for:
//! - Workflow graphs, and the schedules and watches derived from them
//! - Workflow runs and node runs
//! - Workflow schedules
//! - Trigger watches

pub mod schedule;
pub mod trigger_watch;
pub mod workflow;
pub mod workflow_run;

pub use schedule::PgScheduleRepository;
pub use trigger_watch::PgTriggerWatchRepository;
pub use workflow::PgWorkflowRepository;
pub use workflow_run::PgRunRepository;

use runwright_core::ParseIdError;
use runwright_workflow::RepositoryError;
use std::str::FromStr;

fn storage_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage {
        message: e.to_string(),
    }
}

fn parse_id<T>(value: &str) -> Result<T, RepositoryError>
where
    T: FromStr<Err = ParseIdError>,
{
    T::from_str(value).map_err(|e| RepositoryError::Corrupt {
        message: e.to_string(),
    })
}

/// Parses an enum stored as text.
fn parse_column<T>(
    column: &'static str,
    value: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, RepositoryError> {
    parse(value).ok_or_else(|| RepositoryError::Corrupt {
        message: format!("unknown {column} '{value}'"),
    })
}
