//! Startup errors of the engine process.
//!
//! Component errors are flattened into these variants at the bootstrap
//! boundary and carried in a `rootcause` report up to `main`.

use std::fmt;

/// Errors raised while bringing the engine up.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration could not be loaded.
    Config { details: String },
    /// The database could not be reached.
    Database { details: String },
    /// Schema migrations failed.
    Migrations { details: String },
    /// The shared cache could not be reached.
    Cache { details: String },
    /// The task queue could not be set up.
    Queue { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "invalid configuration: {details}"),
            Self::Database { details } => write!(f, "failed to connect to database: {details}"),
            Self::Migrations { details } => write!(f, "failed to run migrations: {details}"),
            Self::Cache { details } => write!(f, "failed to connect to shared cache: {details}"),
            Self::Queue { details } => write!(f, "failed to set up task queue: {details}"),
        }
    }
}

impl std::error::Error for StartupError {}
