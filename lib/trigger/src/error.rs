//! Error types for the trigger crate.
//!
//! - `ProviderError`: failures reported by a calendar or mailbox client
//! - `SourceError`: what an event source reports to the poller
//! - `PollerError`: failures of a whole poll cycle

use runwright_workflow::RepositoryError;
use std::fmt;

/// Errors from an external calendar or mailbox client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The sync cursor is no longer valid upstream (HTTP 410 Gone or an
    /// unknown history ID).
    CursorExpired,
    /// The provider could not be reached or refused the request.
    Unavailable { message: String },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CursorExpired => write!(f, "sync cursor expired"),
            Self::Unavailable { message } => write!(f, "provider unavailable: {message}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Errors from fetching a watch's change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The cursor has to be reset before changes can be fetched again.
    CursorExpired,
    /// The watch is not of the kind this source handles.
    WrongKind,
    /// Any other provider failure.
    Provider(ProviderError),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CursorExpired => write!(f, "sync cursor expired"),
            Self::WrongKind => write!(f, "watch does not belong to this source"),
            Self::Provider(e) => write!(f, "fetching changes failed: {e}"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Provider(e) => Some(e),
            Self::CursorExpired | Self::WrongKind => None,
        }
    }
}

impl From<ProviderError> for SourceError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::CursorExpired => Self::CursorExpired,
            other => Self::Provider(other),
        }
    }
}

/// Errors from an event poller cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerError {
    /// Listing the active watches failed.
    Fetch(RepositoryError),
}

impl fmt::Display for PollerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "failed to list trigger watches: {e}"),
        }
    }
}

impl std::error::Error for PollerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fetch(e) => Some(e),
        }
    }
}

impl From<RepositoryError> for PollerError {
    fn from(e: RepositoryError) -> Self {
        Self::Fetch(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_cursor_stays_distinguished() {
        assert_eq!(
            SourceError::from(ProviderError::CursorExpired),
            SourceError::CursorExpired
        );
        let other = SourceError::from(ProviderError::Unavailable {
            message: "503".to_string(),
        });
        assert!(matches!(other, SourceError::Provider(_)));
        assert!(other.to_string().contains("503"));
    }
}
