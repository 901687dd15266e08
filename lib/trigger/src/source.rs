//! The event-source seam shared by the calendar and mailbox pollers.

use crate::error::SourceError;
use crate::watch::{TriggerWatch, WatchKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// An external event that matched a watch's filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Identifies the occurrence for claiming. Two polls that see the same
    /// occurrence produce the same ID.
    pub event_id: String,
    /// Human-readable description for logs.
    pub summary: String,
    /// How long the claim on this occurrence must live. `None` uses the
    /// poller's fallback.
    pub claim_ttl: Option<Duration>,
}

/// The result of polling one watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// The cursor to persist for the next poll.
    pub cursor: String,
    /// Matching candidates, in provider order.
    pub candidates: Vec<Candidate>,
}

/// Fetches matching changes for watches of one kind.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// The kind of watch this source serves.
    fn kind(&self) -> WatchKind;

    /// Returns a cursor representing the provider's current state.
    async fn reset_cursor(&self, watch: &TriggerWatch) -> Result<String, SourceError>;

    /// Fetches the changes since `cursor` and filters them against the watch.
    ///
    /// Returns `SourceError::CursorExpired` if the provider no longer accepts
    /// the cursor.
    async fn changes(
        &self,
        watch: &TriggerWatch,
        cursor: &str,
        now: DateTime<Utc>,
    ) -> Result<ChangeSet, SourceError>;
}
