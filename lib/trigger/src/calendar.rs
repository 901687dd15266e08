//! Calendar watches.
//!
//! Change-based conditions (created, updated, cancelled) are evaluated against
//! the incremental delta since the watch's sync token. Time-based conditions
//! (starting soon, ending soon, just ended) query the events around `now` and
//! test each against its window; the sync token is still advanced so that an
//! expired token is noticed and reset.

use crate::error::{ProviderError, SourceError};
use crate::matcher::{calendar_change_matches, calendar_window_matches};
use crate::source::{Candidate, ChangeSet, EventSource};
use crate::watch::{TriggerWatch, WatchConfig, WatchKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwright_core::UserId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Confirmation status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

/// A calendar event as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub description: String,
    pub location: String,
    /// Attendee email addresses.
    pub attendees: Vec<String>,
    pub status: EventStatus,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What happened to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Cancelled,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One entry of an incremental sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarChange {
    pub kind: ChangeKind,
    pub event: CalendarEvent,
}

/// Changes since a sync token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarDelta {
    pub changes: Vec<CalendarChange>,
    pub next_sync_token: String,
}

/// Calendar API client.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Returns a sync token for the calendar's current state.
    async fn current_sync_token(
        &self,
        user_id: UserId,
        calendar_id: Option<&str>,
    ) -> Result<String, ProviderError>;

    /// Returns the changes since `sync_token`.
    ///
    /// Fails with `ProviderError::CursorExpired` when the token is no longer
    /// accepted.
    async fn changed_events(
        &self,
        user_id: UserId,
        calendar_id: Option<&str>,
        sync_token: &str,
    ) -> Result<CalendarDelta, ProviderError>;

    /// Returns the events overlapping `[from, to]`.
    async fn events_between(
        &self,
        user_id: UserId,
        calendar_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, ProviderError>;
}

/// Event source for calendar watches.
pub struct CalendarSource {
    provider: Arc<dyn CalendarProvider>,
}

impl CalendarSource {
    #[must_use]
    pub fn new(provider: Arc<dyn CalendarProvider>) -> Self {
        Self { provider }
    }
}

fn change_claim_id(change: &CalendarChange) -> String {
    format!(
        "{}:{}:{}",
        change.kind.as_str(),
        change.event.id,
        change.event.updated_at.timestamp_millis()
    )
}

#[async_trait]
impl EventSource for CalendarSource {
    fn kind(&self) -> WatchKind {
        WatchKind::Calendar
    }

    async fn reset_cursor(&self, watch: &TriggerWatch) -> Result<String, SourceError> {
        let WatchConfig::Calendar(config) = &watch.config else {
            return Err(SourceError::WrongKind);
        };
        Ok(self
            .provider
            .current_sync_token(watch.user_id, config.calendar_id.as_deref())
            .await?)
    }

    async fn changes(
        &self,
        watch: &TriggerWatch,
        cursor: &str,
        now: DateTime<Utc>,
    ) -> Result<ChangeSet, SourceError> {
        let WatchConfig::Calendar(config) = &watch.config else {
            return Err(SourceError::WrongKind);
        };
        let calendar_id = config.calendar_id.as_deref();
        let delta = self
            .provider
            .changed_events(watch.user_id, calendar_id, cursor)
            .await?;

        let candidates = match config.condition.window() {
            Some(window) => self
                .provider
                .events_between(watch.user_id, calendar_id, now - window, now + window)
                .await?
                .into_iter()
                .filter_map(|event| {
                    let boundary = calendar_window_matches(config, &event, now)?;
                    Some(Candidate {
                        event_id: format!("{}@{}", event.id, boundary.timestamp()),
                        summary: event.title,
                        claim_ttl: window.to_std().ok(),
                    })
                })
                .collect(),
            None => delta
                .changes
                .iter()
                .filter(|change| calendar_change_matches(config, change))
                .map(|change| Candidate {
                    event_id: change_claim_id(change),
                    summary: change.event.title.clone(),
                    claim_ttl: None,
                })
                .collect(),
        };

        Ok(ChangeSet {
            cursor: delta.next_sync_token,
            candidates,
        })
    }
}

#[derive(Debug, Default)]
struct CalendarLog {
    changes: Vec<CalendarChange>,
    epoch: u64,
    unavailable: bool,
}

/// Calendar kept in memory.
///
/// Sync tokens are `epoch:position` in the change log; expiring tokens starts
/// a new epoch.
#[derive(Debug, Default)]
pub struct InMemoryCalendarProvider {
    log: Mutex<CalendarLog>,
}

impl InMemoryCalendarProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a change.
    pub fn push(&self, kind: ChangeKind, event: CalendarEvent) {
        self.lock().changes.push(CalendarChange { kind, event });
    }

    /// Invalidates every sync token issued so far.
    pub fn expire_tokens(&self) {
        self.lock().epoch += 1;
    }

    /// Makes every call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, CalendarLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(log: &CalendarLog) -> Result<(), ProviderError> {
        if log.unavailable {
            return Err(ProviderError::Unavailable {
                message: "calendar offline".to_string(),
            });
        }
        Ok(())
    }

    fn token(log: &CalendarLog) -> String {
        format!("{}:{}", log.epoch, log.changes.len())
    }
}

#[async_trait]
impl CalendarProvider for InMemoryCalendarProvider {
    async fn current_sync_token(
        &self,
        _user_id: UserId,
        _calendar_id: Option<&str>,
    ) -> Result<String, ProviderError> {
        let log = self.lock();
        Self::check(&log)?;
        Ok(Self::token(&log))
    }

    async fn changed_events(
        &self,
        _user_id: UserId,
        _calendar_id: Option<&str>,
        sync_token: &str,
    ) -> Result<CalendarDelta, ProviderError> {
        let log = self.lock();
        Self::check(&log)?;
        let position = sync_token
            .split_once(':')
            .filter(|(epoch, _)| epoch.parse::<u64>().ok() == Some(log.epoch))
            .and_then(|(_, position)| position.parse::<usize>().ok())
            .filter(|position| *position <= log.changes.len())
            .ok_or(ProviderError::CursorExpired)?;
        Ok(CalendarDelta {
            changes: log.changes[position..].to_vec(),
            next_sync_token: Self::token(&log),
        })
    }

    async fn events_between(
        &self,
        _user_id: UserId,
        _calendar_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, ProviderError> {
        let log = self.lock();
        Self::check(&log)?;
        let mut latest: HashMap<&str, &CalendarEvent> = HashMap::new();
        let mut order = Vec::new();
        for change in &log.changes {
            if latest.insert(change.event.id.as_str(), &change.event).is_none() {
                order.push(change.event.id.as_str());
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| latest.get(id).copied())
            .filter(|event| event.start <= to && event.end >= from)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use runwright_core::{NodeId, TriggerWatchId, WorkflowId};
    use crate::watch::WatchState;
    use runwright_workflow::trigger::{CalendarCondition, CalendarTriggerConfig};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, m, 0).unwrap()
    }

    fn event(id: &str, title: &str, start: DateTime<Utc>) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            location: String::new(),
            attendees: vec![],
            status: EventStatus::Confirmed,
            start,
            end: start + Duration::minutes(30),
            updated_at: at(8, 0),
        }
    }

    fn watch(condition: CalendarCondition) -> TriggerWatch {
        TriggerWatch {
            id: TriggerWatchId::new(),
            workflow_id: WorkflowId::new(),
            user_id: UserId::new(),
            node_id: NodeId::new(),
            config: WatchConfig::Calendar(CalendarTriggerConfig {
                calendar_id: None,
                condition,
                keywords: vec![],
            }),
            sync_cursor: None,
            state: WatchState::Queued,
            last_polled_at: None,
        }
    }

    #[tokio::test]
    async fn delta_follows_the_token() {
        let provider = InMemoryCalendarProvider::new();
        let user = UserId::new();
        provider.push(ChangeKind::Created, event("a", "A", at(10, 0)));
        let token = provider.current_sync_token(user, None).await.unwrap();
        provider.push(ChangeKind::Created, event("b", "B", at(11, 0)));

        let delta = provider.changed_events(user, None, &token).await.unwrap();
        assert_eq!(delta.changes.len(), 1);
        assert_eq!(delta.changes[0].event.id, "b");

        let empty = provider
            .changed_events(user, None, &delta.next_sync_token)
            .await
            .unwrap();
        assert!(empty.changes.is_empty());
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let provider = InMemoryCalendarProvider::new();
        let user = UserId::new();
        let token = provider.current_sync_token(user, None).await.unwrap();
        provider.push(ChangeKind::Created, event("a", "A", at(10, 0)));
        provider.expire_tokens();

        let result = provider.changed_events(user, None, &token).await;
        assert_eq!(result, Err(ProviderError::CursorExpired));

        let fresh = provider.current_sync_token(user, None).await.unwrap();
        assert!(provider.changed_events(user, None, &fresh).await.is_ok());
    }

    #[tokio::test]
    async fn created_condition_uses_delta() {
        let provider = Arc::new(InMemoryCalendarProvider::new());
        let source = CalendarSource::new(provider.clone());
        let w = watch(CalendarCondition::EventCreated);
        let cursor = source.reset_cursor(&w).await.unwrap();
        provider.push(ChangeKind::Created, event("a", "Planning", at(10, 0)));
        provider.push(ChangeKind::Cancelled, event("b", "Retro", at(11, 0)));

        let changes = source.changes(&w, &cursor, at(9, 0)).await.unwrap();

        assert_eq!(changes.candidates.len(), 1);
        assert_eq!(changes.candidates[0].summary, "Planning");
        assert!(changes.candidates[0].event_id.starts_with("created:a:"));
        assert_ne!(changes.cursor, cursor);
    }

    #[tokio::test]
    async fn starting_soon_uses_window() {
        let provider = Arc::new(InMemoryCalendarProvider::new());
        let source = CalendarSource::new(provider.clone());
        let w = watch(CalendarCondition::StartingSoon { minutes: 15 });
        provider.push(ChangeKind::Created, event("a", "Standup", at(10, 0)));
        provider.push(ChangeKind::Created, event("b", "Lunch", at(12, 0)));
        let cursor = source.reset_cursor(&w).await.unwrap();

        let changes = source.changes(&w, &cursor, at(9, 50)).await.unwrap();

        assert_eq!(changes.candidates.len(), 1);
        assert_eq!(changes.candidates[0].summary, "Standup");
        assert_eq!(
            changes.candidates[0].claim_ttl,
            Some(std::time::Duration::from_secs(15 * 60))
        );
    }

    #[tokio::test]
    async fn expired_token_surfaces_as_cursor_expired() {
        let provider = Arc::new(InMemoryCalendarProvider::new());
        let source = CalendarSource::new(provider.clone());
        let w = watch(CalendarCondition::EventCreated);
        let cursor = source.reset_cursor(&w).await.unwrap();
        provider.expire_tokens();

        let result = source.changes(&w, &cursor, at(9, 0)).await;
        assert_eq!(result, Err(SourceError::CursorExpired));
    }
}
