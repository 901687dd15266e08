//! Mailbox watches.
//!
//! The cursor is the mailbox history ID. Each poll lists the messages added
//! since that ID and matches them against the trigger's keyword, sender and
//! label filters.

use crate::error::{ProviderError, SourceError};
use crate::matcher::email_matches;
use crate::source::{Candidate, ChangeSet, EventSource};
use crate::watch::{TriggerWatch, WatchConfig, WatchKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwright_core::UserId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A message as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub id: String,
    pub subject: String,
    pub snippet: String,
    pub from: String,
    pub to: Vec<String>,
    pub labels: Vec<String>,
}

/// Messages added since a history ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxDelta {
    pub messages: Vec<MailMessage>,
    pub next_history_id: String,
}

/// Mailbox API client.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// Returns the mailbox's current history ID.
    async fn current_history_id(&self, user_id: UserId) -> Result<String, ProviderError>;

    /// Returns the messages added since `history_id`.
    ///
    /// Fails with `ProviderError::CursorExpired` when the history ID is too
    /// old for the provider to answer.
    async fn messages_since(
        &self,
        user_id: UserId,
        history_id: &str,
    ) -> Result<MailboxDelta, ProviderError>;
}

/// Event source for email watches.
pub struct MailboxSource {
    provider: Arc<dyn MailboxProvider>,
}

impl MailboxSource {
    #[must_use]
    pub fn new(provider: Arc<dyn MailboxProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl EventSource for MailboxSource {
    fn kind(&self) -> WatchKind {
        WatchKind::Email
    }

    async fn reset_cursor(&self, watch: &TriggerWatch) -> Result<String, SourceError> {
        if watch.kind() != WatchKind::Email {
            return Err(SourceError::WrongKind);
        }
        Ok(self.provider.current_history_id(watch.user_id).await?)
    }

    async fn changes(
        &self,
        watch: &TriggerWatch,
        cursor: &str,
        _now: DateTime<Utc>,
    ) -> Result<ChangeSet, SourceError> {
        let WatchConfig::Email(config) = &watch.config else {
            return Err(SourceError::WrongKind);
        };
        let delta = self.provider.messages_since(watch.user_id, cursor).await?;
        let candidates = delta
            .messages
            .into_iter()
            .filter(|message| email_matches(config, message))
            .map(|message| Candidate {
                event_id: message.id,
                summary: message.subject,
                claim_ttl: None,
            })
            .collect();
        Ok(ChangeSet {
            cursor: delta.next_history_id,
            candidates,
        })
    }
}

#[derive(Debug, Default)]
struct Mailbox {
    messages: Vec<MailMessage>,
    /// History IDs below this are no longer answered.
    oldest_history: usize,
    unavailable: bool,
}

/// Mailbox kept in memory. History IDs are message counts.
#[derive(Debug, Default)]
pub struct InMemoryMailboxProvider {
    mailbox: Mutex<Mailbox>,
}

impl InMemoryMailboxProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a message.
    pub fn deliver(&self, message: MailMessage) {
        self.lock().messages.push(message);
    }

    /// Forgets history up to now, so every earlier history ID expires.
    pub fn truncate_history(&self) {
        let mut mailbox = self.lock();
        mailbox.oldest_history = mailbox.messages.len();
    }

    /// Makes every call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(mailbox: &Mailbox) -> Result<(), ProviderError> {
        if mailbox.unavailable {
            return Err(ProviderError::Unavailable {
                message: "mailbox offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxProvider for InMemoryMailboxProvider {
    async fn current_history_id(&self, _user_id: UserId) -> Result<String, ProviderError> {
        let mailbox = self.lock();
        Self::check(&mailbox)?;
        Ok(mailbox.messages.len().to_string())
    }

    async fn messages_since(
        &self,
        _user_id: UserId,
        history_id: &str,
    ) -> Result<MailboxDelta, ProviderError> {
        let mailbox = self.lock();
        Self::check(&mailbox)?;
        let position = history_id
            .parse::<usize>()
            .ok()
            .filter(|position| {
                *position >= mailbox.oldest_history && *position <= mailbox.messages.len()
            })
            .ok_or(ProviderError::CursorExpired)?;
        Ok(MailboxDelta {
            messages: mailbox.messages[position..].to_vec(),
            next_history_id: mailbox.messages.len().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatchState;
    use runwright_core::{NodeId, TriggerWatchId, WorkflowId};
    use runwright_workflow::trigger::EmailTriggerConfig;

    fn message(id: &str, subject: &str) -> MailMessage {
        MailMessage {
            id: id.to_string(),
            subject: subject.to_string(),
            snippet: String::new(),
            from: "billing@example.com".to_string(),
            to: vec!["me@example.com".to_string()],
            labels: vec!["INBOX".to_string()],
        }
    }

    fn watch(keywords: &[&str]) -> TriggerWatch {
        TriggerWatch {
            id: TriggerWatchId::new(),
            workflow_id: WorkflowId::new(),
            user_id: UserId::new(),
            node_id: NodeId::new(),
            config: WatchConfig::Email(EmailTriggerConfig {
                keywords: keywords.iter().map(ToString::to_string).collect(),
                from: None,
                labels: vec![],
            }),
            sync_cursor: None,
            state: WatchState::Queued,
            last_polled_at: None,
        }
    }

    #[tokio::test]
    async fn new_matching_messages_become_candidates() {
        let provider = Arc::new(InMemoryMailboxProvider::new());
        let source = MailboxSource::new(provider.clone());
        let w = watch(&["invoice"]);
        provider.deliver(message("old", "Invoice #1"));
        let cursor = source.reset_cursor(&w).await.unwrap();
        provider.deliver(message("m-2", "Invoice #2"));
        provider.deliver(message("m-3", "Lunch?"));

        let changes = source.changes(&w, &cursor, Utc::now()).await.unwrap();

        let ids: Vec<_> = changes.candidates.iter().map(|c| c.event_id.as_str()).collect();
        assert_eq!(ids, vec!["m-2"]);
        assert_eq!(changes.cursor, "3");
    }

    #[tokio::test]
    async fn truncated_history_expires_cursor() {
        let provider = Arc::new(InMemoryMailboxProvider::new());
        let source = MailboxSource::new(provider.clone());
        let w = watch(&[]);
        let cursor = source.reset_cursor(&w).await.unwrap();
        provider.deliver(message("m-1", "hello"));
        provider.truncate_history();

        let result = source.changes(&w, &cursor, Utc::now()).await;
        assert_eq!(result, Err(SourceError::CursorExpired));
    }

    #[tokio::test]
    async fn outage_is_a_provider_error() {
        let provider = Arc::new(InMemoryMailboxProvider::new());
        let source = MailboxSource::new(provider.clone());
        let w = watch(&[]);
        provider.set_unavailable(true);

        let result = source.reset_cursor(&w).await;
        assert!(matches!(result, Err(SourceError::Provider(_))));
    }
}
