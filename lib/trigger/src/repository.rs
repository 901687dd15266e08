//! Trigger-watch persistence contract.

use crate::watch::{TriggerWatch, WatchKind, WatchState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwright_core::{TriggerWatchId, WorkflowId};
use runwright_workflow::RepositoryError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Stores trigger watches.
#[async_trait]
pub trait TriggerWatchRepository: Send + Sync {
    /// Lists the watches of `kind` that are not paused.
    async fn list_active(&self, kind: WatchKind) -> Result<Vec<TriggerWatch>, RepositoryError>;

    /// Sets the poll state of a watch.
    async fn set_state(&self, id: TriggerWatchId, state: WatchState) -> Result<(), RepositoryError>;

    /// Stores the outcome of a poll: the new cursor and state.
    async fn save_poll(
        &self,
        id: TriggerWatchId,
        sync_cursor: Option<String>,
        state: WatchState,
        polled_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Replaces every watch of a workflow.
    async fn replace_for_workflow(
        &self,
        workflow_id: WorkflowId,
        watches: &[TriggerWatch],
    ) -> Result<(), RepositoryError>;
}

/// In-memory watch store.
#[derive(Debug, Default)]
pub struct InMemoryTriggerWatchRepository {
    watches: Mutex<HashMap<TriggerWatchId, TriggerWatch>>,
}

impl InMemoryTriggerWatchRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a watch.
    pub fn insert(&self, watch: TriggerWatch) {
        self.lock().insert(watch.id, watch);
    }

    /// Returns a stored watch.
    #[must_use]
    pub fn get(&self, id: TriggerWatchId) -> Option<TriggerWatch> {
        self.lock().get(&id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TriggerWatchId, TriggerWatch>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(id: TriggerWatchId) -> RepositoryError {
    RepositoryError::NotFound {
        entity: "trigger watch",
        id: id.to_string(),
    }
}

#[async_trait]
impl TriggerWatchRepository for InMemoryTriggerWatchRepository {
    async fn list_active(&self, kind: WatchKind) -> Result<Vec<TriggerWatch>, RepositoryError> {
        let mut watches: Vec<_> = self
            .lock()
            .values()
            .filter(|w| w.kind() == kind && w.state != WatchState::Paused)
            .cloned()
            .collect();
        watches.sort_by_key(|w| w.id);
        Ok(watches)
    }

    async fn set_state(&self, id: TriggerWatchId, state: WatchState) -> Result<(), RepositoryError> {
        let mut watches = self.lock();
        let watch = watches.get_mut(&id).ok_or_else(|| not_found(id))?;
        watch.state = state;
        Ok(())
    }

    async fn save_poll(
        &self,
        id: TriggerWatchId,
        sync_cursor: Option<String>,
        state: WatchState,
        polled_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut watches = self.lock();
        let watch = watches.get_mut(&id).ok_or_else(|| not_found(id))?;
        watch.sync_cursor = sync_cursor;
        watch.state = state;
        watch.last_polled_at = Some(polled_at);
        Ok(())
    }

    async fn replace_for_workflow(
        &self,
        workflow_id: WorkflowId,
        replacement: &[TriggerWatch],
    ) -> Result<(), RepositoryError> {
        let mut watches = self.lock();
        watches.retain(|_, w| w.workflow_id != workflow_id);
        for watch in replacement {
            watches.insert(watch.id, watch.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatchConfig;
    use runwright_core::{NodeId, UserId};
    use runwright_workflow::trigger::EmailTriggerConfig;

    fn email_watch(state: WatchState) -> TriggerWatch {
        TriggerWatch {
            id: TriggerWatchId::new(),
            workflow_id: WorkflowId::new(),
            user_id: UserId::new(),
            node_id: NodeId::new(),
            config: WatchConfig::Email(EmailTriggerConfig {
                keywords: vec![],
                from: None,
                labels: vec![],
            }),
            sync_cursor: None,
            state,
            last_polled_at: None,
        }
    }

    #[tokio::test]
    async fn paused_watches_are_not_listed() {
        let repo = InMemoryTriggerWatchRepository::new();
        let active = email_watch(WatchState::Queued);
        repo.insert(active.clone());
        repo.insert(email_watch(WatchState::Paused));

        let listed = repo.list_active(WatchKind::Email).await.unwrap();
        assert_eq!(listed, vec![active]);
        assert!(repo.list_active(WatchKind::Calendar).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_poll_records_cursor() {
        let repo = InMemoryTriggerWatchRepository::new();
        let watch = email_watch(WatchState::Running);
        repo.insert(watch.clone());
        let now = Utc::now();

        repo.save_poll(watch.id, Some("42".to_string()), WatchState::Queued, now)
            .await
            .unwrap();

        let stored = repo.get(watch.id).unwrap();
        assert_eq!(stored.sync_cursor.as_deref(), Some("42"));
        assert_eq!(stored.state, WatchState::Queued);
        assert_eq!(stored.last_polled_at, Some(now));
    }

    #[tokio::test]
    async fn unknown_watch_is_not_found() {
        let repo = InMemoryTriggerWatchRepository::new();
        let result = repo.set_state(TriggerWatchId::new(), WatchState::Running).await;
        assert!(matches!(result, Err(RepositoryError::NotFound { .. })));
    }
}
