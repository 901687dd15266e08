//! Event poller with claim-based deduplication.
//!
//! Each cycle walks the active watches of one kind. For every watch the poller
//! fetches the change set since the stored cursor, claims the first matching
//! event that no other poll has claimed yet and launches the workflow for it.
//! The claim key is `(workflow, event)`, so overlapping cycles and parallel
//! poller instances fire each event at most once.
//!
//! Whatever happens, the cycle ends by persisting the watch's cursor and
//! setting it back to `queued`. The cursor advances past a delta once it has
//! been handled; when the chosen event's claim had to be given back (busy
//! workflow, failed launch or unreachable claim store) the old cursor is kept
//! so the next cycle sees that event again.

use crate::error::{PollerError, SourceError};
use crate::repository::TriggerWatchRepository;
use crate::source::{Candidate, EventSource};
use crate::watch::{TriggerWatch, WatchState};
use chrono::{DateTime, Utc};
use runwright_core::WorkflowRunId;
use runwright_workflow::cache::event_claim_key;
use runwright_workflow::{DistributedLock, LaunchOutcome, Lease, WorkflowLauncher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Poller tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time between poll cycles.
    pub interval: Duration,
    /// Claim lifetime for events that carry no time window of their own.
    pub claim_fallback_ttl: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            claim_fallback_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// What polling a single watch led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A matching event was claimed and the workflow started.
    Fired(WorkflowRunId),
    /// Nothing matched.
    NoMatch,
    /// Every matching event had already been claimed.
    AlreadyClaimed,
    /// The workflow was already being launched; the claim was given back.
    Busy,
    /// The cursor was (re)established; nothing fired this cycle.
    CursorReset,
    /// The provider, cache or launch failed.
    Failed,
}

/// Counts of a poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub watches: usize,
    pub fired: usize,
    pub cursor_resets: usize,
    pub failed: usize,
}

impl PollSummary {
    fn record(&mut self, outcome: WatchOutcome) {
        self.watches += 1;
        match outcome {
            WatchOutcome::Fired(_) => self.fired += 1,
            WatchOutcome::CursorReset => self.cursor_resets += 1,
            WatchOutcome::Failed => self.failed += 1,
            WatchOutcome::NoMatch | WatchOutcome::AlreadyClaimed | WatchOutcome::Busy => {}
        }
    }
}

/// Polls the watches served by one event source.
pub struct EventPoller {
    watches: Arc<dyn TriggerWatchRepository>,
    source: Arc<dyn EventSource>,
    launcher: Arc<dyn WorkflowLauncher>,
    lock: DistributedLock,
    config: PollerConfig,
}

impl EventPoller {
    /// Creates a poller.
    #[must_use]
    pub fn new(
        watches: Arc<dyn TriggerWatchRepository>,
        source: Arc<dyn EventSource>,
        launcher: Arc<dyn WorkflowLauncher>,
        lock: DistributedLock,
        config: PollerConfig,
    ) -> Self {
        Self {
            watches,
            source,
            launcher,
            lock,
            config,
        }
    }

    /// Polls every `interval` until `shutdown` is cancelled. A cycle that has
    /// started always finishes.
    pub async fn run(&self, shutdown: CancellationToken) {
        let kind = self.source.kind().as_str();
        tracing::info!(kind, interval = ?self.config.interval, "event poller started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.poll_once(Utc::now()).await {
                Ok(summary) if summary.fired > 0 || summary.failed > 0 => {
                    tracing::info!(
                        kind,
                        watches = summary.watches,
                        fired = summary.fired,
                        failed = summary.failed,
                        "poll cycle finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(kind, error = %e, "poll cycle failed"),
            }
        }
        tracing::info!(kind, "event poller stopped");
    }

    /// Runs one poll cycle over every active watch.
    ///
    /// # Errors
    ///
    /// Returns an error if the watches could not be listed. Failures of
    /// individual watches are counted in the summary instead.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollSummary, PollerError> {
        let watches = self.watches.list_active(self.source.kind()).await?;
        let mut summary = PollSummary::default();
        for watch in &watches {
            summary.record(self.process_watch(watch, now).await);
        }
        Ok(summary)
    }

    /// Polls a single watch.
    #[instrument(skip_all, fields(watch_id = %watch.id, workflow_id = %watch.workflow_id))]
    pub async fn process_watch(&self, watch: &TriggerWatch, now: DateTime<Utc>) -> WatchOutcome {
        if let Err(e) = self.watches.set_state(watch.id, WatchState::Running).await {
            tracing::warn!(error = %e, "failed to mark watch running");
        }

        let (cursor, outcome) = match &watch.sync_cursor {
            None => {
                tracing::debug!("establishing sync baseline");
                self.reset_cursor(watch).await
            }
            Some(cursor) => match self.source.changes(watch, cursor, now).await {
                Ok(changes) => {
                    let outcome = self.fire_first(watch, &changes.candidates).await;
                    if matches!(outcome, WatchOutcome::Busy | WatchOutcome::Failed) {
                        tracing::debug!("event not handled, keeping cursor");
                        (Some(cursor.clone()), outcome)
                    } else {
                        (Some(changes.cursor), outcome)
                    }
                }
                Err(SourceError::CursorExpired) => {
                    tracing::warn!("sync cursor expired, resetting without firing");
                    self.reset_cursor(watch).await
                }
                Err(e) => {
                    tracing::warn!(error = %e, "fetching changes failed");
                    (Some(cursor.clone()), WatchOutcome::Failed)
                }
            },
        };

        if let Err(e) = self
            .watches
            .save_poll(watch.id, cursor, WatchState::Queued, now)
            .await
        {
            tracing::error!(error = %e, "failed to persist watch cursor");
        }
        outcome
    }

    async fn reset_cursor(&self, watch: &TriggerWatch) -> (Option<String>, WatchOutcome) {
        match self.source.reset_cursor(watch).await {
            Ok(cursor) => (Some(cursor), WatchOutcome::CursorReset),
            Err(e) => {
                tracing::warn!(error = %e, "failed to obtain a sync cursor");
                (None, WatchOutcome::Failed)
            }
        }
    }

    /// Claims the first unclaimed candidate and launches the workflow for it.
    async fn fire_first(&self, watch: &TriggerWatch, candidates: &[Candidate]) -> WatchOutcome {
        let mut claimed_elsewhere = false;
        for candidate in candidates {
            let ttl = candidate.claim_ttl.unwrap_or(self.config.claim_fallback_ttl);
            let key = event_claim_key(watch.workflow_id, &candidate.event_id);
            let lease = match self.lock.acquire(&key, ttl).await {
                Ok(lease) => lease,
                Err(e) => {
                    tracing::warn!(error = %e, "event claim unavailable");
                    return WatchOutcome::Failed;
                }
            };
            if !lease.acquired() {
                tracing::debug!(event_id = %candidate.event_id, "event already claimed");
                claimed_elsewhere = true;
                continue;
            }

            return match self.launcher.launch(watch.user_id, watch.workflow_id).await {
                Ok(LaunchOutcome::Started(run_id)) => {
                    tracing::info!(
                        %run_id,
                        event_id = %candidate.event_id,
                        summary = %candidate.summary,
                        "event triggered workflow"
                    );
                    WatchOutcome::Fired(run_id)
                }
                Ok(LaunchOutcome::Busy) => {
                    tracing::info!(event_id = %candidate.event_id, "workflow busy, giving back claim");
                    self.unclaim(&lease).await;
                    WatchOutcome::Busy
                }
                Err(e) => {
                    tracing::warn!(event_id = %candidate.event_id, error = %e, "launch failed, giving back claim");
                    self.unclaim(&lease).await;
                    WatchOutcome::Failed
                }
            };
        }

        if claimed_elsewhere {
            WatchOutcome::AlreadyClaimed
        } else {
            WatchOutcome::NoMatch
        }
    }

    async fn unclaim(&self, lease: &Lease) {
        if let Err(e) = self.lock.release(lease).await {
            tracing::warn!(error = %e, "failed to release event claim");
        }
    }
}
