//! The scheduler poll loop.
//!
//! Every tick the scheduler moves `Idle → Fetching → Dispatching → Idle`:
//! it claims the due schedules, validates each one and hands the valid ones to
//! the launcher on tracked background tasks. Those tasks are not tied to the
//! shutdown signal; once a launch has started, the schedule update that
//! follows it always runs. Shutdown stops the ticker and then waits for them.

use crate::error::{ScheduleError, SchedulerError};
use crate::repository::ScheduleRepository;
use crate::schedule::{ScheduleState, WorkflowSchedule};
use chrono::{DateTime, Utc};
use runwright_workflow::{LaunchError, LaunchOutcome, WorkflowLauncher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

/// Scheduler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between polls. Also how late a schedule may fire before it is
    /// considered stale.
    pub poll_interval: Duration,
    /// Maximum number of schedules claimed per poll.
    pub batch_size: usize,
    /// How long a claimed schedule may stay `running` before another
    /// scheduler takes it over.
    pub claim_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
            claim_timeout: Duration::from_secs(600),
        }
    }
}

/// Where the poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Dispatching,
}

/// Polls for due schedules and launches their workflows.
pub struct Scheduler {
    schedules: Arc<dyn ScheduleRepository>,
    launcher: Arc<dyn WorkflowLauncher>,
    config: SchedulerConfig,
    tracker: TaskTracker,
    phase: watch::Sender<Phase>,
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        launcher: Arc<dyn WorkflowLauncher>,
        config: SchedulerConfig,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            schedules,
            launcher,
            config,
            tracker: TaskTracker::new(),
            phase,
        }
    }

    /// The current phase of the poll loop.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Subscribes to phase changes.
    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Number of dispatches still in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Polls every `poll_interval` until `shutdown` is cancelled, then waits
    /// for in-flight dispatches.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(interval = ?self.config.poll_interval, "scheduler started");
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll_once(Utc::now()).await {
                tracing::warn!(error = %e, "scheduler poll failed");
            }
        }

        self.drain().await;
        tracing::info!("scheduler stopped");
    }

    /// Runs one poll cycle. Returns the number of dispatches started.
    ///
    /// # Errors
    ///
    /// Returns an error if the due schedules could not be fetched.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        self.phase.send_replace(Phase::Fetching);
        let due = match self
            .schedules
            .get_due_schedules_locked(now, self.config.batch_size, self.config.claim_timeout)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                self.phase.send_replace(Phase::Idle);
                return Err(e.into());
            }
        };

        self.phase.send_replace(Phase::Dispatching);
        let mut dispatched = 0;
        for schedule in due {
            match schedule.validate_due(now, self.config.poll_interval) {
                Ok(_) => {
                    self.tracker.spawn(dispatch(
                        self.schedules.clone(),
                        self.launcher.clone(),
                        schedule,
                        now,
                    ));
                    dispatched += 1;
                }
                Err(e @ ScheduleError::Stale { .. }) => {
                    tracing::warn!(error = %e, "skipping missed occurrence");
                    advance(self.schedules.as_ref(), &schedule, now, schedule.last_run_at).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "pausing invalid schedule");
                    persist(
                        self.schedules.as_ref(),
                        &schedule,
                        schedule.next_run_at,
                        schedule.last_run_at,
                        ScheduleState::Paused,
                    )
                    .await;
                }
            }
        }
        self.phase.send_replace(Phase::Idle);

        if dispatched > 0 {
            tracing::debug!(dispatched, "dispatched due schedules");
        }
        Ok(dispatched)
    }

    /// Waits for every in-flight dispatch to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[instrument(skip_all, fields(schedule_id = %schedule.id, workflow_id = %schedule.workflow_id))]
async fn dispatch(
    schedules: Arc<dyn ScheduleRepository>,
    launcher: Arc<dyn WorkflowLauncher>,
    schedule: WorkflowSchedule,
    now: DateTime<Utc>,
) {
    match launcher.launch(schedule.user_id, schedule.workflow_id).await {
        Ok(LaunchOutcome::Started(run_id)) => {
            tracing::info!(%run_id, "scheduled run started");
            advance(schedules.as_ref(), &schedule, now, Some(now)).await;
        }
        Ok(LaunchOutcome::Busy) => {
            tracing::info!("workflow already running, retrying next poll");
            release(schedules.as_ref(), &schedule).await;
        }
        Err(LaunchError::Lock(e)) => {
            tracing::warn!(error = %e, "run lock unavailable, retrying next poll");
            release(schedules.as_ref(), &schedule).await;
        }
        Err(LaunchError::Orchestration(e)) => {
            tracing::error!(error = %e, "scheduled run failed to start");
            advance(schedules.as_ref(), &schedule, now, Some(now)).await;
        }
    }
}

/// Moves a schedule to its next occurrence, or completes it.
async fn advance(
    schedules: &dyn ScheduleRepository,
    schedule: &WorkflowSchedule,
    now: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
) {
    match schedule.next_occurrence(now) {
        Ok(Some(next)) => {
            tracing::debug!(schedule_id = %schedule.id, %next, "schedule advanced");
            persist(schedules, schedule, Some(next), last_run_at, ScheduleState::Queued).await;
        }
        Ok(None) => {
            tracing::debug!(schedule_id = %schedule.id, "schedule completed");
            persist(schedules, schedule, None, last_run_at, ScheduleState::Completed).await;
        }
        Err(e) => {
            tracing::error!(error = %e, "pausing schedule");
            persist(
                schedules,
                schedule,
                schedule.next_run_at,
                last_run_at,
                ScheduleState::Paused,
            )
            .await;
        }
    }
}

async fn persist(
    schedules: &dyn ScheduleRepository,
    schedule: &WorkflowSchedule,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    state: ScheduleState,
) {
    if let Err(e) = schedules
        .update_next_run(schedule.id, next_run_at, last_run_at, state)
        .await
    {
        tracing::error!(schedule_id = %schedule.id, error = %e, "failed to update schedule");
    }
}

async fn release(schedules: &dyn ScheduleRepository, schedule: &WorkflowSchedule) {
    if let Err(e) = schedules.release_claim(schedule.id).await {
        tracing::error!(schedule_id = %schedule.id, error = %e, "failed to release schedule claim");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryScheduleRepository;
    use async_trait::async_trait;
    use runwright_core::{NodeId, ScheduleId, UserId, WorkflowId, WorkflowRunId};
    use runwright_workflow::trigger::ScheduleType;
    use runwright_workflow::{CacheError, OrchestratorError, RepositoryError};
    use std::sync::Mutex;

    /// Launcher returning a fixed answer and recording its calls.
    struct FakeLauncher {
        answer: Box<dyn Fn() -> Result<LaunchOutcome, LaunchError> + Send + Sync>,
        calls: Mutex<Vec<WorkflowId>>,
    }

    impl FakeLauncher {
        fn new(answer: impl Fn() -> Result<LaunchOutcome, LaunchError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                answer: Box::new(answer),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn started() -> Arc<Self> {
            Self::new(|| Ok(LaunchOutcome::Started(WorkflowRunId::new())))
        }

        fn calls(&self) -> Vec<WorkflowId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkflowLauncher for FakeLauncher {
        async fn launch(
            &self,
            _user_id: UserId,
            workflow_id: WorkflowId,
        ) -> Result<LaunchOutcome, LaunchError> {
            self.calls.lock().unwrap().push(workflow_id);
            (self.answer)()
        }
    }

    fn schedule(schedule_type: ScheduleType, next_run_at: DateTime<Utc>) -> WorkflowSchedule {
        WorkflowSchedule {
            id: ScheduleId::new(),
            workflow_id: WorkflowId::new(),
            user_id: UserId::new(),
            node_id: NodeId::new(),
            schedule_type,
            starts_at: next_run_at,
            next_run_at: Some(next_run_at),
            last_run_at: None,
            state: ScheduleState::Queued,
            claimed_at: None,
            retrying: false,
        }
    }

    fn scheduler(
        repo: &Arc<InMemoryScheduleRepository>,
        launcher: &Arc<FakeLauncher>,
    ) -> Scheduler {
        Scheduler::new(repo.clone(), launcher.clone(), SchedulerConfig::default())
    }

    #[tokio::test]
    async fn due_daily_schedule_fires_and_advances() {
        let repo = Arc::new(InMemoryScheduleRepository::new());
        let launcher = FakeLauncher::started();
        let now = Utc::now();
        let s = schedule(ScheduleType::Daily, now);
        repo.insert(s.clone());
        let scheduler = scheduler(&repo, &launcher);

        assert_eq!(scheduler.poll_once(now).await.unwrap(), 1);
        scheduler.drain().await;

        assert_eq!(launcher.calls(), vec![s.workflow_id]);
        let stored = repo.get(s.id).unwrap();
        assert_eq!(stored.next_run_at, Some(now + chrono::Duration::days(1)));
        assert_eq!(stored.last_run_at, Some(now));
        assert_eq!(stored.state, ScheduleState::Queued);
        assert_eq!(scheduler.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn one_off_schedule_completes() {
        let repo = Arc::new(InMemoryScheduleRepository::new());
        let launcher = FakeLauncher::started();
        let now = Utc::now();
        let s = schedule(ScheduleType::Once, now);
        repo.insert(s.clone());
        let scheduler = scheduler(&repo, &launcher);

        scheduler.poll_once(now).await.unwrap();
        scheduler.drain().await;

        let stored = repo.get(s.id).unwrap();
        assert_eq!(stored.next_run_at, None);
        assert_eq!(stored.state, ScheduleState::Completed);
        assert_eq!(scheduler.poll_once(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn busy_workflow_is_retried_next_poll() {
        let repo = Arc::new(InMemoryScheduleRepository::new());
        let busy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let launcher = FakeLauncher::new({
            let busy = busy.clone();
            move || {
                if busy.load(std::sync::atomic::Ordering::SeqCst) {
                    Ok(LaunchOutcome::Busy)
                } else {
                    Ok(LaunchOutcome::Started(WorkflowRunId::new()))
                }
            }
        });
        let now = Utc::now();
        let due = now - chrono::Duration::seconds(10);
        let s = schedule(ScheduleType::Daily, due);
        repo.insert(s.clone());
        let scheduler = scheduler(&repo, &launcher);
        let interval = chrono::Duration::from_std(SchedulerConfig::default().poll_interval).unwrap();

        scheduler.poll_once(now).await.unwrap();
        scheduler.drain().await;

        let stored = repo.get(s.id).unwrap();
        assert_eq!(stored.next_run_at, Some(due));
        assert_eq!(stored.last_run_at, None);
        assert_eq!(stored.state, ScheduleState::Queued);

        // Still busy a tick later: the occurrence is kept, not skipped.
        let second = now + interval;
        assert_eq!(scheduler.poll_once(second).await.unwrap(), 1);
        scheduler.drain().await;
        assert_eq!(repo.get(s.id).unwrap().next_run_at, Some(due));

        busy.store(false, std::sync::atomic::Ordering::SeqCst);
        let third = second + interval;
        assert_eq!(scheduler.poll_once(third).await.unwrap(), 1);
        scheduler.drain().await;

        assert_eq!(launcher.calls().len(), 3);
        let stored = repo.get(s.id).unwrap();
        assert_eq!(stored.last_run_at, Some(third));
        assert_eq!(stored.next_run_at, Some(due + chrono::Duration::days(1)));
        assert!(!stored.retrying);
    }

    #[tokio::test]
    async fn lock_failure_keeps_the_schedule() {
        let repo = Arc::new(InMemoryScheduleRepository::new());
        let launcher = FakeLauncher::new(|| {
            Err(LaunchError::Lock(CacheError::Unavailable {
                message: "connection refused".to_string(),
            }))
        });
        let now = Utc::now();
        let s = schedule(ScheduleType::Weekly, now);
        repo.insert(s.clone());
        let scheduler = scheduler(&repo, &launcher);

        scheduler.poll_once(now).await.unwrap();
        scheduler.drain().await;

        let stored = repo.get(s.id).unwrap();
        assert_eq!(stored.next_run_at, Some(now));
        assert_eq!(stored.state, ScheduleState::Queued);
    }

    #[tokio::test]
    async fn failed_orchestration_still_advances() {
        let repo = Arc::new(InMemoryScheduleRepository::new());
        let launcher = FakeLauncher::new(|| {
            Err(LaunchError::Orchestration(OrchestratorError::Repository(
                RepositoryError::Storage {
                    message: "disk full".to_string(),
                },
            )))
        });
        let now = Utc::now();
        let s = schedule(ScheduleType::Weekly, now);
        repo.insert(s.clone());
        let scheduler = scheduler(&repo, &launcher);

        scheduler.poll_once(now).await.unwrap();
        scheduler.drain().await;

        let stored = repo.get(s.id).unwrap();
        assert_eq!(stored.next_run_at, Some(now + chrono::Duration::weeks(1)));
        assert_eq!(stored.last_run_at, Some(now));
    }

    #[tokio::test]
    async fn stale_schedule_is_skipped_and_advanced() {
        let repo = Arc::new(InMemoryScheduleRepository::new());
        let launcher = FakeLauncher::started();
        let now = Utc::now();
        let missed = now - chrono::Duration::hours(3);
        let s = schedule(ScheduleType::Daily, missed);
        repo.insert(s.clone());
        let scheduler = scheduler(&repo, &launcher);

        assert_eq!(scheduler.poll_once(now).await.unwrap(), 0);
        scheduler.drain().await;

        assert!(launcher.calls().is_empty());
        let stored = repo.get(s.id).unwrap();
        assert_eq!(stored.next_run_at, Some(missed + chrono::Duration::days(1)));
        assert_eq!(stored.last_run_at, None);
        assert_eq!(stored.state, ScheduleState::Queued);
    }

    #[tokio::test]
    async fn recovered_claim_is_dispatched_despite_lag() {
        let repo = Arc::new(InMemoryScheduleRepository::new());
        let launcher = FakeLauncher::started();
        let now = Utc::now();
        let mut s = schedule(ScheduleType::Daily, now - chrono::Duration::hours(1));
        s.state = ScheduleState::Running;
        s.claimed_at = Some(now - chrono::Duration::hours(1));
        repo.insert(s.clone());
        let scheduler = scheduler(&repo, &launcher);

        assert_eq!(scheduler.poll_once(now).await.unwrap(), 1);
        scheduler.drain().await;

        assert_eq!(launcher.calls(), vec![s.workflow_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let repo = Arc::new(InMemoryScheduleRepository::new());
        let launcher = FakeLauncher::started();
        let s = schedule(ScheduleType::Daily, Utc::now());
        repo.insert(s.clone());
        let scheduler = Arc::new(scheduler(&repo, &launcher));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(launcher.calls(), vec![s.workflow_id]);
        assert_eq!(scheduler.in_flight(), 0);
    }
}
