//! Workflow schedules and next-occurrence arithmetic.
//!
//! Recurring schedules always advance from the previous scheduled time, never
//! from "now", so a schedule keeps its time of day across restarts and catches
//! up after downtime with a single future occurrence instead of a burst.

use crate::error::ScheduleError;
use chrono::{DateTime, Datelike, Duration, Months, Utc};
use runwright_core::{NodeId, ScheduleId, UserId, WorkflowId};
use runwright_workflow::trigger::ScheduleType;
use runwright_workflow::{NodeConfig, WorkflowGraph, WorkflowNode};
use serde::{Deserialize, Serialize};

/// Dispatch state of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// Waiting for its next run time.
    Queued,
    /// Claimed by a scheduler instance.
    Running,
    /// Disabled; never returned as due.
    Paused,
    /// A one-off schedule that already fired.
    Completed,
}

impl ScheduleState {
    /// Returns the string stored for this state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    /// Parses a stored state.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A schedule record derived from a workflow's schedule trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    pub id: ScheduleId,
    pub workflow_id: WorkflowId,
    /// The user runs are started for.
    pub user_id: UserId,
    /// The trigger node this schedule came from.
    pub node_id: NodeId,
    pub schedule_type: ScheduleType,
    /// The first configured occurrence. Monthly schedules count from here so
    /// the day of month survives short months.
    pub starts_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub state: ScheduleState,
    /// When a scheduler instance claimed the schedule for dispatch.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set when a dispatch was given back because the workflow was busy or
    /// its run lock was unreachable. Cleared once the schedule advances.
    #[serde(default)]
    pub retrying: bool,
}

impl WorkflowSchedule {
    /// Builds the schedule for a schedule-trigger node.
    ///
    /// Returns `None` for any other node. A start time in the past is moved to
    /// the first future occurrence; a one-off schedule whose time has passed
    /// is created already completed.
    #[must_use]
    pub fn from_trigger(
        workflow_id: WorkflowId,
        user_id: UserId,
        node: &WorkflowNode,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let NodeConfig::ScheduleTrigger(config) = &node.config else {
            return None;
        };

        let next_run_at = if config.start_at >= now {
            Some(config.start_at)
        } else {
            next_after(config.schedule_type, config.start_at, config.start_at, now)
        };
        let state = if next_run_at.is_some() {
            ScheduleState::Queued
        } else {
            ScheduleState::Completed
        };

        Some(Self {
            id: ScheduleId::new(),
            workflow_id,
            user_id,
            node_id: node.id,
            schedule_type: config.schedule_type,
            starts_at: config.start_at,
            next_run_at,
            last_run_at: None,
            state,
            claimed_at: None,
            retrying: false,
        })
    }

    /// Returns true if the schedule should be handed to a scheduler at `now`.
    ///
    /// Queued schedules are due once their run time passes. Running schedules
    /// are due again when their claim is older than `claim_timeout`, which
    /// recovers schedules whose dispatcher crashed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>, claim_timeout: std::time::Duration) -> bool {
        let Some(next_run_at) = self.next_run_at else {
            return false;
        };
        if next_run_at > now {
            return false;
        }
        match self.state {
            ScheduleState::Queued => true,
            ScheduleState::Running => self
                .claimed_at
                .is_none_or(|claimed_at| lag(claimed_at, now) > claim_timeout),
            ScheduleState::Paused | ScheduleState::Completed => false,
        }
    }

    /// Checks that a due schedule may be dispatched now.
    ///
    /// `tolerance` is how far in the past the run time may lie, normally the
    /// poll interval. Schedules that were already running (a recovered claim)
    /// and schedules given back for a retry are exempt from the staleness
    /// check.
    ///
    /// # Errors
    ///
    /// Returns `MissingNextRun` or `Stale`.
    pub fn validate_due(
        &self,
        now: DateTime<Utc>,
        tolerance: std::time::Duration,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let next_run_at = self.next_run_at.ok_or(ScheduleError::MissingNextRun {
            schedule_id: self.id,
        })?;
        let exempt = self.retrying || self.state == ScheduleState::Running;
        if !exempt && lag(next_run_at, now) > tolerance {
            return Err(ScheduleError::Stale {
                schedule_id: self.id,
                next_run_at,
            });
        }
        Ok(next_run_at)
    }

    /// Computes the occurrence that follows the current `next_run_at`.
    ///
    /// The result is strictly after `now`. `Ok(None)` means the schedule is
    /// finished (one-off schedules).
    ///
    /// # Errors
    ///
    /// Returns `MissingNextRun` if there is no current run time, or
    /// `OutOfRange` if the next occurrence cannot be represented.
    pub fn next_occurrence(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let previous = self.next_run_at.ok_or(ScheduleError::MissingNextRun {
            schedule_id: self.id,
        })?;
        if !self.schedule_type.is_recurring() {
            return Ok(None);
        }
        next_after(self.schedule_type, self.starts_at, previous, now)
            .map(Some)
            .ok_or(ScheduleError::OutOfRange {
                schedule_id: self.id,
            })
    }
}

/// Builds the schedules of every schedule trigger in a graph.
#[must_use]
pub fn schedules_for_graph(
    graph: &WorkflowGraph,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Vec<WorkflowSchedule> {
    graph
        .nodes()
        .filter_map(|node| WorkflowSchedule::from_trigger(graph.id(), user_id, node, now))
        .collect()
}

/// How far `earlier` lies before `now`; zero if it is not in the past.
fn lag(earlier: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (now - earlier).to_std().unwrap_or_default()
}

/// First occurrence strictly after both `previous` and `now`.
fn next_after(
    schedule_type: ScheduleType,
    anchor: DateTime<Utc>,
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Once => None,
        ScheduleType::Daily => step_past(previous, Duration::days(1), now),
        ScheduleType::Weekly => step_past(previous, Duration::weeks(1), now),
        ScheduleType::Monthly => month_past(anchor, previous, now),
    }
}

fn step_past(previous: DateTime<Utc>, step: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = previous.checked_add_signed(step)?;
    if next > now {
        return Some(next);
    }
    let behind = (now - next).num_seconds() / step.num_seconds() + 1;
    let skip = Duration::try_seconds(step.num_seconds().checked_mul(behind)?)?;
    next.checked_add_signed(skip)
}

fn month_past(
    anchor: DateTime<Utc>,
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let floor = previous.max(now);
    let elapsed = (i64::from(previous.year()) - i64::from(anchor.year())) * 12
        + i64::from(previous.month())
        - i64::from(anchor.month());
    let mut months = u32::try_from(elapsed).unwrap_or(0).max(1);
    loop {
        let candidate = anchor.checked_add_months(Months::new(months))?;
        if candidate > floor {
            return Some(candidate);
        }
        months = months.checked_add(1)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use runwright_workflow::trigger::ScheduleTriggerConfig;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
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

    #[test]
    fn state_string_roundtrip() {
        for state in [
            ScheduleState::Queued,
            ScheduleState::Running,
            ScheduleState::Paused,
            ScheduleState::Completed,
        ] {
            assert_eq!(ScheduleState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ScheduleState::parse("done"), None);
    }

    #[test]
    fn daily_fires_one_day_later() {
        let t = at(2025, 3, 10, 7);
        let s = schedule(ScheduleType::Daily, t);
        assert_eq!(s.next_occurrence(t).unwrap(), Some(t + Duration::days(1)));
    }

    #[test]
    fn daily_catches_up_after_downtime() {
        let t = at(2025, 3, 10, 7);
        let s = schedule(ScheduleType::Daily, t);
        let now = at(2025, 3, 14, 9);
        assert_eq!(s.next_occurrence(now).unwrap(), Some(at(2025, 3, 15, 7)));
    }

    #[test]
    fn next_is_strictly_future_on_boundary() {
        let t = at(2025, 3, 10, 7);
        let s = schedule(ScheduleType::Daily, t);
        let now = at(2025, 3, 12, 7);
        assert_eq!(s.next_occurrence(now).unwrap(), Some(at(2025, 3, 13, 7)));
    }

    #[test]
    fn advancing_is_stable_under_replay() {
        let t = at(2025, 1, 1, 0);
        let now = at(2025, 2, 17, 13);
        let s = schedule(ScheduleType::Weekly, t);
        let first = s.next_occurrence(now).unwrap();
        let second = s.next_occurrence(now).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Some(at(2025, 2, 19, 0)));
    }

    #[test]
    fn monthly_keeps_day_of_month() {
        let anchor = at(2025, 1, 31, 9);
        let mut s = schedule(ScheduleType::Monthly, anchor);

        let feb = s.next_occurrence(anchor).unwrap().unwrap();
        assert_eq!(feb, at(2025, 2, 28, 9));

        s.next_run_at = Some(feb);
        let mar = s.next_occurrence(feb).unwrap().unwrap();
        assert_eq!(mar, at(2025, 3, 31, 9));
    }

    #[test]
    fn once_has_no_next_occurrence() {
        let t = at(2025, 3, 10, 7);
        assert_eq!(schedule(ScheduleType::Once, t).next_occurrence(t).unwrap(), None);
    }

    #[test]
    fn missing_next_run_is_rejected() {
        let mut s = schedule(ScheduleType::Daily, at(2025, 3, 10, 7));
        s.next_run_at = None;
        assert!(matches!(
            s.next_occurrence(Utc::now()),
            Err(ScheduleError::MissingNextRun { .. })
        ));
        assert!(s.validate_due(Utc::now(), std::time::Duration::from_secs(60)).is_err());
    }

    #[test]
    fn stale_unless_running() {
        let t = at(2025, 3, 10, 7);
        let now = t + Duration::minutes(10);
        let tolerance = std::time::Duration::from_secs(60);
        let mut s = schedule(ScheduleType::Daily, t);

        assert!(matches!(
            s.validate_due(now, tolerance),
            Err(ScheduleError::Stale { .. })
        ));
        assert_eq!(s.validate_due(t + Duration::seconds(30), tolerance), Ok(t));

        s.state = ScheduleState::Running;
        assert_eq!(s.validate_due(now, tolerance), Ok(t));
    }

    #[test]
    fn retried_schedule_is_not_stale() {
        let t = at(2025, 3, 10, 7);
        let tolerance = std::time::Duration::from_secs(30);
        let mut s = schedule(ScheduleType::Daily, t);
        s.retrying = true;

        assert_eq!(s.validate_due(t + Duration::minutes(5), tolerance), Ok(t));
    }

    #[test]
    fn due_respects_state_and_claims() {
        let t = at(2025, 3, 10, 7);
        let timeout = std::time::Duration::from_secs(300);
        let mut s = schedule(ScheduleType::Daily, t);

        assert!(!s.is_due(t - Duration::seconds(1), timeout));
        assert!(s.is_due(t, timeout));

        s.state = ScheduleState::Running;
        s.claimed_at = Some(t);
        assert!(!s.is_due(t + Duration::minutes(1), timeout));
        assert!(s.is_due(t + Duration::minutes(6), timeout));

        s.state = ScheduleState::Paused;
        assert!(!s.is_due(t + Duration::days(1), timeout));
    }

    #[test]
    fn schedules_come_from_schedule_triggers() {
        let now = at(2025, 3, 10, 12);
        let trigger = WorkflowNode::new(
            "every morning",
            NodeConfig::ScheduleTrigger(ScheduleTriggerConfig {
                schedule_type: ScheduleType::Daily,
                start_at: at(2025, 3, 1, 7),
            }),
        );
        let manual = WorkflowNode::new("by hand", NodeConfig::ManualTrigger);
        let trigger_id = trigger.id;
        let graph =
            WorkflowGraph::from_parts(WorkflowId::new(), vec![trigger, manual], vec![]).unwrap();

        let schedules = schedules_for_graph(&graph, UserId::new(), now);

        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].node_id, trigger_id);
        assert_eq!(schedules[0].next_run_at, Some(at(2025, 3, 11, 7)));
        assert_eq!(schedules[0].state, ScheduleState::Queued);
    }

    #[test]
    fn past_one_off_trigger_is_completed() {
        let now = at(2025, 3, 10, 12);
        let node = WorkflowNode::new(
            "once",
            NodeConfig::ScheduleTrigger(ScheduleTriggerConfig {
                schedule_type: ScheduleType::Once,
                start_at: at(2025, 3, 1, 7),
            }),
        );

        let s = WorkflowSchedule::from_trigger(WorkflowId::new(), UserId::new(), &node, now)
            .unwrap();

        assert_eq!(s.next_run_at, None);
        assert_eq!(s.state, ScheduleState::Completed);
    }
}
