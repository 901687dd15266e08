//! Trigger configuration types.
//!
//! Trigger nodes are the roots of a workflow graph. They never execute as
//! tasks; instead the scheduler and the event pollers watch for the condition
//! they describe and start a run when it fires. The same configuration is
//! denormalized into schedule and trigger-watch records for lookup.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How often a scheduled trigger recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fires a single time.
    Once,
    /// Fires every 24 hours.
    Daily,
    /// Fires every 7 days.
    Weekly,
    /// Fires on the same day of every month.
    Monthly,
}

impl ScheduleType {
    /// Returns the string stored for this schedule type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Parses a stored schedule type.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "once" => Some(Self::Once),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    /// Returns true for schedules that fire more than once.
    #[must_use]
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once)
    }
}

/// Configuration for a time-based trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTriggerConfig {
    /// Recurrence of the schedule.
    pub schedule_type: ScheduleType,
    /// First time the schedule fires.
    pub start_at: DateTime<Utc>,
}

/// The calendar condition a calendar trigger waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalendarCondition {
    /// A new event appeared on the calendar.
    EventCreated,
    /// An existing event changed.
    EventUpdated,
    /// An event was cancelled.
    EventCancelled,
    /// An event starts within the next `minutes`.
    StartingSoon { minutes: u32 },
    /// An event ends within the next `minutes`.
    EndingSoon { minutes: u32 },
    /// An event ended within the last `minutes`.
    JustEnded { minutes: u32 },
}

impl CalendarCondition {
    /// Returns the window length for time-based conditions.
    ///
    /// Change-based conditions return `None`; they are evaluated against the
    /// incremental delta rather than a time window.
    #[must_use]
    pub fn window(&self) -> Option<Duration> {
        match self {
            Self::StartingSoon { minutes }
            | Self::EndingSoon { minutes }
            | Self::JustEnded { minutes } => Some(Duration::minutes(i64::from(*minutes))),
            Self::EventCreated | Self::EventUpdated | Self::EventCancelled => None,
        }
    }

    /// Returns true if this condition is evaluated against a time window.
    #[must_use]
    pub fn is_time_based(&self) -> bool {
        self.window().is_some()
    }
}

/// Configuration for a calendar trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarTriggerConfig {
    /// Calendar to watch. `None` means the user's primary calendar.
    #[serde(default)]
    pub calendar_id: Option<String>,
    /// What has to happen for the trigger to fire.
    pub condition: CalendarCondition,
    /// Case-insensitive keywords; any one of them must appear in the title,
    /// description, location or attendees. Empty matches every event.
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Configuration for a mailbox trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailTriggerConfig {
    /// Case-insensitive keywords; any one of them must appear in the subject,
    /// snippet, sender or recipients. Empty matches every message.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Sender filter (case-insensitive containment).
    #[serde(default)]
    pub from: Option<String>,
    /// Labels the message must carry, all of them.
    #[serde(default)]
    pub labels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_type_string_roundtrip() {
        for schedule_type in [
            ScheduleType::Once,
            ScheduleType::Daily,
            ScheduleType::Weekly,
            ScheduleType::Monthly,
        ] {
            assert_eq!(ScheduleType::parse(schedule_type.as_str()), Some(schedule_type));
        }
        assert_eq!(ScheduleType::parse("hourly"), None);
    }

    #[test]
    fn only_once_is_not_recurring() {
        assert!(!ScheduleType::Once.is_recurring());
        assert!(ScheduleType::Monthly.is_recurring());
    }

    #[test]
    fn calendar_condition_window() {
        assert_eq!(
            CalendarCondition::StartingSoon { minutes: 15 }.window(),
            Some(Duration::minutes(15))
        );
        assert!(!CalendarCondition::EventCreated.is_time_based());
    }

    #[test]
    fn calendar_config_defaults() {
        let config: CalendarTriggerConfig =
            serde_json::from_value(serde_json::json!({"condition": {"type": "event_created"}}))
                .expect("deserialize");
        assert!(config.keywords.is_empty());
        assert!(config.calendar_id.is_none());
    }
}
