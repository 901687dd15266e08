//! Filters that decide whether an external event fires a trigger.
//!
//! All text comparisons are case-insensitive containment. Time windows are
//! open on both ends.

use crate::calendar::{CalendarChange, CalendarEvent, ChangeKind, EventStatus};
use crate::mailbox::MailMessage;
use chrono::{DateTime, Duration, Utc};
use runwright_workflow::trigger::{CalendarCondition, CalendarTriggerConfig, EmailTriggerConfig};

/// Returns true if any keyword occurs in any field. No keywords match
/// everything.
#[must_use]
pub fn contains_any_keyword<'a>(
    keywords: &[String],
    fields: impl IntoIterator<Item = &'a str>,
) -> bool {
    let needles: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    if needles.is_empty() {
        return true;
    }
    let haystacks: Vec<String> = fields.into_iter().map(str::to_lowercase).collect();
    needles
        .iter()
        .any(|needle| haystacks.iter().any(|field| field.contains(needle.as_str())))
}

/// Which side of the boundary the window lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSide {
    /// `boundary - window < now < boundary`
    Before,
    /// `boundary < now < boundary + window`
    After,
}

/// Tests `now` against a window next to `boundary`.
#[must_use]
pub fn within_window(
    now: DateTime<Utc>,
    boundary: DateTime<Utc>,
    window: Duration,
    side: WindowSide,
) -> bool {
    match side {
        WindowSide::Before => boundary - window < now && now < boundary,
        WindowSide::After => boundary < now && now < boundary + window,
    }
}

fn calendar_fields(event: &CalendarEvent) -> impl Iterator<Item = &str> {
    [
        event.title.as_str(),
        event.description.as_str(),
        event.location.as_str(),
    ]
    .into_iter()
    .chain(event.attendees.iter().map(String::as_str))
}

/// Matches an incremental calendar change against a change-based condition.
#[must_use]
pub fn calendar_change_matches(config: &CalendarTriggerConfig, change: &CalendarChange) -> bool {
    let wanted = match config.condition {
        CalendarCondition::EventCreated => ChangeKind::Created,
        CalendarCondition::EventUpdated => ChangeKind::Updated,
        CalendarCondition::EventCancelled => ChangeKind::Cancelled,
        CalendarCondition::StartingSoon { .. }
        | CalendarCondition::EndingSoon { .. }
        | CalendarCondition::JustEnded { .. } => return false,
    };
    change.kind == wanted && contains_any_keyword(&config.keywords, calendar_fields(&change.event))
}

/// Matches an event against a time-based condition at `now`.
///
/// Returns the boundary (start or end) the window was measured from, which
/// distinguishes occurrences of a rescheduled event.
#[must_use]
pub fn calendar_window_matches(
    config: &CalendarTriggerConfig,
    event: &CalendarEvent,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if event.status == EventStatus::Cancelled {
        return None;
    }
    let (boundary, side) = match config.condition {
        CalendarCondition::StartingSoon { .. } => (event.start, WindowSide::Before),
        CalendarCondition::EndingSoon { .. } => (event.end, WindowSide::Before),
        CalendarCondition::JustEnded { .. } => (event.end, WindowSide::After),
        CalendarCondition::EventCreated
        | CalendarCondition::EventUpdated
        | CalendarCondition::EventCancelled => return None,
    };
    let window = config.condition.window()?;
    (within_window(now, boundary, window, side)
        && contains_any_keyword(&config.keywords, calendar_fields(event)))
    .then_some(boundary)
}

/// Matches a message against an email trigger.
#[must_use]
pub fn email_matches(config: &EmailTriggerConfig, message: &MailMessage) -> bool {
    let fields = [
        message.subject.as_str(),
        message.snippet.as_str(),
        message.from.as_str(),
    ]
    .into_iter()
    .chain(message.to.iter().map(String::as_str));
    if !contains_any_keyword(&config.keywords, fields) {
        return false;
    }

    if let Some(from) = &config.from {
        let from = from.trim().to_lowercase();
        if !from.is_empty() && !message.from.to_lowercase().contains(&from) {
            return false;
        }
    }

    config.labels.iter().all(|wanted| {
        message
            .labels
            .iter()
            .any(|label| label.eq_ignore_ascii_case(wanted))
    })
}
