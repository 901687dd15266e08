//! Trigger watches.
//!
//! A watch is the denormalized, pollable form of a calendar or email trigger
//! node: the filter configuration plus the provider sync cursor that marks how
//! far the watch has already looked.

use chrono::{DateTime, Utc};
use runwright_core::{NodeId, TriggerWatchId, UserId, WorkflowId};
use runwright_workflow::trigger::{CalendarTriggerConfig, EmailTriggerConfig};
use runwright_workflow::{NodeConfig, WorkflowGraph, WorkflowNode};
use serde::{Deserialize, Serialize};

/// Which provider a watch polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    Calendar,
    Email,
}

impl WatchKind {
    /// Returns the string stored for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::Email => "email",
        }
    }
}

/// Filter configuration of a watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchConfig {
    Calendar(CalendarTriggerConfig),
    Email(EmailTriggerConfig),
}

impl WatchConfig {
    /// The provider kind of this configuration.
    #[must_use]
    pub fn kind(&self) -> WatchKind {
        match self {
            Self::Calendar(_) => WatchKind::Calendar,
            Self::Email(_) => WatchKind::Email,
        }
    }
}

/// Poll state of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    /// Waiting for the next poll.
    Queued,
    /// Being polled.
    Running,
    /// Disabled; never polled.
    Paused,
}

impl WatchState {
    /// Returns the string stored for this state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }

    /// Parses a stored state.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

/// A calendar or mailbox watch for one trigger node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerWatch {
    pub id: TriggerWatchId,
    pub workflow_id: WorkflowId,
    pub user_id: UserId,
    pub node_id: NodeId,
    pub config: WatchConfig,
    /// Calendar sync token or mailbox history ID. `None` until the first poll
    /// establishes a baseline.
    pub sync_cursor: Option<String>,
    pub state: WatchState,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl TriggerWatch {
    /// Builds the watch for a calendar or email trigger node.
    ///
    /// Returns `None` for any other node.
    #[must_use]
    pub fn from_trigger(workflow_id: WorkflowId, user_id: UserId, node: &WorkflowNode) -> Option<Self> {
        let config = match &node.config {
            NodeConfig::CalendarTrigger(config) => WatchConfig::Calendar(config.clone()),
            NodeConfig::EmailTrigger(config) => WatchConfig::Email(config.clone()),
            _ => return None,
        };
        Some(Self {
            id: TriggerWatchId::new(),
            workflow_id,
            user_id,
            node_id: node.id,
            config,
            sync_cursor: None,
            state: WatchState::Queued,
            last_polled_at: None,
        })
    }

    /// The provider kind of this watch.
    #[must_use]
    pub fn kind(&self) -> WatchKind {
        self.config.kind()
    }
}

/// Builds the watches of every calendar and email trigger in a graph.
#[must_use]
pub fn watches_for_graph(graph: &WorkflowGraph, user_id: UserId) -> Vec<TriggerWatch> {
    graph
        .nodes()
        .filter_map(|node| TriggerWatch::from_trigger(graph.id(), user_id, node))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use runwright_workflow::trigger::CalendarCondition;

    #[test]
    fn watches_come_from_event_triggers() {
        let calendar = WorkflowNode::new(
            "before meetings",
            NodeConfig::CalendarTrigger(CalendarTriggerConfig {
                calendar_id: None,
                condition: CalendarCondition::StartingSoon { minutes: 10 },
                keywords: vec!["standup".to_string()],
            }),
        );
        let email = WorkflowNode::new(
            "invoices",
            NodeConfig::EmailTrigger(EmailTriggerConfig {
                keywords: vec!["invoice".to_string()],
                from: None,
                labels: vec![],
            }),
        );
        let manual = WorkflowNode::new("by hand", NodeConfig::ManualTrigger);
        let graph =
            WorkflowGraph::from_parts(WorkflowId::new(), vec![calendar, email, manual], vec![])
                .unwrap();

        let watches = watches_for_graph(&graph, UserId::new());

        let mut kinds: Vec<_> = watches.iter().map(TriggerWatch::kind).collect();
        kinds.sort_by_key(WatchKind::as_str);
        assert_eq!(kinds, vec![WatchKind::Calendar, WatchKind::Email]);
        assert!(watches.iter().all(|w| w.sync_cursor.is_none()));
        assert!(watches.iter().all(|w| w.state == WatchState::Queued));
    }

    #[test]
    fn config_is_tagged_by_kind() {
        let config = WatchConfig::Email(EmailTriggerConfig {
            keywords: vec![],
            from: Some("billing@example.com".to_string()),
            labels: vec!["INBOX".to_string()],
        });
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "email");
        assert_eq!(serde_json::from_value::<WatchConfig>(json).unwrap(), config);
    }

    #[test]
    fn state_string_roundtrip() {
        for state in [WatchState::Queued, WatchState::Running, WatchState::Paused] {
            assert_eq!(WatchState::parse(state.as_str()), Some(state));
        }
    }
}
