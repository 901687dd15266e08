//! Workflow node types and configurations.
//!
//! Every node carries a typed configuration whose `action_type` tag is the
//! discriminator used for handler dispatch. Trigger variants describe how a
//! run starts; action variants describe work executed by the executor.

use crate::trigger::{CalendarTriggerConfig, EmailTriggerConfig, ScheduleTriggerConfig};
use runwright_core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Discriminator of the schedule trigger.
pub const SCHEDULE_TRIGGER: &str = "schedule_trigger";
/// Discriminator of the calendar trigger.
pub const CALENDAR_TRIGGER: &str = "calendar_trigger";
/// Discriminator of the email trigger.
pub const EMAIL_TRIGGER: &str = "email_trigger";
/// Discriminator of the manual trigger.
pub const MANUAL_TRIGGER: &str = "manual_trigger";
/// Discriminator of the HTTP request action.
pub const HTTP_REQUEST: &str = "http_request";
/// Discriminator of the log action.
pub const LOG: &str = "log";
/// Discriminator of the delay action.
pub const DELAY: &str = "delay";
/// Discriminator of the send-email action.
pub const SEND_EMAIL: &str = "send_email";
/// Discriminator of the create-calendar-event action.
pub const CREATE_CALENDAR_EVENT: &str = "create_calendar_event";

/// HTTP method used by the request action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Severity used by the log action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Typed configuration of a node, tagged by `action_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Fires on a time schedule.
    ScheduleTrigger(ScheduleTriggerConfig),
    /// Fires on calendar changes.
    CalendarTrigger(CalendarTriggerConfig),
    /// Fires on new mail.
    EmailTrigger(EmailTriggerConfig),
    /// Fires only when started by hand.
    ManualTrigger,
    /// Calls an HTTP endpoint; non-2xx responses fail the node.
    HttpRequest {
        #[serde(default)]
        method: HttpMethod,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    /// Writes a message to the engine log.
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
    /// Waits before letting downstream nodes continue.
    Delay { seconds: u64 },
    /// Sends an email through the user's mail provider.
    SendEmail {
        to: Vec<String>,
        subject: String,
        body: String,
    },
    /// Creates an event on the user's calendar.
    CreateCalendarEvent {
        #[serde(default)]
        calendar_id: Option<String>,
        title: String,
        /// Minutes from execution time until the event starts.
        #[serde(default)]
        start_offset_minutes: i64,
        duration_minutes: u32,
    },
}

impl NodeConfig {
    /// Returns the discriminator string of this configuration.
    #[must_use]
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::ScheduleTrigger(_) => SCHEDULE_TRIGGER,
            Self::CalendarTrigger(_) => CALENDAR_TRIGGER,
            Self::EmailTrigger(_) => EMAIL_TRIGGER,
            Self::ManualTrigger => MANUAL_TRIGGER,
            Self::HttpRequest { .. } => HTTP_REQUEST,
            Self::Log { .. } => LOG,
            Self::Delay { .. } => DELAY,
            Self::SendEmail { .. } => SEND_EMAIL,
            Self::CreateCalendarEvent { .. } => CREATE_CALENDAR_EVENT,
        }
    }

    /// Returns true for trigger configurations.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            Self::ScheduleTrigger(_)
                | Self::CalendarTrigger(_)
                | Self::EmailTrigger(_)
                | Self::ManualTrigger
        )
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier within the workflow.
    pub id: NodeId,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Typed configuration.
    pub config: NodeConfig,
}

impl WorkflowNode {
    /// Creates a new node with a fresh ID.
    #[must_use]
    pub fn new(name: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            config,
        }
    }

    /// Returns the node's discriminator string.
    #[must_use]
    pub fn action_type(&self) -> &'static str {
        self.config.action_type()
    }

    /// Returns true if this node is a trigger.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.config.is_trigger()
    }
}
