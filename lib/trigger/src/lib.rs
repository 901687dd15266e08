//! External event triggers.
//!
//! Calendar and email trigger nodes become [`TriggerWatch`]es. An
//! [`EventPoller`] periodically asks an [`EventSource`] for what changed since
//! each watch's sync cursor and launches the workflow for matching events.

pub mod calendar;
pub mod error;
pub mod mailbox;
pub mod matcher;
pub mod poller;
pub mod repository;
pub mod source;
pub mod watch;

pub use calendar::{
    CalendarChange, CalendarDelta, CalendarEvent, CalendarProvider, CalendarSource, ChangeKind,
    EventStatus, InMemoryCalendarProvider,
};
pub use error::{PollerError, ProviderError, SourceError};
pub use mailbox::{InMemoryMailboxProvider, MailMessage, MailboxDelta, MailboxProvider, MailboxSource};
pub use poller::{EventPoller, PollSummary, PollerConfig, WatchOutcome};
pub use repository::{InMemoryTriggerWatchRepository, TriggerWatchRepository};
pub use source::{Candidate, ChangeSet, EventSource};
pub use watch::{TriggerWatch, WatchConfig, WatchKind, WatchState, watches_for_graph};
