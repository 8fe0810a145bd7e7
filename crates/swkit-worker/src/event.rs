//! Events delivered to a worker and what handling them produced.

use serde::{Deserialize, Serialize};
use swkit_net::{Request, Response};

use crate::push::Notification;

/// Command posted by a page. Fire-and-forget; both are idempotent.
///
/// Wire form is `{"type": "SKIP_WAITING"}` / `{"type": "CLEAR_CACHE"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    SkipWaiting,
    ClearCache,
}

impl WorkerCommand {
    pub fn from_json(message: &str) -> swkit_common::Result<Self> {
        Ok(serde_json::from_str(message)?)
    }
}

/// Event dispatched to a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(WorkerCommand),
    /// Raw push data; `None` when the push carried no payload.
    Push(Option<String>),
    NotificationClick { notification_id: u64 },
}

impl WorkerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Message(_) => "message",
            WorkerEvent::Push(_) => "push",
            WorkerEvent::NotificationClick { .. } => "notificationclick",
        }
    }
}

/// Result of handling a [`WorkerEvent`].
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// Precache complete; the worker is waiting. `skip_waiting` asks the host
    /// to activate it right away.
    Installed { precached: usize, skip_waiting: bool },
    /// Stale namespaces removed and in-scope clients claimed.
    Activated { deleted: Vec<String>, claimed: usize },
    /// The worker produced a response.
    Response(Response),
    /// Not intercepted; the host should go to the network directly.
    Passthrough,
    /// Skip-waiting recorded. `waiting` is whether the worker can be promoted now.
    SkipWaiting { waiting: bool },
    CachesCleared { removed: usize },
    NotificationShown(Notification),
    /// Notification closed and a window focused or opened.
    NotificationClicked { client_id: String, opened: bool },
    /// Nothing to do (e.g. a push without payload).
    Ignored,
}

impl EventOutcome {
    pub fn into_response(self) -> Option<Response> {
        match self {
            EventOutcome::Response(response) => Some(response),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        assert_eq!(
            WorkerCommand::from_json(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
            WorkerCommand::SkipWaiting
        );
        assert_eq!(
            WorkerCommand::from_json(r#"{"type":"CLEAR_CACHE"}"#).unwrap(),
            WorkerCommand::ClearCache
        );
        assert_eq!(
            serde_json::to_string(&WorkerCommand::SkipWaiting).unwrap(),
            r#"{"type":"SKIP_WAITING"}"#
        );
        assert!(WorkerCommand::from_json(r#"{"type":"RELOAD"}"#).is_err());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(WorkerEvent::Install.name(), "install");
        assert_eq!(
            WorkerEvent::NotificationClick { notification_id: 1 }.name(),
            "notificationclick"
        );
    }
}
