//! Push messages and the notifications they raise.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use swkit_common::Result;
use tracing::debug;

use crate::config::NotificationConfig;

/// Push payload sent by the application server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushPayload {
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Opaque correlation value, echoed into the notification data.
    #[serde(default, rename = "primaryKey")]
    pub primary_key: Option<serde_json::Value>,
}

impl PushPayload {
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Data attached to a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    /// Milliseconds since the Unix epoch.
    pub date_of_arrival: i64,
    pub primary_key: Option<serde_json::Value>,
}

/// A displayed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: Vec<Notification>,
    next_id: u64,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a notification for `payload`.
    pub fn show(&mut self, payload: PushPayload, config: &NotificationConfig) -> Notification {
        self.next_id += 1;
        let notification = Notification {
            id: self.next_id,
            title: payload.title,
            body: payload.body,
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: config.vibrate.clone(),
            data: NotificationData {
                date_of_arrival: Utc::now().timestamp_millis(),
                primary_key: payload.primary_key,
            },
        };
        debug!(id = notification.id, title = %notification.title, "Notification shown");
        self.shown.push(notification.clone());
        notification
    }

    pub fn close(&mut self, id: u64) -> Option<Notification> {
        let index = self.shown.iter().position(|n| n.id == id)?;
        Some(self.shown.remove(index))
    }

    pub fn active(&self) -> &[Notification] {
        &self.shown
    }
}
