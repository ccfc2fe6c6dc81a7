use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{format_timestamp, ActivityEvent, Actor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Immediate,
    Aggregated,
    HighActivityAlert,
}

impl NotificationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Aggregated => "aggregated",
            Self::HighActivityAlert => "high-activity-alert",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound envelope handed to the dispatcher. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub kind: NotificationKind,
    pub timestamp: String,
    pub actor: Actor,
    pub message: String,
    pub data: serde_json::Value,
}

impl NotificationPayload {
    pub fn new(
        kind: NotificationKind,
        actor: Actor,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::at(kind, Utc::now(), actor, message, data)
    }

    pub fn at(
        kind: NotificationKind,
        timestamp: DateTime<Utc>,
        actor: Actor,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            timestamp: format_timestamp(&timestamp),
            actor,
            message: message.into(),
            data,
        }
    }

    /// Live echo of a single accepted event.
    pub fn immediate(event: &ActivityEvent) -> Self {
        let message = match event.resource_id.as_deref() {
            Some(resource_id) => format!(
                "{} performed {} on {} {}",
                event.actor.display_name(),
                event.action,
                event.resource,
                resource_id
            ),
            None => format!(
                "{} performed {} on {}",
                event.actor.display_name(),
                event.action,
                event.resource
            ),
        };
        let data = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        Self::new(NotificationKind::Immediate, event.actor.clone(), message, data)
    }
}
