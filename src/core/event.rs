use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inbound shape
// ---------------------------------------------------------------------------

/// Free-form request attributes attached to an operation.
///
/// `primary_attr` and `secondary_attr` are the classifying attributes used by
/// the batch breakdown. Any other keys the host sends are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetail {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_attr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_attr: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An operation as reported by the hosting service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundActivity {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub actor_id: String,
    #[serde(default)]
    pub actor_name: String,
    #[serde(default)]
    pub actor_role: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub detail: EventDetail,
}

impl InboundActivity {
    pub fn new(
        actor: Actor,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            actor_id: actor.id,
            actor_name: actor.name,
            actor_role: actor.role,
            ..Self::default()
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_detail(mut self, detail: EventDetail) -> Self {
        self.detail = detail;
        self
    }

    /// Check the required identity fields and stamp the event.
    pub fn into_event(self, occurred_at: DateTime<Utc>) -> Result<ActivityEvent, String> {
        if self.actor_id.trim().is_empty() {
            return Err("missing actor id".to_string());
        }
        if self.action.trim().is_empty() {
            return Err("missing action".to_string());
        }
        Ok(ActivityEvent {
            actor: Actor {
                id: self.actor_id,
                name: self.actor_name,
                role: self.actor_role,
            },
            action: self.action,
            resource: self.resource,
            resource_id: self.resource_id.filter(|id| !id.is_empty()),
            tenant_id: self.tenant_id.filter(|id| !id.is_empty()),
            detail: self.detail,
            occurred_at,
            notified: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Accepted event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub role: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
        }
    }

    /// Name to show in messages; falls back to the id for anonymous actors.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub actor: Actor,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub tenant_id: Option<String>,
    pub detail: EventDetail,
    pub occurred_at: DateTime<Utc>,
    pub notified: bool,
}

impl ActivityEvent {
    /// Classifying value for the batch breakdown: primary attribute first,
    /// secondary second.
    pub fn classification(&self) -> Classification<'_> {
        if let Some(primary) = self.detail.primary_attr.as_deref().filter(|v| !v.is_empty()) {
            return Classification::Primary(primary);
        }
        if let Some(secondary) = self.detail.secondary_attr.as_deref().filter(|v| !v.is_empty()) {
            return Classification::Secondary(secondary);
        }
        Classification::Unclassified
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification<'a> {
    Primary(&'a str),
    Secondary(&'a str),
    Unclassified,
}

/// A persisted event together with its store id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: String,
    #[serde(flatten)]
    pub event: ActivityEvent,
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so that lexical order is chronological order.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Human readable elapsed time: `"42s"` below a minute, `"3m 5s"` above.
pub fn format_elapsed(total_secs: u64) -> String {
    if total_secs < 60 {
        format!("{total_secs}s")
    } else {
        format!("{}m {}s", total_secs / 60, total_secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> InboundActivity {
        InboundActivity::new(Actor::new("u-1", "alice", "editor"), "upload", "image")
    }

    #[test]
    fn rejects_missing_actor_or_action() {
        let mut missing_actor = inbound();
        missing_actor.actor_id = "  ".to_string();
        assert_eq!(
            missing_actor.into_event(Utc::now()).unwrap_err(),
            "missing actor id"
        );

        let mut missing_action = inbound();
        missing_action.action.clear();
        assert_eq!(
            missing_action.into_event(Utc::now()).unwrap_err(),
            "missing action"
        );
    }

    #[test]
    fn parses_camel_case_inbound_shape() {
        let raw = serde_json::json!({
            "action": "upload",
            "resource": "image",
            "actorId": "u-1",
            "actorName": "alice",
            "actorRole": "editor",
            "resourceId": "img-9",
            "detail": {
                "method": "POST",
                "path": "/images",
                "ip": "10.0.0.1",
                "userAgent": "curl/8",
                "primaryAttr": "png",
                "requestId": "r-1"
            }
        });
        let inbound: InboundActivity = serde_json::from_value(raw).unwrap();
        assert_eq!(inbound.actor_id, "u-1");
        assert_eq!(inbound.tenant_id, None);
        assert_eq!(inbound.detail.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(inbound.detail.extra["requestId"], "r-1");

        let event = inbound.into_event(Utc::now()).unwrap();
        assert!(!event.notified);
        assert_eq!(event.classification(), Classification::Primary("png"));
    }

    #[test]
    fn classification_falls_back_to_secondary() {
        let mut detail = EventDetail::default();
        detail.primary_attr = Some(String::new());
        detail.secondary_attr = Some("thumbnail".to_string());
        let event = inbound().with_detail(detail).into_event(Utc::now()).unwrap();
        assert_eq!(event.classification(), Classification::Secondary("thumbnail"));

        let bare = inbound().into_event(Utc::now()).unwrap();
        assert_eq!(bare.classification(), Classification::Unclassified);
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(0), "0s");
        assert_eq!(format_elapsed(59), "59s");
        assert_eq!(format_elapsed(60), "1m 0s");
        assert_eq!(format_elapsed(185), "3m 5s");
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:09.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T00:00:10Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(format_timestamp(&early) < format_timestamp(&late));
        assert_eq!(parse_timestamp(&format_timestamp(&early)), Some(early));
    }
}
