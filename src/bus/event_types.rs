//! Event names published on the admin channel.
//!
//! Single source of truth for the names hosts subscribe to and for mapping a
//! notification kind onto its event name.

use crate::core::NotificationKind;

pub const EVENT_ACTIVITY_NEW: &str = "activity:new";
pub const EVENT_ACTIVITY_AGGREGATED: &str = "activity:aggregated";
pub const EVENT_HIGH_ACTIVITY_ALERT: &str = "activity:high-activity-alert";

pub fn event_name_for(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Immediate => EVENT_ACTIVITY_NEW,
        NotificationKind::Aggregated => EVENT_ACTIVITY_AGGREGATED,
        NotificationKind::HighActivityAlert => EVENT_HIGH_ACTIVITY_ALERT,
    }
}
