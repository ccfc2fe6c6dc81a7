//! Shared domain types: accepted events, stored records and outbound payloads.

pub mod event;
pub mod notification;

pub use event::{
    format_elapsed, format_timestamp, parse_timestamp, ActivityEvent, ActivityRecord, Actor,
    Classification, EventDetail, InboundActivity,
};
pub use notification::{NotificationKind, NotificationPayload};
