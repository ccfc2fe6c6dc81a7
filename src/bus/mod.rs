//! Dispatch transport for outbound notifications.
//!
//! # Architecture
//!
//! Notifications flow from the engine → `Dispatcher` → channel subscribers:
//! - `Dispatcher`: the seam the engine publishes through; hosts may supply
//!   their own (websocket rooms, SSE fan-out, ...)
//! - `EventBus`: the in-process implementation, one tokio broadcast channel
//!   per channel name
//!
//! Delivery is live only. Anything that must survive a missed signal lives in
//! the activity store.

mod event_bus;
pub mod event_types;

pub use event_bus::{DispatchEnvelope, Dispatcher, EventBus};
pub use event_types::{event_name_for, EVENT_ACTIVITY_AGGREGATED, EVENT_ACTIVITY_NEW, EVENT_HIGH_ACTIVITY_ALERT};
