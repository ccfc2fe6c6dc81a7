//! Common test utilities for the notification engine integration tests.
#![allow(dead_code)]

pub mod flaky_store;
pub mod recording_dispatcher;

use std::future::Future;
use std::time::Duration;

use activity_notify::{Actor, EventDetail, InboundActivity};

pub use flaky_store::FlakyStore;
pub use recording_dispatcher::RecordingDispatcher;

pub fn actor(id: &str) -> Actor {
    Actor::new(format!("id-{id}"), id, "admin")
}

pub fn operation(actor_name: &str, action: &str, resource: &str) -> InboundActivity {
    InboundActivity::new(actor(actor_name), action, resource).with_detail(EventDetail {
        method: Some("POST".to_string()),
        path: Some(format!("/{resource}")),
        ip: Some("10.0.0.7".to_string()),
        user_agent: Some("integration-test".to_string()),
        ..EventDetail::default()
    })
}

/// Poll `check` until it returns true or `limit` elapses. Works with both
/// paused and real clocks.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
