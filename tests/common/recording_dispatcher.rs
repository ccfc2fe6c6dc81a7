//! Dispatcher that keeps everything it is asked to publish.

use std::sync::Mutex;

use activity_notify::{Dispatcher, NotificationPayload};

#[derive(Default)]
pub struct RecordingDispatcher {
    published: Mutex<Vec<(String, NotificationPayload)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads published under `event_name`, in publish order.
    pub fn named(&self, event_name: &str) -> Vec<NotificationPayload> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event_name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn publish(&self, _channel: &str, event_name: &str, payload: &NotificationPayload) -> usize {
        self.published
            .lock()
            .unwrap()
            .push((event_name.to_string(), payload.clone()));
        1
    }
}
