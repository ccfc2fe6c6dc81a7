//! Per-actor activity counting and the high-activity alert.
//!
//! Each actor is `quiet` until its count reaches the threshold, at which point
//! the counter is zeroed and one alert summarizing the actor's most recent
//! events is published. A periodic reset zeroes every counter so actors who
//! never reach the threshold start over.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::bus::{Dispatcher, EVENT_HIGH_ACTIVITY_ALERT};
use crate::core::{format_elapsed, format_timestamp, ActivityEvent, ActivityRecord, Actor, NotificationKind, NotificationPayload};
use crate::store::{ActivityFilter, ActivityPatch, ActivityStore, SortOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    Quiet(u32),
    Triggered,
}

pub struct ActivityCounter {
    counts: Mutex<HashMap<String, u32>>,
    threshold: u32,
    channel: String,
    store: Arc<dyn ActivityStore>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl ActivityCounter {
    pub fn new(
        threshold: u32,
        channel: impl Into<String>,
        store: Arc<dyn ActivityStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
            channel: channel.into(),
            store,
            dispatcher,
        }
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one event for `actor_id`. The crossing and the reset happen under
    /// one lock, so exactly one caller sees `Triggered` per crossing.
    pub fn increment(&self, actor_id: &str) -> CounterState {
        let mut counts = self.counts();
        let count = counts.entry(actor_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            counts.remove(actor_id);
            CounterState::Triggered
        } else {
            CounterState::Quiet(*count)
        }
    }

    /// Count `event` and run the alert flow if it crossed the threshold.
    pub async fn record(&self, event: &ActivityEvent) -> Option<NotificationPayload> {
        match self.increment(&event.actor.id) {
            CounterState::Quiet(_) => None,
            CounterState::Triggered => Some(self.raise_alert(&event.actor).await),
        }
    }

    pub fn count_for(&self, actor_id: &str) -> u32 {
        self.counts().get(actor_id).copied().unwrap_or(0)
    }

    /// Zero every counter. Returns how many actors had a non-zero count.
    pub fn reset_all(&self) -> usize {
        let mut counts = self.counts();
        let cleared = counts.len();
        counts.clear();
        cleared
    }

    /// Spawn the global reset loop. The first reset happens one `period`
    /// from now. The loop ends once the counter is dropped.
    pub fn spawn_reset_loop(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let counter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(counter) = counter.upgrade() else {
                    break;
                };
                let cleared = counter.reset_all();
                if cleared > 0 {
                    tracing::debug!("activity counters reset for {cleared} actors");
                }
            }
        })
    }

    async fn raise_alert(&self, actor: &Actor) -> NotificationPayload {
        let recent = match self
            .store
            .query(
                &ActivityFilter::actor(actor.id.clone()),
                SortOrder::NewestFirst,
                Some(self.threshold as usize),
            )
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("high activity summary query failed for {}: {e}", actor.id);
                Vec::new()
            }
        };

        let summary = AlertSummary::from_newest_first(&recent);
        let payload = NotificationPayload::new(
            NotificationKind::HighActivityAlert,
            actor.clone(),
            format!(
                "High activity detected: {} performed {} operations in {}",
                actor.display_name(),
                self.threshold,
                summary.timeframe
            ),
            json!({
                "actorId": actor.id,
                "actorName": actor.name,
                "actorRole": actor.role,
                "threshold": self.threshold,
                "operationCount": recent.len(),
                "timeframe": summary.timeframe,
                "timeframeSeconds": summary.elapsed_secs,
                "firstOccurredAt": summary.first_occurred_at,
                "lastOccurredAt": summary.last_occurred_at,
                "operations": summary.operations,
                "eventIds": summary.event_ids,
            }),
        );

        let reached = self
            .dispatcher
            .publish(&self.channel, EVENT_HIGH_ACTIVITY_ALERT, &payload);
        tracing::info!(
            "high activity alert for {} ({} events, {} subscribers reached)",
            actor.id,
            recent.len(),
            reached
        );

        if !summary.event_ids.is_empty() {
            if let Err(e) = self
                .store
                .update(&summary.event_ids, ActivityPatch::notified())
                .await
            {
                tracing::warn!("failed to mark alerted events notified for {}: {e}", actor.id);
            }
        }

        payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationGroup {
    pub action: String,
    pub resource: String,
    pub count: u32,
}

#[derive(Debug, Clone, Default)]
struct AlertSummary {
    operations: Vec<OperationGroup>,
    event_ids: Vec<String>,
    elapsed_secs: u64,
    timeframe: String,
    first_occurred_at: Option<String>,
    last_occurred_at: Option<String>,
}

impl AlertSummary {
    fn from_newest_first(records: &[ActivityRecord]) -> Self {
        let mut grouped: BTreeMap<(&str, &str), u32> = BTreeMap::new();
        for record in records {
            *grouped
                .entry((record.event.action.as_str(), record.event.resource.as_str()))
                .or_insert(0) += 1;
        }
        let mut operations: Vec<OperationGroup> = grouped
            .into_iter()
            .map(|((action, resource), count)| OperationGroup {
                action: action.to_string(),
                resource: resource.to_string(),
                count,
            })
            .collect();
        // BTreeMap order already breaks ties by action then resource.
        operations.sort_by(|a, b| b.count.cmp(&a.count));

        let newest = records.first().map(|r| r.event.occurred_at);
        let oldest = records.last().map(|r| r.event.occurred_at);
        let elapsed_secs = match (newest, oldest) {
            (Some(newest), Some(oldest)) => (newest - oldest).num_seconds().max(0) as u64,
            _ => 0,
        };

        Self {
            operations,
            event_ids: records.iter().map(|r| r.id.clone()).collect(),
            elapsed_secs,
            timeframe: format_elapsed(elapsed_secs),
            first_occurred_at: oldest.as_ref().map(format_timestamp),
            last_occurred_at: newest.as_ref().map(format_timestamp),
        }
    }
}
