//! Keyed batch accumulation with debounce and hard-window flushing.
//!
//! Every `(actor, action, resource, tenant)` key owns at most one pending
//! [`BatchEntry`]. Two timers race to flush it:
//! - the debounce timer restarts on every event and fires after a quiet period
//! - the window timer starts with the entry and fires regardless of load
//!
//! Whichever fires first removes the entry under the map lock and cancels the
//! other. Entries carry a generation number and timers only flush the
//! generation that spawned them, so a late timer never touches a newer entry
//! for the same key.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::bus::{Dispatcher, EVENT_ACTIVITY_AGGREGATED};
use crate::config::NotifierConfig;
use crate::core::{
    format_elapsed, format_timestamp, ActivityEvent, Actor, Classification, NotificationKind,
    NotificationPayload,
};

pub const MAX_SAMPLED_RESOURCE_IDS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchKey {
    pub actor_id: String,
    pub action: String,
    pub resource: String,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    Debounce,
    Window,
    Manual,
    Drain,
}

/// Outcome of one flush. `reached` is `None` when the batch was below the
/// minimum size and discarded without a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub key: BatchKey,
    pub count: u32,
    pub trigger: FlushTrigger,
    pub reached: Option<usize>,
}

impl FlushReport {
    pub fn emitted(&self) -> bool {
        self.reached.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub min_threshold: u32,
    pub window: Duration,
    pub debounce: Duration,
    pub tenant_in_key: bool,
    pub channel: String,
}

impl BatchSettings {
    pub fn from_config(cfg: &NotifierConfig) -> Self {
        Self {
            min_threshold: cfg.batch_min_threshold,
            window: cfg.batch_window(),
            debounce: cfg.batch_debounce(),
            tenant_in_key: cfg.tenant_in_batch_key,
            channel: cfg.admin_channel.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch entry
// ---------------------------------------------------------------------------

struct BatchEntry {
    key: BatchKey,
    generation: u64,
    actor: Actor,
    first_seen: Instant,
    last_seen: Instant,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    count: u32,
    by_primary: HashMap<String, u32>,
    by_secondary: HashMap<String, u32>,
    by_resource_id: HashMap<String, u32>,
    unclassified: u32,
    sampled_ids: Vec<String>,
    debounce: Option<JoinHandle<()>>,
    window: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub dimension: &'static str,
    pub counts: BTreeMap<String, u32>,
    pub unclassified: u32,
    pub text: String,
}

impl BatchEntry {
    fn new(key: BatchKey, generation: u64, event: &ActivityEvent) -> Self {
        let now = Instant::now();
        Self {
            key,
            generation,
            actor: event.actor.clone(),
            first_seen: now,
            last_seen: now,
            first_seen_at: event.occurred_at,
            last_seen_at: event.occurred_at,
            count: 0,
            by_primary: HashMap::new(),
            by_secondary: HashMap::new(),
            by_resource_id: HashMap::new(),
            unclassified: 0,
            sampled_ids: Vec::new(),
            debounce: None,
            window: None,
        }
    }

    fn absorb(&mut self, event: &ActivityEvent) {
        self.count += 1;
        self.last_seen = Instant::now();
        self.last_seen_at = event.occurred_at;

        match event.classification() {
            Classification::Primary(value) => {
                *self.by_primary.entry(value.to_string()).or_insert(0) += 1;
            }
            Classification::Secondary(value) => {
                *self.by_secondary.entry(value.to_string()).or_insert(0) += 1;
            }
            Classification::Unclassified => self.unclassified += 1,
        }

        if let Some(resource_id) = event.resource_id.as_deref() {
            *self.by_resource_id.entry(resource_id.to_string()).or_insert(0) += 1;
            if self.sampled_ids.len() < MAX_SAMPLED_RESOURCE_IDS
                && !self.sampled_ids.iter().any(|id| id == resource_id)
            {
                self.sampled_ids.push(resource_id.to_string());
            }
        }
    }

    fn cancel_timers_except(&mut self, trigger: FlushTrigger) {
        if trigger != FlushTrigger::Debounce {
            if let Some(handle) = self.debounce.take() {
                handle.abort();
            }
        }
        if trigger != FlushTrigger::Window {
            if let Some(handle) = self.window.take() {
                handle.abort();
            }
        }
    }

    /// Summary over the breakdown with the most distinct values. Ties prefer
    /// the primary attribute, then the secondary one.
    fn summary(&self) -> BatchSummary {
        let candidates = [
            ("primary", &self.by_primary),
            ("secondary", &self.by_secondary),
            ("resourceId", &self.by_resource_id),
        ];
        let mut richest: Option<(&'static str, &HashMap<String, u32>)> = None;
        for (dimension, map) in candidates {
            if map.is_empty() {
                continue;
            }
            if richest.map_or(true, |(_, best)| map.len() > best.len()) {
                richest = Some((dimension, map));
            }
        }

        let Some((dimension, map)) = richest else {
            return BatchSummary {
                dimension: "none",
                counts: BTreeMap::new(),
                unclassified: self.unclassified,
                text: format!("{} operations", self.count),
            };
        };

        let mut ranked: Vec<(&String, &u32)> = map.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let text = ranked
            .iter()
            .map(|(value, count)| format!("{value}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");

        BatchSummary {
            dimension,
            counts: map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            unclassified: self.unclassified,
            text,
        }
    }

    fn to_payload(&self, trigger: FlushTrigger) -> NotificationPayload {
        let elapsed = self.last_seen.saturating_duration_since(self.first_seen);
        let timeframe_ms = elapsed.as_millis() as u64;
        let timeframe_secs = (timeframe_ms + 500) / 1000;
        let timeframe = format_elapsed(timeframe_secs);
        let summary = self.summary();

        let message = format!(
            "{} performed {} {} operations on {} in {} ({})",
            self.actor.display_name(),
            self.count,
            self.key.action,
            self.key.resource,
            timeframe,
            summary.text
        );

        NotificationPayload::new(
            NotificationKind::Aggregated,
            self.actor.clone(),
            message,
            json!({
                "actorId": self.key.actor_id,
                "actorName": self.actor.name,
                "actorRole": self.actor.role,
                "action": self.key.action,
                "resource": self.key.resource,
                "tenantId": self.key.tenant_id,
                "totalOperations": self.count,
                "timeframe": {
                    "ms": timeframe_ms,
                    "seconds": timeframe_secs,
                    "display": timeframe,
                },
                "summary": summary,
                "sampleResourceIds": self.sampled_ids,
                "firstSeen": format_timestamp(&self.first_seen_at),
                "lastSeen": format_timestamp(&self.last_seen_at),
                "trigger": trigger,
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

struct Shared {
    entries: Mutex<HashMap<BatchKey, BatchEntry>>,
    next_generation: AtomicU64,
    settings: BatchSettings,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<BatchKey, BatchEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove and finish the entry for `key`. With `generation` set, only that
    /// generation is flushed.
    fn flush(&self, key: &BatchKey, generation: Option<u64>, trigger: FlushTrigger) -> Option<FlushReport> {
        let entry = {
            let mut entries = self.entries();
            let current = entries.get(key)?;
            if generation.is_some_and(|g| g != current.generation) {
                return None;
            }
            entries.remove(key)?
        };
        Some(self.finish(entry, trigger))
    }

    fn finish(&self, mut entry: BatchEntry, trigger: FlushTrigger) -> FlushReport {
        entry.cancel_timers_except(trigger);

        if entry.count < self.settings.min_threshold {
            tracing::debug!(
                "discarding batch {}/{}/{} with {} events (minimum {})",
                entry.key.actor_id,
                entry.key.action,
                entry.key.resource,
                entry.count,
                self.settings.min_threshold
            );
            return FlushReport {
                key: entry.key,
                count: entry.count,
                trigger,
                reached: None,
            };
        }

        let payload = entry.to_payload(trigger);
        let reached = self
            .dispatcher
            .publish(&self.settings.channel, EVENT_ACTIVITY_AGGREGATED, &payload);
        tracing::debug!(
            "flushed batch {}/{}/{} ({} events, {:?}, {} subscribers reached)",
            entry.key.actor_id,
            entry.key.action,
            entry.key.resource,
            entry.count,
            trigger,
            reached
        );

        FlushReport {
            key: entry.key,
            count: entry.count,
            trigger,
            reached: Some(reached),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in entries.values_mut() {
            entry.cancel_timers_except(FlushTrigger::Drain);
        }
    }
}

fn spawn_flush_timer(
    shared: Weak<Shared>,
    key: BatchKey,
    generation: u64,
    delay: Duration,
    trigger: FlushTrigger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        time::sleep(delay).await;
        if let Some(shared) = shared.upgrade() {
            shared.flush(&key, Some(generation), trigger);
        }
    })
}

/// Owned aggregation service. Cloning shares the same pending batches.
///
/// `enqueue` spawns timer tasks and must be called from within a tokio runtime.
#[derive(Clone)]
pub struct BatchAggregator {
    shared: Arc<Shared>,
}

impl BatchAggregator {
    pub fn new(settings: BatchSettings, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                settings,
                dispatcher,
            }),
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.shared.settings
    }

    /// Batch key for `event`, or `None` when actor or action is missing.
    pub fn key_for(&self, event: &ActivityEvent) -> Option<BatchKey> {
        if event.actor.id.trim().is_empty() || event.action.trim().is_empty() {
            return None;
        }
        Some(BatchKey {
            actor_id: event.actor.id.clone(),
            action: event.action.clone(),
            resource: event.resource.clone(),
            tenant_id: if self.shared.settings.tenant_in_key {
                event.tenant_id.clone()
            } else {
                None
            },
        })
    }

    /// Fold `event` into its batch and restart the batch's debounce timer.
    pub fn enqueue(&self, event: &ActivityEvent) -> Option<BatchKey> {
        let key = self.key_for(event)?;
        let settings = &self.shared.settings;

        let mut entries = self.shared.entries();
        let entry = match entries.entry(key.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
                let mut entry = BatchEntry::new(key.clone(), generation, event);
                entry.window = Some(spawn_flush_timer(
                    Arc::downgrade(&self.shared),
                    key.clone(),
                    generation,
                    settings.window,
                    FlushTrigger::Window,
                ));
                vacant.insert(entry)
            }
        };

        entry.absorb(event);
        if let Some(previous) = entry.debounce.take() {
            previous.abort();
        }
        entry.debounce = Some(spawn_flush_timer(
            Arc::downgrade(&self.shared),
            key.clone(),
            entry.generation,
            settings.debounce,
            FlushTrigger::Debounce,
        ));

        Some(key)
    }

    /// Flush `key` now, whatever its timers say. `None` if nothing is pending.
    pub fn flush(&self, key: &BatchKey) -> Option<FlushReport> {
        self.shared.flush(key, None, FlushTrigger::Manual)
    }

    /// Flush every pending batch. Used on shutdown.
    pub fn flush_all(&self) -> Vec<FlushReport> {
        let drained: Vec<BatchEntry> = {
            let mut entries = self.shared.entries();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        drained
            .into_iter()
            .map(|entry| self.shared.finish(entry, FlushTrigger::Drain))
            .collect()
    }

    /// Pending keys with their current counts, in key order.
    pub fn pending(&self) -> Vec<(BatchKey, u32)> {
        let entries = self.shared.entries();
        let mut pending: Vec<(BatchKey, u32)> = entries
            .values()
            .map(|entry| (entry.key.clone(), entry.count))
            .collect();
        pending.sort();
        pending
    }

    pub fn pending_count(&self, key: &BatchKey) -> Option<u32> {
        self.shared.entries().get(key).map(|entry| entry.count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast;

    use super::*;
    use crate::bus::{DispatchEnvelope, EventBus};
    use crate::core::{EventDetail, InboundActivity};

    fn settings() -> BatchSettings {
        BatchSettings {
            min_threshold: 3,
            window: Duration::from_secs(120),
            debounce: Duration::from_secs(15),
            tenant_in_key: true,
            channel: "admins".to_string(),
        }
    }

    fn aggregator(settings: BatchSettings) -> (BatchAggregator, broadcast::Receiver<DispatchEnvelope>) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe("admins");
        (BatchAggregator::new(settings, bus), rx)
    }

    fn upload(actor: &str, primary: Option<&str>, resource_id: Option<&str>) -> ActivityEvent {
        let mut detail = EventDetail::default();
        detail.primary_attr = primary.map(str::to_string);
        let mut inbound = InboundActivity::new(Actor::new(actor, actor, "editor"), "upload", "image")
            .with_detail(detail);
        if let Some(id) = resource_id {
            inbound = inbound.with_resource_id(id);
        }
        inbound.into_event(Utc::now()).unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<DispatchEnvelope>) -> Vec<DispatchEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_flushes_after_quiet_period() {
        let (agg, mut rx) = aggregator(settings());
        for _ in 0..3 {
            agg.enqueue(&upload("alice", Some("png"), None));
            time::sleep(Duration::from_secs(1)).await;
        }
        // last event at t=2s, debounce due at t=17s
        time::sleep(Duration::from_secs(13)).await;
        assert!(drain(&mut rx).is_empty());

        time::sleep(Duration::from_secs(3)).await;
        let flushed = drain(&mut rx);
        assert_eq!(flushed.len(), 1);
        let data = &flushed[0].payload.data;
        assert_eq!(data["totalOperations"], 3);
        assert_eq!(data["timeframe"]["ms"], 2000);
        assert_eq!(data["timeframe"]["display"], "2s");
        assert_eq!(data["trigger"], "debounce");
        assert!(agg.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn window_bounds_a_continuous_burst() {
        let (agg, mut rx) = aggregator(settings());
        // one event every 7s never lets the 15s debounce fire
        for _ in 0..19 {
            agg.enqueue(&upload("alice", None, None));
            time::sleep(Duration::from_secs(7)).await;
        }
        // t=133s: the window fired at t=120s with the 18 events up to t=119s
        let flushed = drain(&mut rx);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].payload.data["totalOperations"], 18);
        assert_eq!(flushed[0].payload.data["trigger"], "window");

        // the event at t=126s started a fresh batch
        let key = agg.key_for(&upload("alice", None, None)).unwrap();
        assert_eq!(agg.pending_count(&key), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn event_after_window_flush_starts_new_generation() {
        let mut cfg = settings();
        cfg.min_threshold = 1;
        let (agg, mut rx) = aggregator(cfg);

        for _ in 0..18 {
            agg.enqueue(&upload("alice", None, None));
            time::sleep(Duration::from_secs(7)).await;
        }
        // t=126s: the window flushed at t=120s; the old debounce (due t=134s) is cancelled
        assert_eq!(drain(&mut rx).len(), 1);

        agg.enqueue(&upload("alice", None, None));

        // the flushed batch's debounce must not fire for the new batch at t=134s
        time::sleep(Duration::from_secs(10)).await;
        assert!(drain(&mut rx).is_empty());

        // the new batch debounces 15s after its own event (t=141s)
        time::sleep(Duration::from_secs(6)).await;
        let flushed = drain(&mut rx);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].payload.data["totalOperations"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn below_threshold_is_discarded() {
        let (agg, mut rx) = aggregator(settings());
        let key = agg.enqueue(&upload("bob", None, None)).unwrap();
        agg.enqueue(&upload("bob", None, None));
        assert_eq!(agg.pending_count(&key), Some(2));

        time::sleep(Duration::from_secs(200)).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(agg.pending_count(&key), None);
    }

    #[tokio::test]
    async fn manual_flush_reports_outcome() {
        let (agg, mut rx) = aggregator(settings());
        let key = agg.enqueue(&upload("bob", None, None)).unwrap();
        let report = agg.flush(&key).unwrap();
        assert_eq!(report.count, 1);
        assert_eq!(report.trigger, FlushTrigger::Manual);
        assert!(!report.emitted());
        assert!(agg.flush(&key).is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let (agg, _rx) = aggregator(settings());
        let alice = agg.enqueue(&upload("alice", None, None)).unwrap();
        let bob = agg.enqueue(&upload("bob", None, None)).unwrap();
        agg.enqueue(&upload("alice", None, None));

        let mut tenant_event = upload("alice", None, None);
        tenant_event.tenant_id = Some("t-1".to_string());
        let tenant_key = agg.enqueue(&tenant_event).unwrap();
        assert_ne!(tenant_key, alice);

        assert_eq!(agg.pending_count(&alice), Some(2));
        assert_eq!(agg.pending_count(&bob), Some(1));
        assert_eq!(agg.pending_count(&tenant_key), Some(1));
    }

    #[tokio::test]
    async fn tenant_can_be_left_out_of_the_key() {
        let mut cfg = settings();
        cfg.tenant_in_key = false;
        let (agg, _rx) = aggregator(cfg);

        let mut first = upload("alice", None, None);
        first.tenant_id = Some("t-1".to_string());
        let mut second = upload("alice", None, None);
        second.tenant_id = Some("t-2".to_string());

        let key = agg.enqueue(&first).unwrap();
        assert_eq!(key.tenant_id, None);
        assert_eq!(agg.enqueue(&second), Some(key.clone()));
        assert_eq!(agg.pending_count(&key), Some(2));
    }

    #[tokio::test]
    async fn missing_identity_is_a_no_op() {
        let (agg, _rx) = aggregator(settings());
        let mut event = upload("alice", None, None);
        event.action = String::new();
        assert!(agg.enqueue(&event).is_none());
        assert!(agg.pending().is_empty());
    }

    #[tokio::test]
    async fn breakdown_and_samples() {
        let (agg, mut rx) = aggregator(settings());
        let mut key = None;
        for i in 0..12 {
            let primary = if i % 3 == 0 { Some("jpg") } else { Some("png") };
            key = agg.enqueue(&upload("alice", primary, Some(format!("img-{}", i % 11).as_str())));
        }
        let mut bare = upload("alice", None, None);
        bare.detail.secondary_attr = Some("thumbnail".to_string());
        agg.enqueue(&bare);

        let report = agg.flush(&key.unwrap()).unwrap();
        assert_eq!(report.count, 13);

        let flushed = drain(&mut rx);
        let data = &flushed[0].payload.data;
        // 11 distinct resource ids beats 2 primary values
        assert_eq!(data["summary"]["dimension"], "resourceId");
        assert_eq!(data["summary"]["counts"]["img-0"], 2);
        let samples = data["sampleResourceIds"].as_array().unwrap();
        assert_eq!(samples.len(), MAX_SAMPLED_RESOURCE_IDS);
        assert_eq!(samples[0], "img-0");
        assert_eq!(data["trigger"], "manual");
    }

    #[tokio::test]
    async fn summary_prefers_primary_on_ties_and_reports_unclassified() {
        let (agg, mut rx) = aggregator(settings());
        let key = agg.enqueue(&upload("alice", Some("png"), Some("a"))).unwrap();
        agg.enqueue(&upload("alice", Some("png"), Some("a")));
        agg.enqueue(&upload("alice", None, None));
        agg.flush(&key);

        let flushed = drain(&mut rx);
        let summary = &flushed[0].payload.data["summary"];
        assert_eq!(summary["dimension"], "primary");
        assert_eq!(summary["text"], "png: 2");
        assert_eq!(summary["unclassified"], 1);
    }

    #[tokio::test]
    async fn flush_all_drains_everything() {
        let (agg, mut rx) = aggregator(settings());
        for _ in 0..3 {
            agg.enqueue(&upload("alice", None, None));
        }
        agg.enqueue(&upload("bob", None, None));

        let mut reports = agg.flush_all();
        reports.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(reports.len(), 2);
        assert!(reports[0].emitted());
        assert!(!reports[1].emitted());
        assert!(reports.iter().all(|r| r.trigger == FlushTrigger::Drain));
        assert!(agg.pending().is_empty());
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
