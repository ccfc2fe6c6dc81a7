//! Event intake: the single entry point hosts call for every operation.
//!
//! `accept` validates synchronously and then fans the event out:
//! - immediate broadcast on the admin channel
//! - the batch aggregator
//! - a spawned task that persists the event and then counts it, so an
//!   alert query always sees the event that crossed the threshold
//!
//! Only validation failures reach the caller. Everything downstream is
//! logged and absorbed here.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::bus::{event_name_for, Dispatcher};
use crate::config::NotifierConfig;
use crate::core::{ActivityEvent, ActivityRecord, InboundActivity, NotificationPayload};
use crate::store::{ActivityFilter, ActivityStore, SortOrder};
use crate::ActivityError;

use super::aggregator::{BatchAggregator, BatchSettings, FlushReport};
use super::counter::ActivityCounter;

pub struct ActivityNotifier {
    config: NotifierConfig,
    store: Arc<dyn ActivityStore>,
    dispatcher: Arc<dyn Dispatcher>,
    counter: Arc<ActivityCounter>,
    aggregator: BatchAggregator,
    reset_task: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityNotifier {
    pub fn new(
        config: NotifierConfig,
        store: Arc<dyn ActivityStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, ActivityError> {
        config.validate()?;
        let counter = Arc::new(ActivityCounter::new(
            config.activity_threshold,
            config.admin_channel.clone(),
            store.clone(),
            dispatcher.clone(),
        ));
        let aggregator = BatchAggregator::new(BatchSettings::from_config(&config), dispatcher.clone());
        Ok(Self {
            config,
            store,
            dispatcher,
            counter,
            aggregator,
            reset_task: Mutex::new(None),
        })
    }

    /// Start the periodic counter reset. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), ActivityError> {
        Handle::try_current().map_err(|_| ActivityError::NoRuntime)?;
        let mut slot = self.reset_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(self.counter.spawn_reset_loop(self.config.reset_interval()));
            tracing::info!(
                "activity notifier started (alert threshold {}, batch window {}ms, debounce {}ms)",
                self.config.activity_threshold,
                self.config.batch_window_ms,
                self.config.batch_debounce_ms
            );
        }
        Ok(())
    }

    /// Stop the reset loop and flush every pending batch.
    pub fn shutdown(&self) -> Vec<FlushReport> {
        let task = self
            .reset_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        let reports = self.aggregator.flush_all();
        tracing::info!("activity notifier stopped, drained {} pending batches", reports.len());
        reports
    }

    /// Accept one operation. Returns the stamped event, a validation error
    /// when actor id or action is missing, or `NoRuntime` when called outside a
    /// tokio runtime. On error nothing has been published, batched or stored.
    pub fn accept(&self, inbound: InboundActivity) -> Result<ActivityEvent, ActivityError> {
        let event = inbound
            .into_event(Utc::now())
            .map_err(ActivityError::Validation)?;
        // batch timers and the persist task both need a runtime
        let runtime = Handle::try_current().map_err(|_| ActivityError::NoRuntime)?;

        let payload = NotificationPayload::immediate(&event);
        let reached = self
            .dispatcher
            .publish(&self.config.admin_channel, event_name_for(payload.kind), &payload);
        tracing::trace!("activity {}/{} broadcast to {reached} subscribers", event.actor.id, event.action);

        self.aggregator.enqueue(&event);

        let store = self.store.clone();
        let counter = self.counter.clone();
        let persisted = event.clone();
        runtime.spawn(async move {
            if let Err(e) = store.append(&persisted).await {
                tracing::warn!(
                    "failed to persist activity {}/{}: {e}",
                    persisted.actor.id,
                    persisted.action
                );
            }
            counter.record(&persisted).await;
        });

        Ok(event)
    }

    /// History lookup for activity that may have missed a live signal.
    pub async fn history(
        &self,
        filter: &ActivityFilter,
        sort: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityRecord>, ActivityError> {
        Ok(self.store.query(filter, sort, limit).await?)
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn counter(&self) -> &Arc<ActivityCounter> {
        &self.counter
    }

    pub fn aggregator(&self) -> &BatchAggregator {
        &self.aggregator
    }
}

impl Drop for ActivityNotifier {
    fn drop(&mut self) {
        let task = self
            .reset_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}
