//! Activity notification aggregation engine.
//!
//! Hosts report every qualifying operation through [`ActivityNotifier::accept`].
//! Each accepted event is stored durably and turned into three outbound signals:
//! - an immediate, best-effort broadcast
//! - a debounced, window-bounded batch summary per actor/action/resource/tenant
//! - a high-activity alert when an actor crosses the activity threshold
//!
//! # Architecture
//!
//! - `core`: events, stored records and notification payloads
//! - `config`: engine tuning, loadable from the environment
//! - `db`: SQLite layer with migrations
//! - `store`: the persistence seam and its SQLite implementation
//! - `bus`: the dispatch seam and the in-process broadcast bus
//! - `runtime`: intake, batch aggregator and activity counter

pub mod bus;
pub mod config;
pub mod core;
pub mod db;
pub mod runtime;
pub mod store;

pub use bus::{DispatchEnvelope, Dispatcher, EventBus};
pub use config::{ConfigError, NotifierConfig};
pub use self::core::{
    ActivityEvent, ActivityRecord, Actor, EventDetail, InboundActivity, NotificationKind,
    NotificationPayload,
};
pub use runtime::aggregator::{BatchAggregator, BatchKey, BatchSettings, FlushReport, FlushTrigger};
pub use runtime::counter::{ActivityCounter, CounterState};
pub use runtime::intake::ActivityNotifier;
pub use store::{
    ActivityFilter, ActivityPatch, ActivityStore, SortOrder, SqliteActivityStore, StoreError,
};

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("invalid activity: {0}")]
    Validation(String),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("no tokio runtime available on the calling thread")]
    NoRuntime,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the default fmt subscriber. `RUST_LOG` wins when set. Safe to call
/// more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("activity_notify=debug,info")),
        )
        .try_init();
}
