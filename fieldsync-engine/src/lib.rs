//! Offline-first local store with an outbox that replays mutations against the collection API.

pub mod binding;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod outbox;
pub mod store;

pub use binding::{Binding, BindingData, BindingState};
pub use cache::{CacheRead, ReadSource};
pub use config::{ConfigError, EngineConfig};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use engine::{
    Delivery, EngineError, EngineEvent, MutationOutcome, SyncEngine, SyncReport, SyncStatus,
};
pub use outbox::{AbandonedAction, ActionKind, Backoff, OutboxAction, RetryPolicy};
pub use store::{CachedRecord, LocalStore, Restore, StoreError, SyncState};
