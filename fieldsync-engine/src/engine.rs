use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fieldsync_core::{ApiClient, ApiError};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheRead, ReadThrough};
use crate::config::{ConfigError, EngineConfig};
use crate::connectivity::{ConnectivityEvents, ConnectivityMonitor};
use crate::outbox::{AbandonedAction, ActionKind, FailureTransition, OutboxAction, RecordKey, RetryPolicy};
use crate::store::{
    CachedRecord, LocalStore, Restore, StagedWrite, StoreError, SyncState, now_millis, payload_id,
};

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("payload must be a JSON object, got {0}")]
    InvalidPayload(&'static str),
}

/// What happened to the remote side of a mutation by the time the call returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The server accepted the change during the call.
    Confirmed,
    /// The change waits in the outbox. `reason` carries the error of a failed immediate attempt.
    Queued { reason: Option<String> },
    /// The immediate attempt used up the whole budget.
    Abandoned { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub id: String,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Another pass was already running; nothing was attempted.
    pub skipped: bool,
    /// Connectivity was down at the start of the pass or dropped during it.
    pub offline: bool,
    pub succeeded: usize,
    pub retried: usize,
    pub abandoned: usize,
    /// Actions left for a later pass: not yet due, or ordered behind a blocked action.
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub pending: u64,
    pub abandoned: u64,
    pub is_online: bool,
    pub syncing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Mutated { collection: String },
    SyncStarted,
    SyncCompleted(SyncReport),
    /// A pass stopped on a local storage error.
    SyncFailed(String),
    Connectivity(bool),
}

enum Attempt {
    /// Carries the id the record is stored under afterwards.
    Succeeded(String),
    /// Already executing elsewhere.
    Busy,
    /// Confirmed or abandoned by someone else in the meantime.
    Gone,
    Retrying(String),
    Abandoned(String),
}

pub struct SyncEngine {
    client: ApiClient,
    store: Arc<LocalStore>,
    reader: ReadThrough,
    connectivity: ConnectivityMonitor,
    policy: RetryPolicy,
    sync_interval: Duration,
    syncing: AtomicBool,
    executing: Mutex<HashSet<String>>,
    events: broadcast::Sender<EngineEvent>,
    connectivity_events: tokio::sync::Mutex<Option<ConnectivityEvents>>,
}

impl SyncEngine {
    pub fn new(client: ApiClient, store: LocalStore, connectivity: ConnectivityMonitor) -> Self {
        let store = Arc::new(store);
        let reader = ReadThrough::new(client.clone(), Arc::clone(&store), connectivity.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        // Subscribed here so transitions before the scheduler starts are not lost.
        let connectivity_events = connectivity.subscribe();
        Self {
            client,
            store,
            reader,
            connectivity,
            policy: RetryPolicy::default(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            syncing: AtomicBool::new(false),
            executing: Mutex::new(HashSet::new()),
            events,
            connectivity_events: tokio::sync::Mutex::new(Some(connectivity_events)),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub async fn bootstrap(
        config: &EngineConfig,
        connectivity: ConnectivityMonitor,
    ) -> Result<Arc<Self>, EngineError> {
        let mut client = ApiClient::with_timeout(&config.api_base_url, config.request_timeout)?;
        if let Some(token) = &config.api_token {
            client = client.with_token(token.clone());
        }
        let store = LocalStore::open(&config.database_path).await?;
        info!(
            api = %config.api_base_url,
            db = %config.database_path.display(),
            max_attempts = config.retry.max_attempts,
            "sync engine ready"
        );
        Ok(Arc::new(
            Self::new(client, store, connectivity)
                .with_retry_policy(config.retry)
                .with_sync_interval(config.sync_interval),
        ))
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Stores `item` locally and queues its creation. Missing ids are generated.
    pub async fn create(&self, collection: &str, item: Value) -> Result<MutationOutcome, EngineError> {
        let mut payload = into_object(item)?;
        let id = match payload_id(&Value::Object(payload.clone())) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                payload.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let payload = Value::Object(payload);
        let record = CachedRecord::new(collection, &id, payload.clone(), SyncState::PendingLocalOnly);
        let action = OutboxAction::new(
            ActionKind::Create,
            collection,
            &id,
            payload,
            self.policy.max_attempts,
        );
        self.mutate(StagedWrite::Put(record), action).await
    }

    /// Merges `partial` over the cached value; the remote receives only `partial` plus `id`.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        partial: Value,
    ) -> Result<MutationOutcome, EngineError> {
        let mut changes = into_object(partial)?;
        changes.insert("id".to_string(), Value::String(id.to_string()));

        let merged = match self.store.get(collection, id).await? {
            Some(existing) => merge_objects(existing.payload, Value::Object(changes.clone())),
            None => Value::Object(changes.clone()),
        };

        let record = CachedRecord::new(collection, id, merged, SyncState::PendingLocalOnly);
        let action = OutboxAction::new(
            ActionKind::Update,
            collection,
            id,
            Value::Object(changes),
            self.policy.max_attempts,
        );
        self.mutate(StagedWrite::Put(record), action).await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<MutationOutcome, EngineError> {
        let write = StagedWrite::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        let action = OutboxAction::new(
            ActionKind::Delete,
            collection,
            id,
            Value::Null,
            self.policy.max_attempts,
        );
        self.mutate(write, action).await
    }

    async fn mutate(
        &self,
        write: StagedWrite,
        mut action: OutboxAction,
    ) -> Result<MutationOutcome, EngineError> {
        action.seq = self.store.stage(&write, &action).await?;
        debug!(
            action_id = %action.action_id,
            kind = action.kind.as_str(),
            collection = %action.collection,
            id = %action.record_id,
            "mutation staged"
        );

        let (delivery, id) = self.deliver_now(&action).await?;
        self.emit(EngineEvent::Mutated {
            collection: action.collection,
        });
        Ok(MutationOutcome { id, delivery })
    }

    /// Attempts a freshly staged action right away when nothing is ahead of it. Returns the
    /// delivery and the id the record ends up under.
    async fn deliver_now(&self, action: &OutboxAction) -> Result<(Delivery, String), StoreError> {
        let id = action.record_id.clone();
        if !self.connectivity.is_online() {
            return Ok((Delivery::Queued { reason: None }, id));
        }
        let head = self
            .store
            .oldest_pending_for(&action.collection, &action.record_id)
            .await?;
        if head.as_deref() != Some(action.action_id.as_str()) {
            debug!(
                action_id = %action.action_id,
                collection = %action.collection,
                id = %action.record_id,
                "ordered behind earlier actions"
            );
            return Ok((Delivery::Queued { reason: None }, id));
        }
        Ok(match self.attempt(action).await? {
            Attempt::Succeeded(id) => (Delivery::Confirmed, id),
            Attempt::Busy => (Delivery::Queued { reason: None }, id),
            Attempt::Gone => (self.settled_elsewhere(&action.action_id).await?, id),
            Attempt::Retrying(reason) => (
                Delivery::Queued {
                    reason: Some(reason),
                },
                id,
            ),
            Attempt::Abandoned(reason) => (Delivery::Abandoned { reason }, id),
        })
    }

    async fn settled_elsewhere(&self, action_id: &str) -> Result<Delivery, StoreError> {
        Ok(match self.store.get_abandoned(action_id).await? {
            Some(entry) => Delivery::Abandoned {
                reason: entry.action.last_error.unwrap_or_default(),
            },
            None => Delivery::Confirmed,
        })
    }

    /// Drains the outbox in FIFO order, one lane per record.
    pub async fn sync_pending_actions(&self) -> Result<SyncReport, EngineError> {
        let Some(pass) = PassGuard::acquire(&self.syncing) else {
            debug!("sync pass already running");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        };
        self.emit(EngineEvent::SyncStarted);
        let result = self.drain_outbox().await;
        drop(pass);

        match &result {
            Ok(report) => self.emit(EngineEvent::SyncCompleted(report.clone())),
            Err(err) => {
                warn!(error = %err, "sync pass aborted");
                self.emit(EngineEvent::SyncFailed(format!("sync failed: {err}")));
            }
        }
        Ok(result?)
    }

    async fn drain_outbox(&self) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();
        if !self.connectivity.is_online() {
            report.offline = true;
            return Ok(report);
        }

        let now = now_millis();
        let mut blocked: HashSet<RecordKey> = HashSet::new();
        for queued in self.store.list_pending().await? {
            // Earlier attempts in this pass may have re-keyed or removed it.
            let Some(action) = self.store.get_action(&queued.action_id).await? else {
                continue;
            };
            let key = action.key();
            if blocked.contains(&key) {
                report.deferred += 1;
                continue;
            }
            if !action.is_due(now) {
                blocked.insert(key);
                report.deferred += 1;
                continue;
            }
            if !self.connectivity.is_online() {
                info!("connectivity lost, stopping sync pass");
                report.offline = true;
                break;
            }
            match self.attempt(&action).await? {
                Attempt::Succeeded(_) => report.succeeded += 1,
                Attempt::Busy => {
                    blocked.insert(key);
                    report.deferred += 1;
                }
                Attempt::Retrying(_) => {
                    blocked.insert(key);
                    report.retried += 1;
                }
                Attempt::Abandoned(_) => report.abandoned += 1,
                Attempt::Gone => {}
            }
        }

        if report.succeeded + report.retried + report.abandoned > 0 {
            info!(
                succeeded = report.succeeded,
                retried = report.retried,
                abandoned = report.abandoned,
                deferred = report.deferred,
                "sync pass finished"
            );
        }
        Ok(report)
    }

    async fn attempt(&self, queued: &OutboxAction) -> Result<Attempt, StoreError> {
        let Some(_executing) = ExecutingGuard::acquire(&self.executing, &queued.action_id) else {
            return Ok(Attempt::Busy);
        };
        // The attempt count may have moved since `queued` was read.
        let Some(action) = self.store.get_action(&queued.action_id).await? else {
            return Ok(Attempt::Gone);
        };
        let action = &action;
        debug!(
            action_id = %action.action_id,
            kind = action.kind.as_str(),
            collection = %action.collection,
            id = %action.record_id,
            attempt = action.attempt_count + 1,
            "executing action"
        );

        match self.send(action).await {
            Ok(response) => {
                let id = self.confirm(action, response).await?;
                info!(
                    action_id = %action.action_id,
                    kind = action.kind.as_str(),
                    collection = %action.collection,
                    id = %action.record_id,
                    "action confirmed"
                );
                Ok(Attempt::Succeeded(id))
            }
            Err(err) => self.fail(action, &err).await,
        }
    }

    async fn send(&self, action: &OutboxAction) -> Result<Option<Value>, ApiError> {
        match action.kind {
            ActionKind::Create => self.client.create(&action.collection, &action.payload).await,
            ActionKind::Update => {
                self.client
                    .update(&action.collection, &action.record_id, &action.payload)
                    .await
            }
            ActionKind::Delete => {
                self.client
                    .delete(&action.collection, &action.record_id)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn confirm(
        &self,
        action: &OutboxAction,
        response: Option<Value>,
    ) -> Result<String, StoreError> {
        self.store.remove_action(&action.action_id).await?;
        if action.kind == ActionKind::Delete {
            return Ok(action.record_id.clone());
        }

        let collection = action.collection.as_str();
        let server = response.filter(Value::is_object);
        let local = self.store.get(collection, &action.record_id).await?;
        let mut id = action.record_id.clone();
        if action.kind == ActionKind::Create {
            if let Some(server_id) = server.as_ref().and_then(payload_id) {
                if server_id != id {
                    self.store.rekey(collection, &id, &server_id).await?;
                    info!(collection, from = %id, to = %server_id, "record re-keyed to server id");
                    id = server_id;
                }
            }
        }
        // Deleted locally while the request was in flight.
        let Some(local) = local else {
            return Ok(id);
        };

        let record = if self.store.has_pending_for(collection, &id).await? {
            CachedRecord::new(
                collection,
                &id,
                with_id(local.payload, &id),
                SyncState::PendingLocalOnly,
            )
        } else {
            let payload = match server {
                Some(server) if action.kind == ActionKind::Create => server,
                Some(server) => merge_objects(local.payload, server),
                None => local.payload,
            };
            CachedRecord::new(collection, &id, with_id(payload, &id), SyncState::Synced)
        };
        self.store.put(&record).await?;
        Ok(id)
    }

    async fn fail(&self, action: &OutboxAction, err: &ApiError) -> Result<Attempt, StoreError> {
        let message = err.to_string();
        let (attempt_count, outcome, attempt) = match self.policy.on_failure(action, now_millis()) {
            FailureTransition::Retry {
                attempt_count,
                retry_at,
            } => {
                self.store
                    .record_failure(&action.action_id, attempt_count, retry_at, &message)
                    .await?;
                (attempt_count, "requeued", Attempt::Retrying(message.clone()))
            }
            FailureTransition::Abandon { attempt_count } => {
                self.store.abandon(action, attempt_count, &message).await?;
                (attempt_count, "abandoned", Attempt::Abandoned(message.clone()))
            }
        };
        warn!(
            action_id = %action.action_id,
            kind = action.kind.as_str(),
            collection = %action.collection,
            id = %action.record_id,
            attempt = attempt_count,
            outcome,
            class = ?err.classification(),
            error = %message,
            "action failed"
        );
        Ok(attempt)
    }

    pub async fn read(&self, collection: &str) -> Result<CacheRead<Vec<Value>>, EngineError> {
        Ok(self.reader.read(collection).await?)
    }

    pub async fn read_item(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<CacheRead<Option<Value>>, EngineError> {
        Ok(self.reader.read_item(collection, id).await?)
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, EngineError> {
        Ok(SyncStatus {
            pending: self.store.pending_count().await?,
            abandoned: self.store.abandoned_count().await?,
            is_online: self.connectivity.is_online(),
            syncing: self.syncing.load(Ordering::SeqCst),
        })
    }

    pub async fn list_abandoned(&self) -> Result<Vec<AbandonedAction>, EngineError> {
        Ok(self.store.list_abandoned().await?)
    }

    pub async fn dismiss_abandoned(&self, action_id: &str) -> Result<bool, EngineError> {
        let Some(entry) = self.store.get_abandoned(action_id).await? else {
            return Ok(false);
        };
        let removed = self.store.dismiss_abandoned(action_id).await?;
        if removed {
            info!(action_id, collection = %entry.action.collection, "abandoned action dismissed");
            self.emit(EngineEvent::Mutated {
                collection: entry.action.collection,
            });
        }
        Ok(removed)
    }

    /// Puts an abandoned action back in the outbox with a fresh attempt budget. Returns false
    /// when there is no such entry, or when the record was deleted or recreated locally since;
    /// such an entry can only be dismissed.
    pub async fn retry_abandoned(&self, action_id: &str) -> Result<bool, EngineError> {
        let action = match self
            .store
            .restore_abandoned(action_id, self.policy.max_attempts)
            .await?
        {
            Restore::Requeued(action) => action,
            Restore::Missing => return Ok(false),
            Restore::Superseded => {
                info!(action_id, "abandoned action no longer matches local record, not requeued");
                return Ok(false);
            }
        };
        info!(
            action_id,
            kind = action.kind.as_str(),
            collection = %action.collection,
            id = %action.record_id,
            "abandoned action requeued"
        );
        self.emit(EngineEvent::Mutated {
            collection: action.collection,
        });
        Ok(true)
    }

    /// Starts the background task that drains the outbox on reconnect and on a fixed interval.
    pub fn spawn_scheduler(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_scheduler(shutdown).await })
    }

    async fn run_scheduler(&self, shutdown: CancellationToken) {
        let mut connectivity = match self.connectivity_events.lock().await.take() {
            Some(events) => events,
            None => self.connectivity.subscribe(),
        };
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.sync_interval.as_secs(),
            "sync scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sync scheduler stopped");
                    break;
                }
                event = connectivity.recv() => {
                    let online = event.is_online();
                    self.emit(EngineEvent::Connectivity(online));
                    if online {
                        self.run_background_pass("reconnect").await;
                    }
                }
                _ = ticker.tick() => {
                    if self.connectivity.is_online() {
                        self.run_background_pass("interval").await;
                    }
                }
            }
        }
    }

    async fn run_background_pass(&self, trigger: &'static str) {
        match self.sync_pending_actions().await {
            Ok(report) if report.skipped => debug!(trigger, "sync pass skipped"),
            Ok(_) => {}
            Err(err) => warn!(trigger, error = %err, "background sync failed"),
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, EngineError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err(EngineError::InvalidPayload("null")),
        Value::Bool(_) => Err(EngineError::InvalidPayload("a boolean")),
        Value::Number(_) => Err(EngineError::InvalidPayload("a number")),
        Value::String(_) => Err(EngineError::InvalidPayload("a string")),
        Value::Array(_) => Err(EngineError::InvalidPayload("an array")),
    }
}

fn with_id(payload: Value, id: &str) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.insert("id".to_string(), Value::String(id.to_string()));
            Value::Object(map)
        }
        other => other,
    }
}

fn merge_objects(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            base.extend(overlay);
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Holds the single-pass flag; released on drop, including when the pass future is cancelled.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct ExecutingGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    action_id: String,
}

impl<'a> ExecutingGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, action_id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action_id.to_string());
        inserted.then(|| Self {
            set,
            action_id: action_id.to_string(),
        })
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.action_id);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
