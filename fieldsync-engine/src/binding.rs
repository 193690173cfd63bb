//! Observable view over one collection or one record for UI code.
//!
//! A binding owns a task that re-reads its target whenever the engine reports a change and
//! publishes the result through a `watch` channel. The UI only reads state and calls the
//! mutation passthroughs; background sync stays with the engine's scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::ReadSource;
use crate::connectivity::ConnectivityEvents;
use crate::engine::{
    Delivery, EngineError, EngineEvent, MutationOutcome, SyncEngine, SyncReport, SyncStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub enum BindingData {
    Collection(Vec<Value>),
    Item(Option<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingState {
    pub data: BindingData,
    /// True until the first read has resolved.
    pub loading: bool,
    pub error: Option<String>,
    pub sync_status: SyncStatus,
    pub source: Option<ReadSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Collection(String),
    Item { collection: String, id: String },
}

impl Target {
    fn collection(&self) -> &str {
        match self {
            Target::Collection(collection) => collection,
            Target::Item { collection, .. } => collection,
        }
    }

    fn empty(&self) -> BindingData {
        match self {
            Target::Collection(_) => BindingData::Collection(Vec::new()),
            Target::Item { .. } => BindingData::Item(None),
        }
    }
}

struct Shared {
    state: watch::Sender<BindingState>,
    /// Whether the current error came from a read; a successful read only clears those.
    read_error: AtomicBool,
}

impl Shared {
    fn set_error(&self, message: String) {
        self.read_error.store(false, Ordering::SeqCst);
        self.state.send_modify(|state| state.error = Some(message));
    }

    fn clear_error(&self) {
        self.read_error.store(false, Ordering::SeqCst);
        self.state.send_modify(|state| state.error = None);
    }
}

pub struct Binding {
    engine: Arc<SyncEngine>,
    target: Target,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Binding {
    pub fn collection(engine: Arc<SyncEngine>, collection: &str) -> Self {
        Self::spawn(engine, Target::Collection(collection.to_string()))
    }

    pub fn item(engine: Arc<SyncEngine>, collection: &str, id: &str) -> Self {
        Self::spawn(
            engine,
            Target::Item {
                collection: collection.to_string(),
                id: id.to_string(),
            },
        )
    }

    fn spawn(engine: Arc<SyncEngine>, target: Target) -> Self {
        let initial = BindingState {
            data: target.empty(),
            loading: true,
            error: None,
            sync_status: SyncStatus {
                is_online: engine.connectivity().is_online(),
                ..SyncStatus::default()
            },
            source: None,
        };
        let (state, _) = watch::channel(initial);
        let shared = Arc::new(Shared {
            state,
            read_error: AtomicBool::new(false),
        });

        // Subscribe before the first read so no change slips in between.
        let events = engine.subscribe();
        let connectivity = engine.connectivity().subscribe();
        let task = tokio::spawn(run(
            Arc::clone(&engine),
            target.clone(),
            Arc::clone(&shared),
            events,
            connectivity,
        ));

        Self {
            engine,
            target,
            shared,
            task,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BindingState> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> BindingState {
        self.shared.state.borrow().clone()
    }

    pub async fn create(&self, item: Value) -> Result<MutationOutcome, EngineError> {
        let result = self.engine.create(self.target.collection(), item).await;
        self.note_mutation(&result);
        result
    }

    pub async fn update(&self, id: &str, partial: Value) -> Result<MutationOutcome, EngineError> {
        let result = self
            .engine
            .update(self.target.collection(), id, partial)
            .await;
        self.note_mutation(&result);
        result
    }

    pub async fn delete(&self, id: &str) -> Result<MutationOutcome, EngineError> {
        let result = self.engine.delete(self.target.collection(), id).await;
        self.note_mutation(&result);
        result
    }

    /// Runs a sync pass now. This is the only way a binding starts one.
    pub async fn sync_now(&self) -> Result<SyncReport, EngineError> {
        let result = self.engine.sync_pending_actions().await;
        if let Err(err) = &result {
            self.shared.set_error(err.to_string());
        }
        result
    }

    fn note_mutation(&self, result: &Result<MutationOutcome, EngineError>) {
        match result {
            Ok(outcome) => match &outcome.delivery {
                Delivery::Queued {
                    reason: Some(reason),
                }
                | Delivery::Abandoned { reason } => self.shared.set_error(reason.clone()),
                Delivery::Confirmed | Delivery::Queued { reason: None } => {
                    self.shared.clear_error()
                }
            },
            Err(err) => self.shared.set_error(err.to_string()),
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    engine: Arc<SyncEngine>,
    target: Target,
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<EngineEvent>,
    mut connectivity: ConnectivityEvents,
) {
    refresh(&engine, &target, &shared).await;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::Mutated { collection }) if collection == target.collection() => {
                    refresh(&engine, &target, &shared).await;
                }
                Ok(EngineEvent::SyncCompleted(report)) => {
                    note_report(&shared, &report);
                    refresh(&engine, &target, &shared).await;
                }
                Ok(EngineEvent::SyncFailed(message)) => {
                    shared.set_error(message);
                    refresh_status(&engine, &shared).await;
                }
                // Connectivity is observed directly below.
                Ok(EngineEvent::Connectivity(_)) => {}
                Ok(_) => refresh_status(&engine, &shared).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "binding lagged behind engine events");
                    refresh(&engine, &target, &shared).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = connectivity.recv() => refresh(&engine, &target, &shared).await,
        }
    }
}

fn note_report(shared: &Shared, report: &SyncReport) {
    if report.skipped || report.offline {
        return;
    }
    if report.abandoned > 0 {
        shared.set_error(format!(
            "{} change(s) could not be synchronized",
            report.abandoned
        ));
    } else if report.succeeded > 0
        && report.retried == 0
        && !shared.read_error.load(Ordering::SeqCst)
    {
        shared.clear_error();
    }
}

async fn refresh(engine: &SyncEngine, target: &Target, shared: &Shared) {
    let read = match target {
        Target::Collection(collection) => engine
            .read(collection)
            .await
            .map(|read| (BindingData::Collection(read.data), read.source)),
        Target::Item { collection, id } => engine
            .read_item(collection, id)
            .await
            .map(|read| (BindingData::Item(read.data), read.source)),
    };
    let status = engine.sync_status().await;

    let clear_read_error = read.is_ok() && shared.read_error.swap(false, Ordering::SeqCst);
    if let Err(err) = &read {
        shared.read_error.store(true, Ordering::SeqCst);
        debug!(collection = target.collection(), error = %err, "binding read failed");
    }
    shared.state.send_modify(|state| {
        state.loading = false;
        match read {
            Ok((data, source)) => {
                state.data = data;
                state.source = Some(source);
                if clear_read_error {
                    state.error = None;
                }
            }
            Err(err) => state.error = Some(err.to_string()),
        }
        if let Ok(status) = status {
            state.sync_status = status;
        }
    });
}

async fn refresh_status(engine: &SyncEngine, shared: &Shared) {
    if let Ok(status) = engine.sync_status().await {
        shared.state.send_modify(|state| state.sync_status = status);
    }
}
