//! Remote-first reads that fall back to the local store.

use std::collections::HashSet;
use std::sync::Arc;

use fieldsync_core::ApiClient;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::store::{CachedRecord, LocalStore, StoreError, SyncState, payload_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    /// Fresh remote data, with pending local changes laid over it.
    Remote,
    /// Local store contents; remote was unreachable or failed.
    Cache,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    pub data: T,
    pub source: ReadSource,
}

impl<T> CacheRead<T> {
    fn remote(data: T) -> Self {
        Self {
            data,
            source: ReadSource::Remote,
        }
    }

    fn cached(data: T) -> Self {
        Self {
            data,
            source: ReadSource::Cache,
        }
    }
}

pub struct ReadThrough {
    client: ApiClient,
    store: Arc<LocalStore>,
    connectivity: ConnectivityMonitor,
}

impl ReadThrough {
    pub fn new(client: ApiClient, store: Arc<LocalStore>, connectivity: ConnectivityMonitor) -> Self {
        Self {
            client,
            store,
            connectivity,
        }
    }

    /// Never fails because of the network; only a broken local store yields an error.
    pub async fn read(&self, collection: &str) -> Result<CacheRead<Vec<Value>>, StoreError> {
        if self.connectivity.is_online() {
            match self.client.list(collection).await {
                Ok(items) => match self.refresh_collection(collection, items).await {
                    Ok(data) => return Ok(CacheRead::remote(data)),
                    Err(err) => {
                        warn!(collection, error = %err, "failed to refresh local store from remote read");
                    }
                },
                Err(err) => {
                    debug!(collection, error = %err, "remote read failed, serving cache");
                }
            }
        }

        let data = self
            .store
            .list(collection)
            .await?
            .into_iter()
            .map(|record| record.payload)
            .collect();
        Ok(CacheRead::cached(data))
    }

    pub async fn read_item(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<CacheRead<Option<Value>>, StoreError> {
        if self.connectivity.is_online() {
            match self.client.get(collection, id).await {
                Ok(item) => match self.refresh_item(collection, id, item).await {
                    Ok(data) => return Ok(CacheRead::remote(data)),
                    Err(err) => {
                        warn!(collection, id, error = %err, "failed to refresh local store from remote read");
                    }
                },
                Err(err) => {
                    debug!(collection, id, error = %err, "remote read failed, serving cache");
                }
            }
        }

        let data = self
            .store
            .get(collection, id)
            .await?
            .map(|record| record.payload);
        Ok(CacheRead::cached(data))
    }

    async fn refresh_item(
        &self,
        collection: &str,
        id: &str,
        item: Value,
    ) -> Result<Option<Value>, StoreError> {
        if self.store.has_pending_for(collection, id).await? {
            return Ok(self
                .store
                .get(collection, id)
                .await?
                .map(|record| record.payload));
        }
        self.store
            .put(&CachedRecord::new(collection, id, item.clone(), SyncState::Synced))
            .await?;
        Ok(Some(item))
    }

    async fn refresh_collection(
        &self,
        collection: &str,
        items: Vec<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        let pending: HashSet<String> = self
            .store
            .list_pending_for(collection)
            .await?
            .into_iter()
            .map(|action| action.record_id)
            .collect();

        let mut data = Vec::with_capacity(items.len());
        let mut seen = Vec::with_capacity(items.len());
        let mut fresh = Vec::new();
        for item in items {
            let Some(id) = payload_id(&item) else {
                data.push(item);
                continue;
            };
            if pending.contains(&id) {
                if let Some(local) = self.store.get(collection, &id).await? {
                    data.push(local.payload);
                }
            } else {
                fresh.push(CachedRecord::new(
                    collection,
                    &id,
                    item.clone(),
                    SyncState::Synced,
                ));
                data.push(item);
            }
            seen.push(id);
        }

        self.store.put_many(&fresh).await?;
        let pruned = self.store.prune_synced(collection, &seen).await?;
        if pruned > 0 {
            debug!(collection, pruned, "dropped records missing from remote listing");
        }

        let seen: HashSet<String> = seen.into_iter().collect();
        for record in self.store.list(collection).await? {
            if !seen.contains(&record.id) && record.sync_state != SyncState::Synced {
                data.push(record.payload);
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{ActionKind, OutboxAction};
    use crate::store::StagedWrite;
    use serde_json::json;
    use sqlx::SqlitePool;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn make_reader(base_url: &str, online: bool) -> (ReadThrough, Arc<LocalStore>) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = LocalStore::from_pool(pool);
        store.init().await.unwrap();
        let store = Arc::new(store);
        let client = ApiClient::new(base_url).unwrap();
        let reader = ReadThrough::new(
            client,
            Arc::clone(&store),
            ConnectivityMonitor::new(online),
        );
        (reader, store)
    }

    fn synced(collection: &str, id: &str, title: &str) -> CachedRecord {
        CachedRecord::new(
            collection,
            id,
            json!({"id": id, "title": title}),
            SyncState::Synced,
        )
    }

    #[tokio::test]
    async fn remote_read_refreshes_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ideas"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "1", "title": "Benches"},
                {"id": "2", "title": "Trees"}
            ])))
            .mount(&server)
            .await;

        let (reader, store) = make_reader(&server.uri(), true).await;
        let result = reader.read("ideas").await.unwrap();

        assert_eq!(result.source, ReadSource::Remote);
        assert_eq!(result.data.len(), 2);
        let cached = store.get("ideas", "2").await.unwrap().unwrap();
        assert_eq!(cached.payload["title"], "Trees");
        assert_eq!(cached.sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn network_failure_serves_cached_records() {
        let (reader, store) = make_reader("http://127.0.0.1:9", true).await;
        let records: Vec<_> = (1..=5)
            .map(|n| synced("ideas", &n.to_string(), "cached"))
            .collect();
        store.put_many(&records).await.unwrap();

        let result = reader.read("ideas").await.unwrap();

        assert_eq!(result.source, ReadSource::Cache);
        assert_eq!(result.data.len(), 5);
    }

    #[tokio::test]
    async fn server_error_on_item_read_falls_back_to_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/signals/7"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (reader, store) = make_reader(&server.uri(), true).await;
        store.put(&synced("signals", "7", "Pothole")).await.unwrap();

        let result = reader.read_item("signals", "7").await.unwrap();
        assert_eq!(result.source, ReadSource::Cache);
        assert_eq!(result.data.unwrap()["title"], "Pothole");

        let missing = reader.read_item("signals", "8").await.unwrap();
        assert!(missing.data.is_none());
    }

    #[tokio::test]
    async fn offline_read_does_not_touch_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let (reader, _store) = make_reader(&server.uri(), false).await;
        let result = reader.read("events").await.unwrap();

        assert_eq!(result.source, ReadSource::Cache);
        assert!(result.data.is_empty());
    }

    #[tokio::test]
    async fn pending_local_changes_survive_remote_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/signals"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "A", "title": "server A"},
                {"id": "B", "title": "server B"},
                {"id": "C", "title": "server C"}
            ])))
            .mount(&server)
            .await;

        let (reader, store) = make_reader(&server.uri(), true).await;
        store.put(&synced("signals", "stale", "gone upstream")).await.unwrap();
        store
            .stage(
                &StagedWrite::Put(CachedRecord::new(
                    "signals",
                    "A",
                    json!({"id": "A", "title": "local A"}),
                    SyncState::PendingLocalOnly,
                )),
                &OutboxAction::new(ActionKind::Update, "signals", "A", json!({"id": "A"}), 3),
            )
            .await
            .unwrap();
        store
            .stage(
                &StagedWrite::Delete {
                    collection: "signals".into(),
                    id: "B".into(),
                },
                &OutboxAction::new(ActionKind::Delete, "signals", "B", Value::Null, 3),
            )
            .await
            .unwrap();
        store
            .stage(
                &StagedWrite::Put(CachedRecord::new(
                    "signals",
                    "N",
                    json!({"id": "N", "title": "offline new"}),
                    SyncState::PendingLocalOnly,
                )),
                &OutboxAction::new(ActionKind::Create, "signals", "N", json!({"id": "N"}), 3),
            )
            .await
            .unwrap();

        let result = reader.read("signals").await.unwrap();
        let titles: Vec<_> = result
            .data
            .iter()
            .map(|item| item["title"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(titles, vec!["local A", "server C", "offline new"]);
        assert!(store.get("signals", "stale").await.unwrap().is_none());
        assert!(store.get("signals", "B").await.unwrap().is_none());
        assert_eq!(
            store.get("signals", "A").await.unwrap().unwrap().sync_state,
            SyncState::PendingLocalOnly
        );
    }
}
