use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;

use crate::outbox::{AbandonedAction, ActionKind, OutboxAction};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ACTION_COLUMNS: &str = "seq, action_id, kind, collection, record_id, payload, enqueued_at, attempt_count, max_attempts, retry_at, last_error";
const ABANDONED_COLUMNS: &str = "0 AS seq, action_id, kind, collection, record_id, payload, enqueued_at, attempt_count, max_attempts, NULL AS retry_at, last_error, abandoned_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid sync state: {0}")]
    InvalidSyncState(String),
    #[error("invalid action kind: {0}")]
    InvalidActionKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    PendingLocalOnly,
    FailedPermanently,
}

impl SyncState {
    fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::PendingLocalOnly => "pending_local_only",
            SyncState::FailedPermanently => "failed_permanently",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "synced" => Ok(SyncState::Synced),
            "pending_local_only" => Ok(SyncState::PendingLocalOnly),
            "failed_permanently" => Ok(SyncState::FailedPermanently),
            other => Err(StoreError::InvalidSyncState(other.to_string())),
        }
    }
}

/// Latest known value of one entity. Writes replace the whole record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedRecord {
    pub collection: String,
    pub id: String,
    pub payload: Value,
    pub cached_at: i64,
    pub sync_state: SyncState,
}

impl CachedRecord {
    pub fn new(collection: &str, id: &str, payload: Value, sync_state: SyncState) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            payload,
            cached_at: now_millis(),
            sync_state,
        }
    }
}

/// String form of a payload's `id` field. Numeric ids are accepted.
pub fn payload_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Local side of a mutation, committed together with its outbox action.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedWrite {
    Put(CachedRecord),
    Delete { collection: String, id: String },
}

/// Result of moving an abandoned action back into the outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Restore {
    Requeued(OutboxAction),
    /// No ledger entry with that id.
    Missing,
    /// The record was deleted or recreated locally since; the entry stays in the ledger.
    Superseded,
}

pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<CachedRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT collection, id, payload, cached_at, sync_state FROM records WHERE collection = ?1 AND id = ?2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list(&self, collection: &str) -> Result<Vec<CachedRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT collection, id, payload, cached_at, sync_state
             FROM records
             WHERE collection = ?1
             ORDER BY cached_at ASC, id ASC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn put(&self, record: &CachedRecord) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_record(&mut conn, record).await
    }

    /// Each record is its own write; a failure leaves the records before it in place.
    pub async fn put_many(&self, records: &[CachedRecord]) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        for record in records {
            upsert_record(&mut conn, record).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_sync_state(
        &self,
        collection: &str,
        id: &str,
        state: SyncState,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        mark_record(&mut conn, collection, id, state).await
    }

    /// Drops `synced` records of `collection` whose id is not in `keep`.
    pub async fn prune_synced(&self, collection: &str, keep: &[String]) -> Result<u64, StoreError> {
        let keep = serde_json::to_string(keep)?;
        let result = sqlx::query(
            "DELETE FROM records
             WHERE collection = ?1
                AND sync_state = 'synced'
                AND id NOT IN (SELECT value FROM json_each(?2))",
        )
        .bind(collection)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Applies the optimistic local write and enqueues `action` atomically.
    pub async fn stage(&self, write: &StagedWrite, action: &OutboxAction) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        match write {
            StagedWrite::Put(record) => upsert_record(&mut tx, record).await?,
            StagedWrite::Delete { collection, id } => {
                sqlx::query("DELETE FROM records WHERE collection = ?1 AND id = ?2")
                    .bind(collection)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        let seq = insert_action(&mut tx, action).await?;
        tx.commit().await?;
        Ok(seq)
    }

    pub async fn enqueue(&self, action: &OutboxAction) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_action(&mut conn, action).await
    }

    pub async fn list_pending(&self) -> Result<Vec<OutboxAction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM outbox ORDER BY seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(action_from_row).collect()
    }

    pub async fn list_pending_for(&self, collection: &str) -> Result<Vec<OutboxAction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM outbox WHERE collection = ?1 ORDER BY seq ASC"
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(action_from_row).collect()
    }

    pub async fn get_action(&self, action_id: &str) -> Result<Option<OutboxAction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM outbox WHERE action_id = ?1"
        ))
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(action_from_row).transpose()
    }

    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn has_pending_for(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM outbox WHERE collection = ?1 AND record_id = ?2 LIMIT 1")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Action id at the head of the per-record lane, if any.
    pub async fn oldest_pending_for(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<String>, StoreError> {
        let action_id = sqlx::query_scalar(
            "SELECT action_id FROM outbox
             WHERE collection = ?1 AND record_id = ?2
             ORDER BY seq ASC
             LIMIT 1",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(action_id)
    }

    pub async fn remove_action(&self, action_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM outbox WHERE action_id = ?1")
            .bind(action_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_failure(
        &self,
        action_id: &str,
        attempt_count: u32,
        retry_at: Option<i64>,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox SET attempt_count = ?1, retry_at = ?2, last_error = ?3 WHERE action_id = ?4",
        )
        .bind(attempt_count)
        .bind(retry_at)
        .bind(error)
        .bind(action_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Moves `action` from the outbox to the abandoned ledger and flags its record.
    pub async fn abandon(
        &self,
        action: &OutboxAction,
        attempt_count: u32,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM outbox WHERE action_id = ?1")
            .bind(&action.action_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO abandoned_actions (
                action_id, kind, collection, record_id, payload, enqueued_at,
                attempt_count, max_attempts, last_error, abandoned_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&action.action_id)
        .bind(action.kind.as_str())
        .bind(&action.collection)
        .bind(&action.record_id)
        .bind(serde_json::to_string(&action.payload)?)
        .bind(action.enqueued_at)
        .bind(attempt_count)
        .bind(action.max_attempts)
        .bind(error)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;
        mark_record(
            &mut tx,
            &action.collection,
            &action.record_id,
            SyncState::FailedPermanently,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_abandoned(&self) -> Result<Vec<AbandonedAction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ABANDONED_COLUMNS} FROM abandoned_actions ORDER BY abandoned_at ASC, action_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(abandoned_from_row).collect()
    }

    pub async fn get_abandoned(&self, action_id: &str) -> Result<Option<AbandonedAction>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_abandoned(&mut conn, action_id).await
    }

    pub async fn abandoned_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM abandoned_actions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn dismiss_abandoned(&self, action_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM abandoned_actions WHERE action_id = ?1")
            .bind(action_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Puts an abandoned action back at the tail of the outbox with a fresh budget.
    ///
    /// Creates and updates carry the record's current local value, so later local writes that
    /// were confirmed in the meantime are not overwritten by the old body.
    pub async fn restore_abandoned(
        &self,
        action_id: &str,
        max_attempts: u32,
    ) -> Result<Restore, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(entry) = fetch_abandoned(&mut tx, action_id).await? else {
            return Ok(Restore::Missing);
        };
        let mut action = entry.action;
        let local = sqlx::query("SELECT payload FROM records WHERE collection = ?1 AND id = ?2")
            .bind(&action.collection)
            .bind(&action.record_id)
            .fetch_optional(&mut *tx)
            .await?;
        match (action.kind, local) {
            (ActionKind::Delete, None) => {}
            (ActionKind::Create | ActionKind::Update, Some(row)) => {
                let payload: String = row.try_get("payload")?;
                action.payload = match serde_json::from_str(&payload)? {
                    Value::Object(mut map) => {
                        map.insert("id".to_string(), Value::String(action.record_id.clone()));
                        Value::Object(map)
                    }
                    other => other,
                };
            }
            _ => return Ok(Restore::Superseded),
        }
        action.attempt_count = 0;
        action.max_attempts = max_attempts.max(1);
        action.retry_at = None;
        action.last_error = None;
        action.enqueued_at = now_millis();

        sqlx::query("DELETE FROM abandoned_actions WHERE action_id = ?1")
            .bind(action_id)
            .execute(&mut *tx)
            .await?;
        action.seq = insert_action(&mut tx, &action).await?;
        mark_record(
            &mut tx,
            &action.collection,
            &action.record_id,
            SyncState::PendingLocalOnly,
        )
        .await?;
        tx.commit().await?;
        Ok(Restore::Requeued(action))
    }

    /// Points pending actions for `old_id` at `new_id` and drops the record stored under
    /// `old_id`; the caller writes the record under its new id.
    pub async fn rekey(&self, collection: &str, old_id: &str, new_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE outbox
             SET record_id = ?1,
                 payload = CASE
                     WHEN json_type(payload) = 'object' THEN json_set(payload, '$.id', ?1)
                     ELSE payload
                 END
             WHERE collection = ?2 AND record_id = ?3",
        )
        .bind(new_id)
        .bind(collection)
        .bind(old_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM records WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(old_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

pub(crate) fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

async fn upsert_record(conn: &mut SqliteConnection, record: &CachedRecord) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO records (collection, id, payload, cached_at, sync_state)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(collection, id) DO UPDATE SET
            payload = excluded.payload,
            cached_at = excluded.cached_at,
            sync_state = excluded.sync_state",
    )
    .bind(&record.collection)
    .bind(&record.id)
    .bind(serde_json::to_string(&record.payload)?)
    .bind(record.cached_at)
    .bind(record.sync_state.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn mark_record(
    conn: &mut SqliteConnection,
    collection: &str,
    id: &str,
    state: SyncState,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE records SET sync_state = ?1 WHERE collection = ?2 AND id = ?3")
        .bind(state.as_str())
        .bind(collection)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_action(conn: &mut SqliteConnection, action: &OutboxAction) -> Result<i64, StoreError> {
    let result = sqlx::query(
        "INSERT INTO outbox (
            action_id, kind, collection, record_id, payload, enqueued_at,
            attempt_count, max_attempts, retry_at, last_error
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(&action.action_id)
    .bind(action.kind.as_str())
    .bind(&action.collection)
    .bind(&action.record_id)
    .bind(serde_json::to_string(&action.payload)?)
    .bind(action.enqueued_at)
    .bind(action.attempt_count)
    .bind(action.max_attempts)
    .bind(action.retry_at)
    .bind(&action.last_error)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn fetch_abandoned(
    conn: &mut SqliteConnection,
    action_id: &str,
) -> Result<Option<AbandonedAction>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {ABANDONED_COLUMNS} FROM abandoned_actions WHERE action_id = ?1"
    ))
    .bind(action_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(abandoned_from_row).transpose()
}

fn record_from_row(row: &SqliteRow) -> Result<CachedRecord, StoreError> {
    let payload: String = row.try_get("payload")?;
    let sync_state: String = row.try_get("sync_state")?;
    Ok(CachedRecord {
        collection: row.try_get("collection")?,
        id: row.try_get("id")?,
        payload: serde_json::from_str(&payload)?,
        cached_at: row.try_get("cached_at")?,
        sync_state: SyncState::parse(&sync_state)?,
    })
}

fn parse_kind(value: &str) -> Result<ActionKind, StoreError> {
    ActionKind::parse(value).ok_or_else(|| StoreError::InvalidActionKind(value.to_string()))
}

fn action_from_row(row: &SqliteRow) -> Result<OutboxAction, StoreError> {
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    Ok(OutboxAction {
        seq: row.try_get("seq")?,
        action_id: row.try_get("action_id")?,
        kind: parse_kind(&kind)?,
        collection: row.try_get("collection")?,
        record_id: row.try_get("record_id")?,
        payload: serde_json::from_str(&payload)?,
        enqueued_at: row.try_get("enqueued_at")?,
        attempt_count: row.try_get("attempt_count")?,
        max_attempts: row.try_get("max_attempts")?,
        retry_at: row.try_get("retry_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn abandoned_from_row(row: &SqliteRow) -> Result<AbandonedAction, StoreError> {
    Ok(AbandonedAction {
        action: action_from_row(row)?,
        abandoned_at: row.try_get("abandoned_at")?,
    })
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
