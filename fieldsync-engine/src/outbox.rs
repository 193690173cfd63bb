use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::now_millis;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(ActionKind::Create),
            "update" => Some(ActionKind::Update),
            "delete" => Some(ActionKind::Delete),
            _ => None,
        }
    }
}

/// Address of one record: `(collection, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub collection: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

/// A mutation waiting for remote confirmation.
///
/// `seq` is assigned by the store on enqueue and defines FIFO order; it is `0` for an action
/// that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxAction {
    pub seq: i64,
    pub action_id: String,
    pub kind: ActionKind,
    pub collection: String,
    pub record_id: String,
    pub payload: Value,
    pub enqueued_at: i64,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub retry_at: Option<i64>,
    pub last_error: Option<String>,
}

impl OutboxAction {
    pub fn new(
        kind: ActionKind,
        collection: &str,
        record_id: &str,
        payload: Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            seq: 0,
            action_id: Uuid::new_v4().to_string(),
            kind,
            collection: collection.to_string(),
            record_id: record_id.to_string(),
            payload,
            enqueued_at: now_millis(),
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            retry_at: None,
            last_error: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.collection, &self.record_id)
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }
}

/// An action that ran out of attempts. Kept until dismissed or re-queued by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct AbandonedAction {
    pub action: OutboxAction,
    pub abandoned_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureTransition {
    Retry {
        attempt_count: u32,
        retry_at: Option<i64>,
    },
    Abandon {
        attempt_count: u32,
    },
}

/// Exponential backoff between automatic retries, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        self.delay_with_rng(failures, &mut rand::thread_rng())
    }

    /// `failures` is the number of failed attempts so far; the first retry waits `base`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        let shift = failures.saturating_sub(1).min(16);
        let ceiling = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        if self.jitter && ceiling > 0 {
            Duration::from_millis(rng.gen_range(ceiling / 2..=ceiling))
        } else {
            Duration::from_millis(ceiling)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Option<Backoff>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Some(Backoff::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, true)),
        }
    }
}

impl RetryPolicy {
    /// No delay between automatic retries.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: None,
        }
    }

    pub fn on_failure(&self, action: &OutboxAction, now: i64) -> FailureTransition {
        let attempt_count = action.attempt_count.saturating_add(1);
        if attempt_count >= action.max_attempts {
            return FailureTransition::Abandon { attempt_count };
        }
        let retry_at = self.backoff.map(|backoff| {
            let delay = i64::try_from(backoff.delay(attempt_count).as_millis()).unwrap_or(i64::MAX);
            now.saturating_add(delay)
        });
        FailureTransition::Retry {
            attempt_count,
            retry_at,
        }
    }
}
