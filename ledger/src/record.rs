// ledger/src/record.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A domain row (order, position, deposit, ...) written in the same
/// transaction as the balance movement it justifies.
///
/// The body lives in `data`; `owner`, `status` and `partition` are lifted out
/// so they can be filtered and guarded on without decoding the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub kind: String,
    pub id: String,
    pub owner: Uuid,
    pub status: String,
    pub partition: String,
    pub data: serde_json::Value,
    /// Secondary unique keys claimed when the record is inserted.
    #[serde(default)]
    pub unique_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub fn hashed_keys(&self) -> Vec<String> {
        self.unique_keys
            .iter()
            .map(|k| unique_key_hash(&self.kind, k))
            .collect()
    }
}

pub fn unique_key_hash(kind: &str, key: &str) -> String {
    crate::hash_key(&format!("{kind}:{key}"))
}

/// Precondition a `PutRecord` must satisfy against the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// Insert; fails with `Conflict` if the id or any unique key is taken.
    Absent,
    /// Conditional update; fails with `GuardFailed` unless the stored row
    /// still carries this status.
    Status(String),
}

#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub kind: String,
    pub owner: Option<Uuid>,
    pub status: Option<String>,
    pub partition: Option<String>,
    pub limit: Option<u32>,
}

impl RecordQuery {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn owner(mut self, owner: Uuid) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &ObjectRecord) -> bool {
        record.kind == self.kind
            && self.owner.is_none_or(|o| o == record.owner)
            && self.status.as_ref().is_none_or(|s| *s == record.status)
            && self
                .partition
                .as_ref()
                .is_none_or(|p| *p == record.partition)
    }
}
