//! Repository contract shared by every backend.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealfold_core::{OpportunityRecord, Priority, Stage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Error type for repository operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The exclusive data-file lock could not be acquired in time.
    #[error("timed out after {waited_ms} ms waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// The data file parses as JSON but is not an array of records.
    #[error("data file {path} is corrupt: expected a JSON array")]
    Corrupt { path: PathBuf },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Machine-readable code carried on a per-batch upsert error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpsertErrorCode {
    UpsertFailed,
    LockTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertError {
    pub id: Option<String>,
    pub code: UpsertErrorCode,
    pub message: String,
}

/// Per-batch upsert outcome. Individual record failures land in `errors`
/// without aborting the rest of the batch; a lock timeout fails the whole
/// batch with a single `LOCK_TIMEOUT` entry and zero durable effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertResult {
    pub records: Vec<OpportunityRecord>,
    pub created: usize,
    pub updated: usize,
    pub errors: Vec<UpsertError>,
}

impl UpsertResult {
    pub fn lock_timeout(message: impl Into<String>) -> Self {
        Self {
            errors: vec![UpsertError {
                id: None,
                code: UpsertErrorCode::LockTimeout,
                message: message.into(),
            }],
            ..Self::default()
        }
    }
}

/// Record filter applied identically by every backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpportunityFilter {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub search_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    /// Effective page size: at least 1, capped at [`MAX_PAGE_LIMIT`].
    pub fn clamped_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

/// Persistence operations every backend must support.
#[async_trait]
pub trait OpportunityRepository: Send + Sync {
    /// Full replace-by-id upsert of a batch of records. `created_at` is
    /// preserved for existing ids, `updated_at` refreshed on every write.
    async fn upsert(&self, records: Vec<OpportunityRecord>) -> StorageResult<UpsertResult>;

    async fn find_by_id(&self, id: &str) -> StorageResult<Option<OpportunityRecord>>;

    async fn find_by_ids(&self, ids: &[String]) -> StorageResult<Vec<OpportunityRecord>>;

    /// Filtered, paginated listing sorted by `created_at` descending.
    async fn find_by_filter(
        &self,
        filter: &OpportunityFilter,
        page: Pagination,
    ) -> StorageResult<Page<OpportunityRecord>>;

    /// Returns true when a record with `id` existed and was removed.
    async fn delete(&self, id: &str) -> StorageResult<bool>;

    /// Returns the number of records removed.
    async fn delete_many(&self, ids: &[String]) -> StorageResult<usize>;

    async fn count(&self, filter: Option<&OpportunityFilter>) -> StorageResult<usize>;

    async fn exists(&self, id: &str) -> StorageResult<bool>;

    /// Sorted, de-duplicated non-empty vendor names present in the store.
    async fn distinct_vendors(&self) -> StorageResult<Vec<String>>;

    /// Sorted, de-duplicated non-empty customer names present in the store.
    async fn distinct_customers(&self) -> StorageResult<Vec<String>>;

    async fn clear(&self) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}

/// Rejects records the repository will not accept.
pub(crate) fn validate_for_upsert(record: &OpportunityRecord) -> Result<(), String> {
    if record.id.trim().is_empty() {
        return Err("record id must not be empty".to_string());
    }
    Ok(())
}

/// Applies the timestamp invariants: `created_at` sticks once assigned,
/// `updated_at` always moves to `now`.
pub(crate) fn stamp_for_upsert(
    mut record: OpportunityRecord,
    existing_created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> OpportunityRecord {
    record.created_at = existing_created_at.or(record.created_at).or(Some(now));
    record.updated_at = Some(now);
    record
}

pub(crate) fn upsert_failed(record: &OpportunityRecord, message: impl Into<String>) -> UpsertError {
    let id = if record.id.is_empty() {
        None
    } else {
        Some(record.id.clone())
    };
    UpsertError {
        id,
        code: UpsertErrorCode::UpsertFailed,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_error_codes_serialize_screaming() {
        let failed = serde_json::to_string(&UpsertErrorCode::UpsertFailed).expect("serialize");
        let timeout = serde_json::to_string(&UpsertErrorCode::LockTimeout).expect("serialize");
        assert_eq!(failed, "\"UPSERT_FAILED\"");
        assert_eq!(timeout, "\"LOCK_TIMEOUT\"");
    }

    #[test]
    fn pagination_limit_is_capped() {
        let page = Pagination {
            limit: 5000,
            offset: 0,
        };
        assert_eq!(page.clamped_limit(), MAX_PAGE_LIMIT);
        assert_eq!(Pagination::default().clamped_limit(), DEFAULT_PAGE_LIMIT);
        let zero = Pagination {
            limit: 0,
            offset: 0,
        };
        assert_eq!(zero.clamped_limit(), 1);
    }

    #[test]
    fn stamp_preserves_existing_created_at() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::hours(1);
        let record = OpportunityRecord {
            id: "opp-1".into(),
            ..Default::default()
        };
        let stamped = stamp_for_upsert(record, Some(earlier), now);
        assert_eq!(stamped.created_at, Some(earlier));
        assert_eq!(stamped.updated_at, Some(now));
    }
}
