//! Flat-file backend: one JSON array per logical store, guarded by a
//! sidecar file lock, with atomic temp-file-then-rename writes.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealfold_core::OpportunityRecord;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::lock::{FileLock, LockConfig};
use crate::query;
use crate::repository::{
    stamp_for_upsert, upsert_failed, validate_for_upsert, OpportunityFilter, OpportunityRepository,
    Page, Pagination, StorageError, StorageResult, UpsertResult,
};

const STORE_DIR: &str = "opportunities";
const DATA_FILE: &str = "opportunities.json";
const INDEX_FILE: &str = "index.json";

/// Cached distinct vendors/customers and record count, rebuilt on every
/// mutation alongside the data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreIndex {
    pub vendors: Vec<String>,
    pub customers: Vec<String>,
    pub count: usize,
    pub last_updated: DateTime<Utc>,
}

impl StoreIndex {
    fn for_records(records: &[OpportunityRecord]) -> Self {
        Self {
            vendors: query::distinct_sorted(
                records.iter().filter_map(|r| r.vendor().map(str::to_string)),
            ),
            customers: query::distinct_sorted(
                records
                    .iter()
                    .filter_map(|r| r.customer().map(str::to_string)),
            ),
            count: records.len(),
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileSystemRepository {
    data_path: PathBuf,
    index_path: PathBuf,
    lock: LockConfig,
}

impl FileSystemRepository {
    pub fn new(data_dir: impl Into<PathBuf>, lock: LockConfig) -> Self {
        let store_dir = data_dir.into().join(STORE_DIR);
        Self {
            data_path: store_dir.join(DATA_FILE),
            index_path: store_dir.join(INDEX_FILE),
            lock,
        }
    }

    /// Resolved on-disk data file, for observability.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Reads the full record array. A missing file is an empty store; a
    /// file that parses as JSON but is not an array is corruption.
    async fn read_all(&self) -> StorageResult<Vec<OpportunityRecord>> {
        let bytes = match fs::read(&self.data_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&self.data_path, err)),
        };
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        if !value.is_array() {
            return Err(StorageError::Corrupt {
                path: self.data_path.clone(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn write_all(&self, records: &[OpportunityRecord]) -> StorageResult<()> {
        let data = serde_json::to_vec_pretty(records)?;
        write_atomic(&self.data_path, &data).await?;
        let index = serde_json::to_vec_pretty(&StoreIndex::for_records(records))?;
        write_atomic(&self.index_path, &index).await
    }

    async fn read_index(&self) -> Option<StoreIndex> {
        let bytes = fs::read(&self.index_path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn upsert_locked(&self, records: Vec<OpportunityRecord>) -> StorageResult<UpsertResult> {
        let existing = self.read_all().await?;
        let mut order: Vec<String> = existing.iter().map(|r| r.id.clone()).collect();
        let mut by_id: HashMap<String, OpportunityRecord> = existing
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let now = Utc::now();
        let mut result = UpsertResult::default();
        for record in records {
            if let Err(message) = validate_for_upsert(&record) {
                result.errors.push(upsert_failed(&record, message));
                continue;
            }
            let previous_created_at = by_id.get(&record.id).and_then(|prev| prev.created_at);
            if by_id.contains_key(&record.id) {
                result.updated += 1;
            } else {
                result.created += 1;
                order.push(record.id.clone());
            }
            let stamped = stamp_for_upsert(record, previous_created_at, now);
            by_id.insert(stamped.id.clone(), stamped.clone());
            result.records.push(stamped);
        }

        let merged: Vec<OpportunityRecord> = order
            .iter()
            .filter_map(|id| by_id.get(id).cloned())
            .collect();
        self.write_all(&merged).await?;
        Ok(result)
    }

    async fn delete_locked(&self, ids: &[String]) -> StorageResult<usize> {
        let records = self.read_all().await?;
        let before = records.len();
        let kept: Vec<OpportunityRecord> = records
            .into_iter()
            .filter(|record| !ids.contains(&record.id))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write_all(&kept).await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl OpportunityRepository for FileSystemRepository {
    async fn upsert(&self, records: Vec<OpportunityRecord>) -> StorageResult<UpsertResult> {
        let lock = match FileLock::acquire(&self.data_path, self.lock).await {
            Ok(lock) => lock,
            Err(err @ StorageError::LockTimeout { .. }) => {
                return Ok(UpsertResult::lock_timeout(err.to_string()));
            }
            Err(err) => return Err(err),
        };
        let outcome = self.upsert_locked(records).await;
        lock.release().await;
        outcome
    }

    async fn find_by_id(&self, id: &str) -> StorageResult<Option<OpportunityRecord>> {
        let records = self.read_all().await?;
        Ok(records.into_iter().find(|record| record.id == id))
    }

    async fn find_by_ids(&self, ids: &[String]) -> StorageResult<Vec<OpportunityRecord>> {
        let mut records: Vec<OpportunityRecord> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|record| ids.contains(&record.id))
            .collect();
        query::sort_newest_first(&mut records);
        Ok(records)
    }

    async fn find_by_filter(
        &self,
        filter: &OpportunityFilter,
        page: Pagination,
    ) -> StorageResult<Page<OpportunityRecord>> {
        let mut records: Vec<OpportunityRecord> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|record| query::matches(record, filter))
            .collect();
        query::sort_newest_first(&mut records);
        Ok(query::paginate(records, page))
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        let removed = self.delete_many(&[id.to_string()]).await?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, ids: &[String]) -> StorageResult<usize> {
        let lock = FileLock::acquire(&self.data_path, self.lock).await?;
        let outcome = self.delete_locked(ids).await;
        lock.release().await;
        outcome
    }

    async fn count(&self, filter: Option<&OpportunityFilter>) -> StorageResult<usize> {
        let records = self.read_all().await?;
        Ok(match filter {
            Some(filter) => records
                .iter()
                .filter(|record| query::matches(record, filter))
                .count(),
            None => records.len(),
        })
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        Ok(self.find_by_id(id).await?.is_some())
    }

    async fn distinct_vendors(&self) -> StorageResult<Vec<String>> {
        if let Some(index) = self.read_index().await {
            return Ok(index.vendors);
        }
        let records = self.read_all().await?;
        Ok(query::distinct_sorted(
            records.iter().filter_map(|r| r.vendor().map(str::to_string)),
        ))
    }

    async fn distinct_customers(&self) -> StorageResult<Vec<String>> {
        if let Some(index) = self.read_index().await {
            return Ok(index.customers);
        }
        let records = self.read_all().await?;
        Ok(query::distinct_sorted(
            records
                .iter()
                .filter_map(|r| r.customer().map(str::to_string)),
        ))
    }

    async fn clear(&self) -> StorageResult<()> {
        let lock = FileLock::acquire(&self.data_path, self.lock).await?;
        let outcome = self.write_all(&[]).await;
        lock.release().await;
        outcome
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Writes `bytes` to a uniquely-named sibling temp file, then renames it
/// over `path`. Readers never observe a partially written file; the temp
/// file is removed if anything fails before the rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| StorageError::io(parent, err))?;
    }
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("data");
    let temp_path = path.with_file_name(format!(
        "{file_name}.{}.{}.tmp",
        std::process::id(),
        Utc::now().timestamp_millis()
    ));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|err| StorageError::io(&temp_path, err))?;
    if let Err(err) = write_and_flush(&mut file, bytes).await {
        drop(file);
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(&temp_path, err));
    }
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(path, err));
    }
    Ok(())
}

async fn write_and_flush(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}
