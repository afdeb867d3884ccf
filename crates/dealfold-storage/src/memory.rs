//! In-memory backend, primarily for tests. Same filter/sort/pagination
//! semantics as the flat-file backend, no locking beyond the map guard.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dealfold_core::OpportunityRecord;
use tokio::sync::RwLock;

use crate::query;
use crate::repository::{
    stamp_for_upsert, upsert_failed, validate_for_upsert, OpportunityFilter, OpportunityRepository,
    Page, Pagination, StorageResult, UpsertResult,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    records: Arc<RwLock<HashMap<String, OpportunityRecord>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OpportunityRepository for MemoryRepository {
    async fn upsert(&self, records: Vec<OpportunityRecord>) -> StorageResult<UpsertResult> {
        let mut map = self.records.write().await;
        let now = Utc::now();
        let mut result = UpsertResult::default();
        for record in records {
            if let Err(message) = validate_for_upsert(&record) {
                result.errors.push(upsert_failed(&record, message));
                continue;
            }
            let previous_created_at = map.get(&record.id).and_then(|prev| prev.created_at);
            if map.contains_key(&record.id) {
                result.updated += 1;
            } else {
                result.created += 1;
            }
            let stamped = stamp_for_upsert(record, previous_created_at, now);
            map.insert(stamped.id.clone(), stamped.clone());
            result.records.push(stamped);
        }
        Ok(result)
    }

    async fn find_by_id(&self, id: &str) -> StorageResult<Option<OpportunityRecord>> {
        let map = self.records.read().await;
        Ok(map.get(id).cloned())
    }

    async fn find_by_ids(&self, ids: &[String]) -> StorageResult<Vec<OpportunityRecord>> {
        let map = self.records.read().await;
        let mut records: Vec<OpportunityRecord> =
            ids.iter().filter_map(|id| map.get(id).cloned()).collect();
        query::sort_newest_first(&mut records);
        Ok(records)
    }

    async fn find_by_filter(
        &self,
        filter: &OpportunityFilter,
        page: Pagination,
    ) -> StorageResult<Page<OpportunityRecord>> {
        let map = self.records.read().await;
        let mut records: Vec<OpportunityRecord> = map
            .values()
            .filter(|record| query::matches(record, filter))
            .cloned()
            .collect();
        query::sort_newest_first(&mut records);
        Ok(query::paginate(records, page))
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        let mut map = self.records.write().await;
        Ok(map.remove(id).is_some())
    }

    async fn delete_many(&self, ids: &[String]) -> StorageResult<usize> {
        let mut map = self.records.write().await;
        Ok(ids.iter().filter(|id| map.remove(*id).is_some()).count())
    }

    async fn count(&self, filter: Option<&OpportunityFilter>) -> StorageResult<usize> {
        let map = self.records.read().await;
        Ok(match filter {
            Some(filter) => map
                .values()
                .filter(|record| query::matches(record, filter))
                .count(),
            None => map.len(),
        })
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        let map = self.records.read().await;
        Ok(map.contains_key(id))
    }

    async fn distinct_vendors(&self) -> StorageResult<Vec<String>> {
        let map = self.records.read().await;
        Ok(query::distinct_sorted(
            map.values().filter_map(|r| r.vendor().map(str::to_string)),
        ))
    }

    async fn distinct_customers(&self) -> StorageResult<Vec<String>> {
        let map = self.records.read().await;
        Ok(query::distinct_sorted(
            map.values()
                .filter_map(|r| r.customer().map(str::to_string)),
        ))
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut map = self.records.write().await;
        map.clear();
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealfold_core::RecordMetadata;

    fn record(id: &str, name: &str, vendor: Option<&str>) -> OpportunityRecord {
        OpportunityRecord {
            id: id.into(),
            name: name.into(),
            metadata: RecordMetadata {
                vendor: vendor.map(ToString::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn replace_by_id_reports_created_then_updated() {
        let repo = MemoryRepository::new();
        let first = repo
            .upsert(vec![record("opp-1", "A", None)])
            .await
            .expect("first");
        assert_eq!((first.created, first.updated), (1, 0));

        let second = repo
            .upsert(vec![record("opp-1", "B", None)])
            .await
            .expect("second");
        assert_eq!((second.created, second.updated), (0, 1));

        let stored = repo
            .find_by_id("opp-1")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(stored.name, "B");
    }

    #[tokio::test]
    async fn pagination_matches_the_full_sorted_slice() {
        let repo = MemoryRepository::new();
        let batch: Vec<OpportunityRecord> = (0..25)
            .map(|i| record(&format!("opp-{i:02}"), "x", None))
            .collect();
        repo.upsert(batch).await.expect("seed");

        let filter = OpportunityFilter::default();
        let full = repo
            .find_by_filter(
                &filter,
                Pagination {
                    limit: 1000,
                    offset: 0,
                },
            )
            .await
            .expect("full");
        let window = repo
            .find_by_filter(
                &filter,
                Pagination {
                    limit: 10,
                    offset: 7,
                },
            )
            .await
            .expect("window");

        let expected: Vec<String> = full
            .data
            .iter()
            .skip(7)
            .take(10)
            .map(|r| r.id.clone())
            .collect();
        let got: Vec<String> = window.data.iter().map(|r| r.id.clone()).collect();
        assert_eq!(got, expected);
        assert_eq!(window.total, 25);
        assert!(window.has_more);
    }

    #[tokio::test]
    async fn distinct_vendors_are_sorted_and_unique() {
        let repo = MemoryRepository::new();
        repo.upsert(vec![
            record("opp-1", "A", Some("Zeta")),
            record("opp-2", "B", Some("Acme")),
            record("opp-3", "C", Some("Zeta")),
            record("opp-4", "D", None),
        ])
        .await
        .expect("seed");

        assert_eq!(
            repo.distinct_vendors().await.expect("vendors"),
            vec!["Acme".to_string(), "Zeta".to_string()]
        );
    }

    #[tokio::test]
    async fn delete_many_counts_only_existing_ids() {
        let repo = MemoryRepository::new();
        repo.upsert(vec![record("opp-1", "A", None), record("opp-2", "B", None)])
            .await
            .expect("seed");
        let removed = repo
            .delete_many(&["opp-1".to_string(), "ghost".to_string()])
            .await
            .expect("delete_many");
        assert_eq!(removed, 1);
        assert_eq!(repo.count(None).await.expect("count"), 1);
    }
}
