//! Postgres backend: one row per record, JSONB for object fields,
//! batch upsert inside a single transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealfold_core::{
    NextStepPlan, OpportunityRecord, Priority, RecordMetadata, SourceRef, Stage,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::repository::{
    stamp_for_upsert, upsert_failed, validate_for_upsert, OpportunityFilter, OpportunityRepository,
    Page, Pagination, StorageResult, UpsertResult,
};

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS opportunities (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        stage TEXT NOT NULL DEFAULT 'unknown',
        priority TEXT NOT NULL DEFAULT 'medium',
        actors TEXT[] NOT NULL DEFAULT '{}',
        next_steps TEXT,
        structured_next_steps JSONB,
        source_tags TEXT[] NOT NULL DEFAULT '{}',
        source_summary JSONB NOT NULL DEFAULT '[]',
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_opportunities_stage ON opportunities (stage)",
    "CREATE INDEX IF NOT EXISTS idx_opportunities_priority ON opportunities (priority)",
    "CREATE INDEX IF NOT EXISTS idx_opportunities_created_at ON opportunities (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_opportunities_updated_at ON opportunities (updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_opportunities_vendor ON opportunities ((metadata->>'vendor'))",
    "CREATE INDEX IF NOT EXISTS idx_opportunities_customer ON opportunities ((metadata->>'customer'))",
];

const SELECT_COLUMNS: &str = "SELECT id, name, stage, priority, actors, next_steps, \
     structured_next_steps, source_tags, source_summary, metadata, created_at, updated_at \
     FROM opportunities";

#[derive(Debug, sqlx::FromRow)]
struct OpportunityRow {
    id: String,
    name: String,
    stage: String,
    priority: String,
    actors: Vec<String>,
    next_steps: Option<String>,
    structured_next_steps: Option<Json<NextStepPlan>>,
    source_tags: Vec<String>,
    source_summary: Json<Vec<SourceRef>>,
    metadata: Json<RecordMetadata>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OpportunityRow> for OpportunityRecord {
    fn from(row: OpportunityRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            stage: Stage::parse(&row.stage),
            priority: Priority::parse(&row.priority),
            actors: row.actors,
            next_steps: row.next_steps,
            structured_next_steps: row.structured_next_steps.map(|Json(plan)| plan),
            source_tags: row.source_tags,
            source_summary: row.source_summary.0,
            metadata: row.metadata.0,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connects, then creates the table and indexes if missing.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let repo = Self::new(pool);
        repo.ensure_schema().await?;
        Ok(repo)
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> StorageResult<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn push_filter_clauses(builder: &mut QueryBuilder<'_, Postgres>, filter: &OpportunityFilter) {
    if let Some(vendor) = trimmed(filter.vendor.as_deref()) {
        builder
            .push(" AND metadata->>'vendor' ILIKE ")
            .push_bind(format!("%{vendor}%"));
    }
    if let Some(customer) = trimmed(filter.customer.as_deref()) {
        builder
            .push(" AND metadata->>'customer' ILIKE ")
            .push_bind(format!("%{customer}%"));
    }
    if let Some(stage) = filter.stage {
        builder.push(" AND stage = ").push_bind(stage.as_str());
    }
    if let Some(priority) = filter.priority {
        builder.push(" AND priority = ").push_bind(priority.as_str());
    }
    if let Some(min) = filter.min_confidence {
        builder
            .push(" AND (metadata->>'confidence')::float8 >= ")
            .push_bind(min);
    }
    if let Some(after) = filter.created_after {
        builder.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        builder.push(" AND created_at <= ").push_bind(before);
    }
    if let Some(after) = filter.updated_after {
        builder.push(" AND updated_at >= ").push_bind(after);
    }
    if let Some(text) = trimmed(filter.search_text.as_deref()) {
        builder
            .push(
                " AND concat_ws(' ', name, array_to_string(actors, ' '), \
                 coalesce(next_steps, ''), metadata->>'vendor', metadata->>'customer') ILIKE ",
            )
            .push_bind(format!("%{text}%"));
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[async_trait]
impl OpportunityRepository for PostgresRepository {
    /// Whole batch in one transaction: per-record failures are recorded
    /// and the rest still commits (best-effort batch). A failure of the
    /// transaction itself rolls everything back.
    async fn upsert(&self, records: Vec<OpportunityRecord>) -> StorageResult<UpsertResult> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut result = UpsertResult::default();

        for record in records {
            if let Err(message) = validate_for_upsert(&record) {
                result.errors.push(upsert_failed(&record, message));
                continue;
            }
            let existing_created_at: Option<DateTime<Utc>> =
                match sqlx::query_scalar("SELECT created_at FROM opportunities WHERE id = $1")
                    .bind(&record.id)
                    .fetch_optional(&mut *tx)
                    .await
                {
                    Ok(found) => found,
                    Err(err) => {
                        result.errors.push(upsert_failed(&record, err.to_string()));
                        continue;
                    }
                };

            let stamped = stamp_for_upsert(record, existing_created_at, now);
            let written = if existing_created_at.is_some() {
                sqlx::query(
                    "UPDATE opportunities SET name = $2, stage = $3, priority = $4, \
                     actors = $5, next_steps = $6, structured_next_steps = $7, \
                     source_tags = $8, source_summary = $9, metadata = $10, \
                     updated_at = $11 WHERE id = $1",
                )
                .bind(&stamped.id)
                .bind(&stamped.name)
                .bind(stamped.stage.as_str())
                .bind(stamped.priority.as_str())
                .bind(&stamped.actors)
                .bind(&stamped.next_steps)
                .bind(stamped.structured_next_steps.clone().map(Json))
                .bind(&stamped.source_tags)
                .bind(Json(stamped.source_summary.clone()))
                .bind(Json(stamped.metadata.clone()))
                .bind(stamped.updated_at.unwrap_or(now))
                .execute(&mut *tx)
                .await
            } else {
                sqlx::query(
                    "INSERT INTO opportunities (id, name, stage, priority, actors, \
                     next_steps, structured_next_steps, source_tags, source_summary, \
                     metadata, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                )
                .bind(&stamped.id)
                .bind(&stamped.name)
                .bind(stamped.stage.as_str())
                .bind(stamped.priority.as_str())
                .bind(&stamped.actors)
                .bind(&stamped.next_steps)
                .bind(stamped.structured_next_steps.clone().map(Json))
                .bind(&stamped.source_tags)
                .bind(Json(stamped.source_summary.clone()))
                .bind(Json(stamped.metadata.clone()))
                .bind(stamped.created_at.unwrap_or(now))
                .bind(stamped.updated_at.unwrap_or(now))
                .execute(&mut *tx)
                .await
            };

            match written {
                Ok(_) => {
                    if existing_created_at.is_some() {
                        result.updated += 1;
                    } else {
                        result.created += 1;
                    }
                    result.records.push(stamped);
                }
                Err(err) => result.errors.push(upsert_failed(&stamped, err.to_string())),
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn find_by_id(&self, id: &str) -> StorageResult<Option<OpportunityRecord>> {
        let row: Option<OpportunityRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(OpportunityRecord::from))
    }

    async fn find_by_ids(&self, ids: &[String]) -> StorageResult<Vec<OpportunityRecord>> {
        let rows: Vec<OpportunityRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE id = ANY($1) ORDER BY created_at DESC, id ASC"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(OpportunityRecord::from).collect())
    }

    async fn find_by_filter(
        &self,
        filter: &OpportunityFilter,
        page: Pagination,
    ) -> StorageResult<Page<OpportunityRecord>> {
        let mut count_builder =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM opportunities WHERE TRUE");
        push_filter_clauses(&mut count_builder, filter);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let limit = page.clamped_limit();
        let mut builder = QueryBuilder::<Postgres>::new(format!("{SELECT_COLUMNS} WHERE TRUE"));
        push_filter_clauses(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, id ASC");
        builder.push(" LIMIT ").push_bind(limit as i64);
        builder.push(" OFFSET ").push_bind(page.offset as i64);
        let rows: Vec<OpportunityRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        let data: Vec<OpportunityRecord> =
            rows.into_iter().map(OpportunityRecord::from).collect();
        let total = total.max(0) as usize;
        let has_more = page.offset + data.len() < total;
        Ok(Page {
            data,
            total,
            limit,
            offset: page.offset,
            has_more,
        })
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        let done = sqlx::query("DELETE FROM opportunities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn delete_many(&self, ids: &[String]) -> StorageResult<usize> {
        let done = sqlx::query("DELETE FROM opportunities WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() as usize)
    }

    async fn count(&self, filter: Option<&OpportunityFilter>) -> StorageResult<usize> {
        let mut builder =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM opportunities WHERE TRUE");
        if let Some(filter) = filter {
            push_filter_clauses(&mut builder, filter);
        }
        let total: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(total.max(0) as usize)
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM opportunities WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    async fn distinct_vendors(&self) -> StorageResult<Vec<String>> {
        let vendors: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT metadata->>'vendor' AS vendor FROM opportunities \
             WHERE coalesce(metadata->>'vendor', '') <> '' ORDER BY vendor",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(vendors)
    }

    async fn distinct_customers(&self) -> StorageResult<Vec<String>> {
        let customers: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT metadata->>'customer' AS customer FROM opportunities \
             WHERE coalesce(metadata->>'customer', '') <> '' ORDER BY customer",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(customers)
    }

    async fn clear(&self) -> StorageResult<()> {
        sqlx::query("DELETE FROM opportunities")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Requires a live database: DATABASE_URL=postgres://... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn round_trip_against_a_live_database() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let repo = PostgresRepository::connect(&url).await.expect("connect");
        repo.clear().await.expect("clear");

        let mut record = OpportunityRecord {
            id: "pg-opp-1".into(),
            name: "PDU rollout".into(),
            stage: Stage::Quote,
            ..Default::default()
        };
        record.metadata.vendor = Some("ClearLED".into());

        let result = repo.upsert(vec![record]).await.expect("upsert");
        assert_eq!(result.created, 1);

        let stored = repo
            .find_by_id("pg-opp-1")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(stored.stage, Stage::Quote);
        assert_eq!(stored.vendor(), Some("ClearLED"));
        assert_eq!(
            repo.distinct_vendors().await.expect("vendors"),
            vec!["ClearLED".to_string()]
        );

        repo.clear().await.expect("cleanup");
        repo.close().await.expect("close");
    }
}
