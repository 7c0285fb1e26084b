//! SQLite memory store implementation.
//!
//! Implements `MemoryStore` from `stepwise-core`. Appends go through the
//! single-connection writer pool, so two appends never interleave; reads use
//! the reader pool. Timestamps are stored as fixed-width RFC 3339 strings
//! (microseconds, `Z`) so text ordering equals time ordering.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::Row;
use stepwise_core::memory::MemoryStore;
use stepwise_core::memory::store::purge_cutoff;
use stepwise_types::error::StoreError;
use stepwise_types::memory::{
    Classification, MemorySlice, MemoryStats, NewSlice, RunSummary, SliceQuery,
};
use stepwise_types::run::RunId;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `MemoryStore`.
pub struct SqliteMemoryStore {
    pool: DatabasePool,
}

impl SqliteMemoryStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Insert with an explicit timestamp. The timestamp only drives purge;
    /// recency is the row id.
    async fn append_at(&self, slice: NewSlice, created_at: DateTime<Utc>) -> Result<i64, StoreError> {
        let metadata = serde_json::to_string(&slice.metadata)
            .map_err(|e| StoreError::Write(format!("encode metadata: {e}")))?;

        let result = sqlx::query(
            r#"INSERT INTO memory_slices (run_id, step_name, classification, content, metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(slice.run_id.as_str())
        .bind(&slice.step_name)
        .bind(slice.classification.as_str())
        .bind(&slice.content)
        .bind(metadata)
        .bind(format_datetime(&created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Write(e.to_string()))?;

        Ok(result.last_insert_rowid())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct SliceRow {
    id: i64,
    run_id: String,
    step_name: String,
    classification: String,
    content: String,
    metadata: String,
    created_at: String,
}

impl SliceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            classification: row.try_get("classification")?,
            content: row.try_get("content")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_slice(self) -> Result<MemorySlice, StoreError> {
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata)
            .map_err(|e| StoreError::Read(format!("invalid slice metadata: {e}")))?;
        Ok(MemorySlice {
            id: self.id,
            run_id: RunId::from(self.run_id),
            step_name: self.step_name,
            classification: Classification::from(self.classification),
            content: self.content,
            metadata,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

const SLICE_COLUMNS: &str =
    "id, run_id, step_name, classification, content, metadata, created_at";

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Read(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn read_err(e: sqlx::Error) -> StoreError {
    StoreError::Read(e.to_string())
}

fn rows_to_slices(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<MemorySlice>, StoreError> {
    rows.iter()
        .map(|row| SliceRow::from_row(row).map_err(read_err)?.into_slice())
        .collect()
}

// ---------------------------------------------------------------------------
// MemoryStore implementation
// ---------------------------------------------------------------------------

impl MemoryStore for SqliteMemoryStore {
    async fn append(&self, slice: NewSlice) -> Result<i64, StoreError> {
        self.append_at(slice, Utc::now()).await
    }

    async fn query(&self, query: &SliceQuery) -> Result<Vec<MemorySlice>, StoreError> {
        let limit = query
            .limit
            .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let classification = query.classification.as_ref().map(|c| c.as_str().to_string());

        let rows = sqlx::query(&format!(
            r#"SELECT {SLICE_COLUMNS} FROM memory_slices
               WHERE run_id = ?
                 AND (? IS NULL OR step_name = ?)
                 AND (? IS NULL OR classification = ?)
               ORDER BY id DESC
               LIMIT ?"#
        ))
        .bind(query.run_id.as_str())
        .bind(query.step_name.as_deref())
        .bind(query.step_name.as_deref())
        .bind(classification.as_deref())
        .bind(classification.as_deref())
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(read_err)?;

        rows_to_slices(&rows)
    }

    async fn latest(&self, run_id: &RunId) -> Result<Option<MemorySlice>, StoreError> {
        let mut slices = self.query(&SliceQuery::run(run_id).limit(1)).await?;
        Ok(slices.pop())
    }

    async fn purge(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = format_datetime(&purge_cutoff(older_than));
        let result = sqlx::query("DELETE FROM memory_slices WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn history(&self, run_id: &RunId) -> Result<Vec<MemorySlice>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SLICE_COLUMNS} FROM memory_slices WHERE run_id = ? ORDER BY id ASC"
        ))
        .bind(run_id.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(read_err)?;

        rows_to_slices(&rows)
    }

    async fn runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT run_id, COUNT(*) AS slice_count, MIN(created_at) AS first_at, MAX(created_at) AS last_at, MAX(id) AS last_id
               FROM memory_slices
               GROUP BY run_id
               ORDER BY last_id DESC
               LIMIT ?"#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(read_err)?;

        rows.iter()
            .map(|row| {
                let run_id: String = row.try_get("run_id").map_err(read_err)?;
                let slice_count: i64 = row.try_get("slice_count").map_err(read_err)?;
                let first_at: String = row.try_get("first_at").map_err(read_err)?;
                let last_at: String = row.try_get("last_at").map_err(read_err)?;
                Ok(RunSummary {
                    run_id: RunId::from(run_id),
                    slice_count: slice_count as u64,
                    first_at: parse_datetime(&first_at)?,
                    last_at: parse_datetime(&last_at)?,
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<MemoryStats, StoreError> {
        let (total, runs): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COUNT(DISTINCT run_id) FROM memory_slices")
                .fetch_one(&self.pool.reader)
                .await
                .map_err(read_err)?;

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT classification, COUNT(*) FROM memory_slices GROUP BY classification",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(read_err)?;

        let by_classification: BTreeMap<String, u64> = rows
            .into_iter()
            .map(|(class, count)| (class, count as u64))
            .collect();

        Ok(MemoryStats {
            total_slices: total as u64,
            distinct_runs: runs as u64,
            by_classification,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
