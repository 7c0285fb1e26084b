//! In-process memory store.
//!
//! Slices live in a `DashMap` keyed by run id. An append holds the entry
//! lock for its run, so appends to one run are serialized while other runs
//! proceed on other shards. Nothing survives the process; the SQLite store
//! in `stepwise-infra` is the durable implementation.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stepwise_types::error::StoreError;
use stepwise_types::memory::{MemorySlice, MemoryStats, NewSlice, RunSummary, SliceQuery};
use stepwise_types::run::RunId;

use super::store::{purge_cutoff, MemoryStore};

#[derive(Debug, Default)]
pub struct VolatileMemoryStore {
    runs: DashMap<RunId, Vec<MemorySlice>>,
    next_id: AtomicI64,
}

impl VolatileMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_at(&self, slice: NewSlice, created_at: DateTime<Utc>) -> i64 {
        let mut entry = self.runs.entry(slice.run_id.clone()).or_default();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        entry.push(MemorySlice {
            id,
            run_id: slice.run_id,
            step_name: slice.step_name,
            classification: slice.classification,
            content: slice.content,
            metadata: slice.metadata,
            created_at,
        });
        id
    }
}

/// Recency is append order; `created_at` only drives purge.
fn newest_first(slices: &mut [MemorySlice]) {
    slices.sort_by(|a, b| b.id.cmp(&a.id));
}

impl MemoryStore for VolatileMemoryStore {
    async fn append(&self, slice: NewSlice) -> Result<i64, StoreError> {
        Ok(self.append_at(slice, Utc::now()))
    }

    async fn query(&self, query: &SliceQuery) -> Result<Vec<MemorySlice>, StoreError> {
        let Some(entry) = self.runs.get(&query.run_id) else {
            return Ok(Vec::new());
        };
        let mut slices: Vec<MemorySlice> =
            entry.value().iter().filter(|s| query.matches(s)).cloned().collect();
        drop(entry);

        newest_first(&mut slices);
        if let Some(limit) = query.limit {
            slices.truncate(limit);
        }
        Ok(slices)
    }

    async fn latest(&self, run_id: &RunId) -> Result<Option<MemorySlice>, StoreError> {
        let mut slices = self.query(&SliceQuery::run(run_id).limit(1)).await?;
        Ok(slices.pop())
    }

    async fn purge(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = purge_cutoff(older_than);
        let mut removed = 0u64;
        self.runs.retain(|_, slices| {
            let before = slices.len();
            slices.retain(|s| s.created_at >= cutoff);
            removed += (before - slices.len()) as u64;
            !slices.is_empty()
        });
        Ok(removed)
    }

    async fn history(&self, run_id: &RunId) -> Result<Vec<MemorySlice>, StoreError> {
        let mut slices = self.query(&SliceQuery::run(run_id)).await?;
        slices.reverse();
        Ok(slices)
    }

    async fn runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let mut summaries: Vec<(i64, RunSummary)> = self
            .runs
            .iter()
            .filter_map(|entry| {
                let slices = entry.value();
                let first_at = slices.iter().map(|s| s.created_at).min()?;
                let last_at = slices.iter().map(|s| s.created_at).max()?;
                let last_id = slices.iter().map(|s| s.id).max()?;
                let summary = RunSummary {
                    run_id: entry.key().clone(),
                    slice_count: slices.len() as u64,
                    first_at,
                    last_at,
                };
                Some((last_id, summary))
            })
            .collect();
        summaries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(summaries
            .into_iter()
            .take(limit)
            .map(|(_, summary)| summary)
            .collect())
    }

    async fn stats(&self) -> Result<MemoryStats, StoreError> {
        let mut by_classification = BTreeMap::new();
        let mut total = 0u64;
        let mut runs = HashSet::new();
        for entry in self.runs.iter() {
            runs.insert(entry.key().clone());
            for slice in entry.value() {
                total += 1;
                *by_classification
                    .entry(slice.classification.to_string())
                    .or_insert(0) += 1;
            }
        }
        Ok(MemoryStats {
            total_slices: total,
            distinct_runs: runs.len() as u64,
            by_classification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stepwise_types::memory::Classification;

    fn slice(run: &RunId, step: &str, class: Classification, content: &str) -> NewSlice {
        NewSlice::new(run, step, class, content)
    }

    #[tokio::test]
    async fn append_then_query_round_trips_content() {
        let store = VolatileMemoryStore::new();
        let run = RunId::from("r1");
        let content = "multi\nline ✓ {{not a template}}";
        store
            .append(slice(&run, "s1", Classification::Output, content))
            .await
            .unwrap();

        let found = store
            .query(
                &SliceQuery::run(&run)
                    .step("s1")
                    .classification(Classification::Output),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, content);
    }

    #[tokio::test]
    async fn query_is_newest_first_and_limited() {
        let store = VolatileMemoryStore::new();
        let run = RunId::from("r1");
        for i in 0..5 {
            store
                .append(slice(&run, "s", Classification::Output, &i.to_string()))
                .await
                .unwrap();
        }
        store
            .append(slice(&RunId::from("other"), "s", Classification::Output, "x"))
            .await
            .unwrap();

        let found = store.query(&SliceQuery::run(&run).limit(2)).await.unwrap();
        let contents: Vec<&str> = found.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["4", "3"]);

        let latest = store.latest(&run).await.unwrap().unwrap();
        assert_eq!(latest.content, "4");

        let history = store.history(&run).await.unwrap();
        assert_eq!(history.first().unwrap().content, "0");
        assert_eq!(history.len(), 5);
    }

    #[tokio::test]
    async fn append_order_wins_over_a_clock_regression() {
        let store = VolatileMemoryStore::new();
        let run = RunId::from("clock");
        let now = Utc::now();
        store.append_at(slice(&run, "s1", Classification::Output, "first"), now);
        store.append_at(
            slice(&run, "s2", Classification::Output, "second"),
            now - chrono::TimeDelta::hours(1),
        );

        assert_eq!(store.latest(&run).await.unwrap().unwrap().content, "second");
        let history = store.history(&run).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn purge_removes_only_old_slices() {
        let store = VolatileMemoryStore::new();
        let run = RunId::from("r1");
        let old = Utc::now() - chrono::TimeDelta::days(10);
        store.append_at(slice(&run, "s", Classification::Output, "old"), old);
        store
            .append(slice(&run, "s", Classification::Output, "new"))
            .await
            .unwrap();

        let removed = store.purge(Duration::from_secs(24 * 60 * 60)).await.unwrap();
        assert_eq!(removed, 1);
        let left = store.history(&run).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content, "new");
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_run_are_all_kept() {
        let store = Arc::new(VolatileMemoryStore::new());
        let run = RunId::from("busy");
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            let run = run.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(NewSlice::new(&run, "s", Classification::Output, i.to_string()))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_slices, 32);
        assert_eq!(stats.distinct_runs, 1);
        assert_eq!(stats.by_classification["output"], 32);

        let runs = store.runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].slice_count, 32);
    }
}
