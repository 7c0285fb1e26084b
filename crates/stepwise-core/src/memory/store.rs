//! Memory store trait definition.
//!
//! The store is a durable append-only log of [`MemorySlice`]s keyed by run
//! id. It is the only resource shared between concurrent runs, so
//! implementations must make `append` atomic and never interleave two
//! appends for the same run.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use stepwise_types::error::StoreError;
use stepwise_types::memory::{MemorySlice, MemoryStats, NewSlice, RunSummary, SliceQuery};
use stepwise_types::run::RunId;

/// Trait for memory slice persistence.
///
/// Write failures must surface as [`StoreError::Write`] and read failures as
/// [`StoreError::Read`]; the executor treats the two differently.
pub trait MemoryStore: Send + Sync {
    /// Append one slice. Either the whole slice is stored or nothing is.
    fn append(
        &self,
        slice: NewSlice,
    ) -> impl std::future::Future<Output = Result<i64, StoreError>> + Send;

    /// Slices matching `query`, newest first.
    fn query(
        &self,
        query: &SliceQuery,
    ) -> impl std::future::Future<Output = Result<Vec<MemorySlice>, StoreError>> + Send;

    /// Most recent slice of a run, regardless of classification.
    fn latest(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Option<MemorySlice>, StoreError>> + Send;

    /// Delete slices created before `now - older_than`. Returns the count removed.
    fn purge(
        &self,
        older_than: Duration,
    ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

    /// Every slice of a run, oldest first.
    fn history(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Vec<MemorySlice>, StoreError>> + Send;

    /// Most recently active runs, newest first.
    fn runs(
        &self,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<RunSummary>, StoreError>> + Send;

    fn stats(&self) -> impl std::future::Future<Output = Result<MemoryStats, StoreError>> + Send;
}

/// Creation-time cutoff for `purge`. Saturates instead of overflowing.
pub fn purge_cutoff(older_than: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(older_than)
        .ok()
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
