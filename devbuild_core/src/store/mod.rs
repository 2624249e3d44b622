//! Persistence port for build records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{BuildRecord, ListOptions};

/// Storage interface for build records, keyed by integer id with
/// `meta.updated_at` as the concurrency token.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record, assigning its id.
    async fn create(&self, record: BuildRecord) -> anyhow::Result<BuildRecord>;

    async fn get(&self, id: i64) -> anyhow::Result<Option<BuildRecord>>;

    /// Overwrite a record unconditionally.
    async fn update(&self, id: i64, record: BuildRecord) -> anyhow::Result<BuildRecord>;

    /// Overwrite a record only if its stored `updated_at` still equals
    /// `expected`. Returns `None` when another writer got there first.
    async fn compare_and_swap(
        &self,
        id: i64,
        expected: DateTime<Utc>,
        record: BuildRecord,
    ) -> anyhow::Result<Option<BuildRecord>>;

    /// Filtered page of records, newest first.
    async fn list(&self, options: &ListOptions) -> anyhow::Result<Vec<BuildRecord>>;
}

/// In-memory store for tests and offline tooling
pub mod memory;

pub use memory::MemoryStore;
