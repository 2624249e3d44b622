//! In-memory record store.

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::{BuildRecord, ListOptions};
use crate::store::RecordStore;

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

struct Inner {
    next_id: i64,
    records: BTreeMap<i64, BuildRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: 1,
                records: BTreeMap::new(),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create(&self, mut record: BuildRecord) -> anyhow::Result<BuildRecord> {
        let mut inner = self.inner.write().await;
        record.id = inner.next_id;
        inner.next_id += 1;
        inner.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<BuildRecord>> {
        Ok(self.inner.read().await.records.get(&id).cloned())
    }

    async fn update(&self, id: i64, mut record: BuildRecord) -> anyhow::Result<BuildRecord> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("record {id} does not exist"))?;
        record.id = id;
        *slot = record.clone();
        Ok(record)
    }

    async fn compare_and_swap(
        &self,
        id: i64,
        expected: DateTime<Utc>,
        mut record: BuildRecord,
    ) -> anyhow::Result<Option<BuildRecord>> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("record {id} does not exist"))?;
        if slot.meta.updated_at != expected {
            return Ok(None);
        }
        record.id = id;
        *slot = record.clone();
        Ok(Some(record))
    }

    async fn list(&self, options: &ListOptions) -> anyhow::Result<Vec<BuildRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .rev()
            .filter(|r| options.hotfix.is_none_or(|h| r.spec.is_hotfix == h))
            .filter(|r| {
                options
                    .created_by
                    .as_deref()
                    .is_none_or(|u| r.meta.created_by == u)
            })
            .skip(options.offset)
            .take(options.size)
            .cloned()
            .collect())
    }
}
