//! In-memory catalog store.
//!
//! DashMap-backed [`LocalStore`] used by the standalone binary and the test
//! suites. A production deployment would put the relational catalog behind
//! the same port.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::domain::model::{CatalogRecord, EntityType, LookupKey};
use crate::domain::ports::LocalStore;
use crate::error::Result;

/// Thread-safe in-memory store keyed by `(entity, normalized key)`.
#[derive(Default)]
pub struct InMemoryStore {
    rows: DashMap<(EntityType, String), CatalogRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn find_by_key(&self, key: &LookupKey) -> Result<Option<CatalogRecord>> {
        let row = self
            .rows
            .get(&(key.entity(), key.identifier().to_string()))
            .map(|r| r.clone());
        Ok(row)
    }

    async fn upsert_if_absent(&self, record: CatalogRecord) -> Result<CatalogRecord> {
        let map_key = (record.entity, record.key.clone());
        // entry() makes lose-the-race callers observe the winner's row
        let stored = self.rows.entry(map_key).or_insert_with(|| {
            debug!(entity = %record.entity, key = %record.key, "stored catalog record");
            record
        });
        Ok(stored.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(isbn: &str) -> LookupKey {
        LookupKey::new(EntityType::Book, isbn).unwrap()
    }

    #[tokio::test]
    async fn test_find_miss_returns_none() {
        let store = InMemoryStore::new();
        let found = store.find_by_key(&key("9780134685991")).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_upsert_then_find() {
        let store = InMemoryStore::new();
        let k = key("9780134685991");
        let record = CatalogRecord::new(&k, "Effective Java");

        store.upsert_if_absent(record.clone()).await.unwrap();

        let found = store.find_by_key(&k).await.unwrap().unwrap();
        assert_eq!(found.display_name, "Effective Java");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_if_absent_keeps_first_row() {
        let store = InMemoryStore::new();
        let k = key("9780134685991");

        let first = CatalogRecord::new(&k, "Effective Java");
        let second = CatalogRecord::new(&k, "Effective Java (dup)");

        store.upsert_if_absent(first).await.unwrap();
        let stored = store.upsert_if_absent(second).await.unwrap();

        // The losing writer gets the existing row back
        assert_eq!(stored.display_name, "Effective Java");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_entities_do_not_collide() {
        let store = InMemoryStore::new();
        let author = LookupKey::new(EntityType::Author, "penguin").unwrap();
        let publisher = LookupKey::new(EntityType::Publisher, "penguin").unwrap();

        store
            .upsert_if_absent(CatalogRecord::new(&author, "Penguin (author)"))
            .await
            .unwrap();

        assert!(store.find_by_key(&publisher).await.unwrap().is_none());
        assert!(store.find_by_key(&author).await.unwrap().is_some());
    }
}
