//! StatsStore: redb-backed history of statistics snapshots.
//!
//! Snapshots are JSON-serialized into a single table keyed by their epoch
//! in milliseconds. Both on-disk and in-memory backends are supported.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use crate::aggregator::PlbStatistics;
use crate::error::{StatsError, StatsResult};

/// Statistics snapshots keyed by epoch milliseconds.
const STATISTICS: TableDefinition<u64, &[u8]> = TableDefinition::new("plb_statistics");

/// Convert any `Display` error into a `StatsError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StatsError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct StatsStore {
    db: Arc<Database>,
}

impl StatsStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StatsResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "statistics store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> StatsResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StatsResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(STATISTICS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Store a snapshot. A snapshot with the same epoch is replaced.
    pub fn put(&self, stats: &PlbStatistics) -> StatsResult<()> {
        let value = serde_json::to_vec(stats).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STATISTICS).map_err(map_err!(Table))?;
            table
                .insert(stats.epoch_ms, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(epoch_ms = stats.epoch_ms, "statistics snapshot stored");
        Ok(())
    }

    pub fn latest(&self) -> StatsResult<Option<PlbStatistics>> {
        Ok(self.history(1)?.pop())
    }

    /// Up to `limit` snapshots, newest first.
    pub fn history(&self, limit: usize) -> StatsResult<Vec<PlbStatistics>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATISTICS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let stats: PlbStatistics = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(stats);
        }
        Ok(results)
    }

    pub fn len(&self) -> StatsResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATISTICS).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    pub fn is_empty(&self) -> StatsResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Delete all but the newest `keep` snapshots. Returns how many were removed.
    pub fn prune(&self, keep: usize) -> StatsResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(STATISTICS).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))?.rev().skip(keep) {
                let (key, _) = entry.map_err(map_err!(Read))?;
                stale.push(key.value());
            }
            for key in &stale {
                table.remove(*key).map_err(map_err!(Write))?;
            }
            removed = stale.len() as u64;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if removed > 0 {
            debug!(removed, keep, "statistics history pruned");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(epoch_ms: u64, refreshes: u64) -> PlbStatistics {
        PlbStatistics {
            epoch_ms,
            refreshes,
            ..Default::default()
        }
    }

    #[test]
    fn history_is_newest_first() {
        let store = StatsStore::open_in_memory().unwrap();
        assert!(store.is_empty().unwrap());
        assert!(store.latest().unwrap().is_none());
        for (epoch, refreshes) in [(100, 1), (300, 3), (200, 2)] {
            store.put(&stats(epoch, refreshes)).unwrap();
        }
        let history = store.history(10).unwrap();
        let epochs: Vec<u64> = history.iter().map(|s| s.epoch_ms).collect();
        assert_eq!(epochs, vec![300, 200, 100]);
        assert_eq!(store.latest().unwrap().unwrap().refreshes, 3);
        assert_eq!(store.history(2).unwrap().len(), 2);
    }

    #[test]
    fn same_epoch_replaces() {
        let store = StatsStore::open_in_memory().unwrap();
        store.put(&stats(100, 1)).unwrap();
        store.put(&stats(100, 5)).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.latest().unwrap().unwrap().refreshes, 5);
    }

    #[test]
    fn prune_keeps_newest() {
        let store = StatsStore::open_in_memory().unwrap();
        for epoch in 1..=5 {
            store.put(&stats(epoch, epoch)).unwrap();
        }
        assert_eq!(store.prune(2).unwrap(), 3);
        let epochs: Vec<u64> = store.history(10).unwrap().iter().map(|s| s.epoch_ms).collect();
        assert_eq!(epochs, vec![5, 4]);
        assert_eq!(store.prune(2).unwrap(), 0);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.redb");
        {
            let store = StatsStore::open(&path).unwrap();
            store.put(&stats(42, 7)).unwrap();
        }
        let store = StatsStore::open(&path).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().refreshes, 7);
    }
}
