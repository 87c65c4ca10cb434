//! Transaction Coordinator: begin/commit/rollback and checkpoint
//! orchestration, plus the recovery-on-open entry point.
//!
//! A single `write_lock: Mutex<()>` admits at most one writer at a time;
//! opening a database replays any pending WAL records before the first
//! transaction is accepted.

use crate::config::StorageConfig;
use crate::ids::{NodeId, RelId, TableId, TxnKind};
use crate::lists_update_store::{ListsUpdateStore, ListsUpdatesForNodeOffset, ListFileID, RelTableSchema, UpdateInfo};
use crate::pager::PagedFile;
use crate::property::PropertyValue;
use crate::stats::{default_stats_path, RelTableStats, RelsStatisticsCatalog};
use crate::wal::Wal;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    ActiveReadOnly,
    ActiveWrite,
    Committing,
    Committed,
    RollingBack,
    Rolled,
}

/// Owns the write-ahead log, the statistics catalog, and the
/// single-writer lock; at most one `WriteTransaction` exists at a time
/// for a given `Database`.
pub struct Database {
    cfg: StorageConfig,
    dir: PathBuf,
    wal: Wal,
    stats: Mutex<RelsStatisticsCatalog>,
    write_lock: Mutex<()>,
    schemas: HashMap<TableId, RelTableSchema>,
}

impl Database {
    /// Opens (creating if absent) the database directory, then runs
    /// recovery before any transaction is accepted.
    pub fn open(
        dir: impl AsRef<Path>,
        cfg: StorageConfig,
        schemas: HashMap<TableId, RelTableSchema>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let wal = Wal::open(dir.join("wal"), cfg)?;
        let stats = RelsStatisticsCatalog::open(default_stats_path(&dir))?;

        let db = Self {
            cfg,
            dir,
            wal,
            stats: Mutex::new(stats),
            write_lock: Mutex::new(()),
            schemas,
        };
        db.checkpoint()?;
        Ok(db)
    }

    pub fn begin_read(&self) -> ReadTransaction<'_> {
        ReadTransaction { db: self }
    }

    pub fn begin_write(&self) -> Result<WriteTransaction<'_>> {
        let guard = self
            .write_lock
            .try_lock()
            .map_err(|_| Error::Logic("a write transaction is already active"))?;
        Ok(WriteTransaction {
            db: self,
            _guard: guard,
            state: TxnState::ActiveWrite,
            lists: ListsUpdateStore::new(self.cfg, self.schemas.clone()),
        })
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    /// Applies every committed WAL page-update record to the "original"
    /// page store, swaps the statistics catalog's write snapshot into
    /// `read_only`, and clears the WAL. Safe to call when the WAL has
    /// nothing pending: `Wal::recover` is then a no-op past truncation.
    pub fn checkpoint(&self) -> Result<()> {
        let mut originals = PagedFile::create_or_open(self.dir.join("data.original"), self.cfg.page_size)?;
        self.wal.recover(&mut originals)?;
        self.stats
            .lock()
            .map_err(|_| Error::Logic("stats mutex poisoned"))?
            .checkpoint(default_stats_path(&self.dir))?;
        Ok(())
    }
}

/// A read-only view bound to the catalog's `read_only` snapshot; it never
/// observes an in-flight writer's changes, by construction (readers only
/// ever read `read_only`, which a writer cannot touch).
pub struct ReadTransaction<'a> {
    db: &'a Database,
}

impl<'a> ReadTransaction<'a> {
    pub fn get_next_rel_offset(&self, table_id: TableId) -> Result<u64> {
        self.db
            .stats
            .lock()
            .map_err(|_| Error::Logic("stats mutex poisoned"))?
            .get_next_rel_offset(TxnKind::ReadOnly, table_id)
    }

    pub fn get_rel_statistics(&self, table_id: TableId) -> Result<RelTableStats> {
        Ok(self
            .db
            .stats
            .lock()
            .map_err(|_| Error::Logic("stats mutex poisoned"))?
            .get_rel_statistics(table_id)?
            .clone())
    }
}

/// The single active writer. Owns its own `ListsUpdateStore`; commit and
/// rollback each consume `self` so a transaction cannot be reused past
/// its terminal state.
pub struct WriteTransaction<'a> {
    db: &'a Database,
    _guard: MutexGuard<'a, ()>,
    state: TxnState,
    lists: ListsUpdateStore,
}

impl<'a> WriteTransaction<'a> {
    fn ensure_active(&self) -> Result<()> {
        if self.state != TxnState::ActiveWrite {
            return Err(Error::Logic("transaction is not active"));
        }
        Ok(())
    }

    pub fn insert_rel(
        &mut self,
        src: NodeId,
        dst: NodeId,
        rel_id: RelId,
        rel_table: TableId,
        properties: Vec<PropertyValue>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.lists.insert_rel(src, dst, rel_id, rel_table, properties)?;
        let mut stats = self
            .db
            .stats
            .lock()
            .map_err(|_| Error::Logic("stats mutex poisoned"))?;
        stats.increase_next_rel_offset(rel_table, 1)?;
        stats.update_num_rels_by_value(rel_table, 1)
    }

    pub fn delete_rel(&mut self, src: NodeId, dst: NodeId, rel_id: RelId, rel_table: TableId) -> Result<()> {
        self.ensure_active()?;
        self.lists.delete_rel(src, dst, rel_id, rel_table)?;
        self.db
            .stats
            .lock()
            .map_err(|_| Error::Logic("stats mutex poisoned"))?
            .update_num_rels_by_value(rel_table, -1)
    }

    pub fn update_rel(&mut self, src: NodeId, dst: NodeId, info: UpdateInfo) -> Result<()> {
        self.ensure_active()?;
        self.lists.update_rel(src, dst, info)
    }

    pub fn init_newly_added_node(&mut self, node: NodeId) -> Result<()> {
        self.ensure_active()?;
        self.lists.init_newly_added_node(node);
        Ok(())
    }

    pub fn lists_update_store(&self) -> &ListsUpdateStore {
        &self.lists
    }

    pub fn get_updates_for_node(
        &self,
        list_file_id: &ListFileID,
        node_offset: u64,
    ) -> Option<&ListsUpdatesForNodeOffset> {
        self.lists.get(list_file_id.direction(), list_file_id.rel_table(), node_offset)
    }

    /// Direct access to the WAL for staging page-level shadow records;
    /// translating this transaction's list-store edits into concrete
    /// page records is the buffer manager's job (out of scope here), so
    /// callers that own that translation log through this handle before
    /// calling `commit`.
    pub fn wal(&self) -> &Wal {
        self.db.wal()
    }

    /// Commit protocol: log a commit record, flush, then checkpoint —
    /// apply WAL shadow pages, swap stats snapshots, clear the WAL.
    /// After this returns, readers may observe the new state.
    pub fn commit(mut self, txn_id: u64) -> Result<()> {
        self.ensure_active()?;
        self.state = TxnState::Committing;
        self.db.wal.log_commit(txn_id)?;
        self.db.wal.flush_all_pages()?;
        self.db.checkpoint()?;
        self.state = TxnState::Committed;
        Ok(())
    }

    /// Discards staged list-store state, drops any (uncommitted, hence
    /// unflushed) WAL records, and reverts the statistics write snapshot.
    /// Original files are never touched.
    pub fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = TxnState::RollingBack;
        self.lists.clear();
        self.db.wal.clear_wal()?;
        self.db
            .stats
            .lock()
            .map_err(|_| Error::Logic("stats mutex poisoned"))?
            .rollback();
        self.state = TxnState::Rolled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn schemas() -> HashMap<TableId, RelTableSchema> {
        let mut m = HashMap::new();
        m.insert(TableId::new(0), RelTableSchema::new(TableId::new(1), TableId::new(1), 1));
        m
    }

    #[test]
    fn insert_then_rollback_leaves_store_empty() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), StorageConfig::default(), schemas()).unwrap();
        let mut txn = db.begin_write().unwrap();
        for rel_id in 0..10 {
            txn.insert_rel(
                NodeId::new(TableId::new(1), 1),
                NodeId::new(TableId::new(1), 2),
                rel_id,
                TableId::new(0),
                vec![PropertyValue::Int(rel_id)],
            )
            .unwrap();
        }
        assert!(txn.lists_update_store().has_updates());
        txn.rollback().unwrap();

        let txn2 = db.begin_write().unwrap();
        assert!(!txn2.lists_update_store().has_updates());
    }

    #[test]
    fn insert_then_commit_is_visible_in_stats() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), StorageConfig::default(), schemas()).unwrap();
        let mut txn = db.begin_write().unwrap();
        for rel_id in 0..10 {
            txn.insert_rel(
                NodeId::new(TableId::new(1), 1),
                NodeId::new(TableId::new(1), 2),
                rel_id,
                TableId::new(0),
                vec![PropertyValue::Int(rel_id)],
            )
            .unwrap();
        }
        txn.commit(1).unwrap();

        let reader = db.begin_read();
        let stats = reader.get_rel_statistics(TableId::new(0)).unwrap();
        assert_eq!(stats.num_rels, 10);
    }

    #[test]
    fn only_one_write_transaction_may_be_active() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), StorageConfig::default(), schemas()).unwrap();
        let _txn = db.begin_write().unwrap();
        assert!(db.begin_write().is_err());
    }

    #[test]
    fn delete_staged_insert_within_one_txn_cancels_out() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), StorageConfig::default(), schemas()).unwrap();
        let mut txn = db.begin_write().unwrap();
        let src = NodeId::new(TableId::new(1), 1);
        let dst = NodeId::new(TableId::new(1), 2);
        txn.insert_rel(src, dst, 42, TableId::new(0), vec![PropertyValue::Int(1)])
            .unwrap();
        txn.delete_rel(src, dst, 42, TableId::new(0)).unwrap();

        let fwd = ListFileID::AdjList {
            rel_table: TableId::new(0),
            direction: crate::ids::Direction::Fwd,
        };
        assert!(!txn.lists_update_store().is_rel_deleted_in_persistent_store(&fwd, 1, 42));
        assert_eq!(txn.lists_update_store().num_inserted_rels_for_node(&fwd, 1), 0);
        txn.commit(2).unwrap();
    }

    #[test]
    fn reopening_after_clean_shutdown_preserves_stats() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path(), StorageConfig::default(), schemas()).unwrap();
            let mut txn = db.begin_write().unwrap();
            txn.insert_rel(
                NodeId::new(TableId::new(1), 1),
                NodeId::new(TableId::new(1), 2),
                1,
                TableId::new(0),
                vec![PropertyValue::Int(1)],
            )
            .unwrap();
            txn.commit(1).unwrap();
        }
        let db2 = Database::open(dir.path(), StorageConfig::default(), schemas()).unwrap();
        let reader = db2.begin_read();
        assert_eq!(reader.get_rel_statistics(TableId::new(0)).unwrap().num_rels, 1);
    }
}
