//! pinedb: an embedded, disk-backed key/value engine.
//!
//! Records are 8-byte signed keys with 50..=112 byte values, stored in a
//! B+Tree of 4096-byte pages per table file. Pages move through a fixed-size
//! buffer pool with recency eviction. `update` is transactional: record-level
//! shared/exclusive locks with deadlock detection, write-ahead logging, and
//! three-pass restart recovery. `insert` and `delete` are structural
//! operations and are not logged.

pub mod btree;
pub mod buffer_manager;
pub mod error;
pub mod file_manager;
pub mod lock_manager;
pub mod log_manager;
pub mod page;
pub mod transaction;

use std::path::Path;
use std::sync::{Arc, Mutex};

pub use crate::error::{DbError, DbResult};
pub use crate::file_manager::TableId;
pub use crate::transaction::TrxId;

use crate::btree::BPlusTree;
use crate::buffer_manager::BufferPool;
use crate::file_manager::FileManager;
use crate::log_manager::LogManager;
use crate::page::MAX_VALUE_SIZE;
use crate::transaction::TrxManager;

/// Printf-style tracing, active only in debug builds with the `debug-logs`
/// feature turned on.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(all(debug_assertions, feature = "debug-logs")) {
            eprintln!("[pinedb] {}", format_args!($($arg)*));
        }
    };
}

pub struct Database {
    files: Arc<Mutex<FileManager>>,
    pool: Arc<BufferPool>,
    log: Arc<LogManager>,
    trx: TrxManager,
}

impl Database {
    const LOG_FILE: &'static str = "pinedb.log";

    /// Open the engine rooted at `home`. The write-ahead log lives at
    /// `home/pinedb.log`; table files go wherever `open_table` is pointed.
    /// The pool never runs with fewer than 4 frames.
    pub fn new(home: &Path, buffer_count: usize) -> DbResult<Self> {
        std::fs::create_dir_all(home)?;
        let files = Arc::new(Mutex::new(FileManager::new()));
        let log = Arc::new(LogManager::open(&home.join(Self::LOG_FILE))?);
        let pool = Arc::new(BufferPool::new(
            Arc::clone(&files),
            Arc::clone(&log),
            buffer_count.max(4),
        ));
        let trx = TrxManager::new(Arc::clone(&log));
        Ok(Self {
            files,
            pool,
            log,
            trx,
        })
    }

    /// Open or create the table file at `path`. Ids are handed out in open
    /// order starting at 1; recovery after a restart requires tables to be
    /// re-opened in the same order as the run that wrote the log.
    pub fn open_table(&self, path: &Path) -> DbResult<TableId> {
        self.files.lock().unwrap().open_table(path)
    }

    /// Replay the write-ahead log against the re-opened tables, then resume
    /// the transaction id counter past everything the log saw. Idempotent.
    pub fn recover(&self) -> DbResult<()> {
        let max_trx = self.log.recover(&self.pool)?;
        self.trx.resume_from(max_trx);
        Ok(())
    }

    pub fn begin(&self) -> DbResult<TrxId> {
        self.trx.begin()
    }

    pub fn commit(&self, trx_id: TrxId) -> DbResult<()> {
        self.trx.commit(trx_id)
    }

    pub fn abort(&self, trx_id: TrxId) -> DbResult<()> {
        self.trx.abort(trx_id, &self.pool)
    }

    /// Insert a new record. Structural only: no log record, no lock.
    pub fn insert(&self, table_id: TableId, key: i64, value: &[u8]) -> DbResult<()> {
        BPlusTree::new(&self.pool, table_id).insert(key, value)
    }

    /// Remove a record, rebalancing the tree as needed. Structural only.
    pub fn delete(&self, table_id: TableId, key: i64) -> DbResult<()> {
        BPlusTree::new(&self.pool, table_id).delete(key)
    }

    /// Read a record under a shared lock. A missing key returns `None`
    /// without taking any lock. Deadlock aborts `trx_id` before returning
    /// the error.
    pub fn find(&self, table_id: TableId, key: i64, trx_id: TrxId) -> DbResult<Option<Vec<u8>>> {
        let tree = BPlusTree::new(&self.pool, table_id);
        let Some(leaf) = tree.find_leaf(key)? else {
            return Ok(None);
        };
        let (pagenum, stamped) = {
            let page = leaf.page();
            let Ok(index) = btree::search_slots(&page, key) else {
                drop(page);
                self.pool.unpin(&leaf, false);
                return Ok(None);
            };
            (leaf.pagenum(), page.slot(index).trx_id)
        };
        // Blocking on the lock while holding the leaf latch would wedge
        // against a holder trying to undo into this page, so release first
        // and re-read after the lock is granted.
        self.pool.unpin(&leaf, false);
        if let Err(err) = self
            .trx
            .lock_for_find(table_id, pagenum, key, trx_id, stamped)
        {
            return Err(self.bail(trx_id, err)?);
        }
        loop {
            let Some(leaf) = tree.find_leaf(key)? else {
                return Ok(None);
            };
            let outcome = {
                let page = leaf.page();
                match btree::search_slots(&page, key) {
                    Ok(index) => {
                        let slot = page.slot(index);
                        // The stamp was read a descent ago; a writer may
                        // have taken implicit ownership in between. The
                        // latch makes this re-read authoritative.
                        match self.foreign_writer(slot.trx_id, trx_id) {
                            Some(writer) => Err(writer),
                            None => Ok(Some(page.value(&slot).to_vec())),
                        }
                    }
                    Err(_) => Ok(None),
                }
            };
            self.pool.unpin(&leaf, false);
            match outcome {
                Ok(value) => return Ok(value),
                Err(writer) => {
                    if let Err(err) = self.trx.wait_for_writer(trx_id, writer) {
                        return Err(self.bail(trx_id, err)?);
                    }
                }
            }
        }
    }

    /// Does this slot stamp name a live transaction other than ours?
    fn foreign_writer(&self, stamped: u32, trx_id: TrxId) -> Option<TrxId> {
        (stamped != 0 && stamped != trx_id && self.trx.is_active(stamped)).then_some(stamped)
    }

    /// Overwrite a record's value in place under an exclusive lock. The new
    /// value must have the stored length. The UPDATE log record is appended
    /// before the page is dirtied; the slot's writer field and the page LSN
    /// are stamped with the result. Deadlock aborts `trx_id` before
    /// returning the error.
    pub fn update(&self, table_id: TableId, key: i64, value: &[u8], trx_id: TrxId) -> DbResult<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(DbError::ValueSize(value.len()));
        }
        let tree = BPlusTree::new(&self.pool, table_id);
        let Some(leaf) = tree.find_leaf(key)? else {
            return Err(DbError::KeyNotFound(key));
        };
        let (pagenum, stamped) = {
            let page = leaf.page();
            let Ok(index) = btree::search_slots(&page, key) else {
                drop(page);
                self.pool.unpin(&leaf, false);
                return Err(DbError::KeyNotFound(key));
            };
            let slot = page.slot(index);
            if slot.size as usize != value.len() {
                drop(page);
                self.pool.unpin(&leaf, false);
                return Err(DbError::ValueSize(value.len()));
            }
            (leaf.pagenum(), slot.trx_id)
        };
        self.pool.unpin(&leaf, false);
        let mut stamped = stamped;
        loop {
            if let Err(err) = self
                .trx
                .lock_for_update(table_id, pagenum, key, trx_id, stamped)
            {
                return Err(self.bail(trx_id, err)?);
            }
            // The record may have migrated during the wait; walk down again.
            // The write decision is re-made against the stamp as it reads
            // under the latch, since an implicit writer may have taken the
            // record between the first descent and the lock grant.
            let Some(leaf) = tree.find_leaf(key)? else {
                return Err(DbError::KeyNotFound(key));
            };
            let blocked_on = {
                let mut page = leaf.page();
                let index = match btree::search_slots(&page, key) {
                    Ok(index) => index,
                    Err(_) => {
                        drop(page);
                        self.pool.unpin(&leaf, false);
                        return Err(DbError::KeyNotFound(key));
                    }
                };
                let slot = page.slot(index);
                match self.foreign_writer(slot.trx_id, trx_id) {
                    Some(writer) => Some(writer),
                    None => {
                        let lsn = self.trx.record_update(
                            trx_id,
                            table_id,
                            leaf.pagenum(),
                            key,
                            slot.offset,
                            page.value(&slot),
                            value,
                        )?;
                        page.write_value(slot.offset, value);
                        page.set_slot_trx(index, trx_id);
                        page.set_page_lsn(lsn);
                        None
                    }
                }
            };
            match blocked_on {
                None => {
                    self.pool.unpin(&leaf, true);
                    debug!("trx {} updated key {} in table {}", trx_id, key, table_id);
                    return Ok(());
                }
                Some(writer) => {
                    self.pool.unpin(&leaf, false);
                    if let Err(err) = self.trx.wait_for_writer(trx_id, writer) {
                        return Err(self.bail(trx_id, err)?);
                    }
                    stamped = writer;
                }
            }
        }
    }

    /// Flush the log and every dirty frame, then sync table files.
    pub fn shutdown(self) -> DbResult<()> {
        self.log.flush()?;
        self.pool.flush_all()?;
        self.files.lock().unwrap().sync_all()
    }

    /// Deadlock already removed the failed request; finish killing the
    /// transaction so its locks release. Other errors pass through.
    fn bail(&self, trx_id: TrxId, err: DbError) -> DbResult<DbError> {
        if matches!(err, DbError::Deadlock(_)) {
            self.trx.abort(trx_id, &self.pool)?;
        }
        Ok(err)
    }
}

#[cfg(test)]
mod database_tests {
    use super::*;
    use tempfile::TempDir;

    fn value(tag: u8) -> Vec<u8> {
        vec![tag; 64]
    }

    #[test]
    fn test_insert_find_update_delete() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path(), 16).unwrap();
        let table = db.open_table(&dir.path().join("t.db")).unwrap();

        db.insert(table, 1, &value(1)).unwrap();
        db.insert(table, 2, &value(2)).unwrap();

        let trx = db.begin().unwrap();
        assert_eq!(db.find(table, 1, trx).unwrap(), Some(value(1)));
        assert_eq!(db.find(table, 99, trx).unwrap(), None);
        db.update(table, 2, &value(9), trx).unwrap();
        assert_eq!(db.find(table, 2, trx).unwrap(), Some(value(9)));
        db.commit(trx).unwrap();

        db.delete(table, 1).unwrap();
        let trx = db.begin().unwrap();
        assert_eq!(db.find(table, 1, trx).unwrap(), None);
        db.commit(trx).unwrap();
        db.shutdown().unwrap();
    }

    #[test]
    fn test_update_rejects_length_change() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path(), 8).unwrap();
        let table = db.open_table(&dir.path().join("t.db")).unwrap();
        db.insert(table, 5, &value(5)).unwrap();
        let trx = db.begin().unwrap();
        assert!(matches!(
            db.update(table, 5, &[1u8; 65], trx),
            Err(DbError::ValueSize(65))
        ));
        db.commit(trx).unwrap();
    }

    #[test]
    fn test_abort_rolls_back_update() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path(), 8).unwrap();
        let table = db.open_table(&dir.path().join("t.db")).unwrap();
        db.insert(table, 7, &value(7)).unwrap();

        let trx = db.begin().unwrap();
        db.update(table, 7, &value(8), trx).unwrap();
        db.abort(trx).unwrap();

        let reader = db.begin().unwrap();
        assert_eq!(db.find(table, 7, reader).unwrap(), Some(value(7)));
        db.commit(reader).unwrap();
    }

    #[test]
    fn test_dead_trx_is_rejected() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path(), 8).unwrap();
        let table = db.open_table(&dir.path().join("t.db")).unwrap();
        db.insert(table, 1, &value(1)).unwrap();
        let trx = db.begin().unwrap();
        db.commit(trx).unwrap();
        assert!(matches!(
            db.find(table, 1, trx),
            Err(DbError::InactiveTransaction(_))
        ));
        assert!(matches!(
            db.update(table, 1, &value(2), trx),
            Err(DbError::InactiveTransaction(_))
        ));
    }
}
