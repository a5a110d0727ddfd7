//! Transaction table, strict two-phase locking, and pre-image undo.
//!
//! The transaction table, lock table, and wait-for graph all live behind one
//! mutex; blocked lock requests wait on a single condvar that atomically
//! releases it. Every waiter re-checks its own conflicts on wakeup, so a
//! release lets through the next exclusive waiter or a contiguous run of
//! shared ones.
//!
//! A write does not always materialize a lock node: a record whose slot is
//! stamped with the writer's id while no explicit lock exists on it is
//! implicitly locked. Later requests discover the stamp and first promote it
//! to a real exclusive lock on the writer's behalf before queueing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::buffer_manager::BufferPool;
use crate::error::{DbError, DbResult};
use crate::file_manager::TableId;
use crate::lock_manager::{LockId, LockMode, LockTable};
use crate::log_manager::{LogBody, LogManager, Lsn, UpdateImage};
use crate::page::PageNum;

pub type TrxId = u32;

/// How a write ended up protected.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteLock {
    /// A lock node sits in the queue.
    Explicit,
    /// No node: the slot stamp alone marks the record as write-held by
    /// this transaction.
    Implicit,
}

struct UndoRecord {
    table_id: TableId,
    pagenum: PageNum,
    offset: u16,
    image: Vec<u8>,
    /// prev-LSN of the logged update this pre-image undoes; becomes the
    /// compensation record's next-undo pointer.
    next_undo: Lsn,
}

struct TrxEntry {
    locks: Vec<LockId>,
    undo: Vec<UndoRecord>,
    undo_seen: HashSet<(TableId, PageNum, i64)>,
    last_lsn: Lsn,
}

impl TrxEntry {
    fn new(last_lsn: Lsn) -> Self {
        Self {
            locks: Vec::new(),
            undo: Vec::new(),
            undo_seen: HashSet::new(),
            last_lsn,
        }
    }
}

struct TrxState {
    locks: LockTable,
    trxs: HashMap<TrxId, TrxEntry>,
    next_id: TrxId,
}

pub struct TrxManager {
    state: Mutex<TrxState>,
    cond: Condvar,
    log: Arc<LogManager>,
}

impl TrxManager {
    pub fn new(log: Arc<LogManager>) -> Self {
        Self {
            state: Mutex::new(TrxState {
                locks: LockTable::new(),
                trxs: HashMap::new(),
                next_id: 1,
            }),
            cond: Condvar::new(),
            log,
        }
    }

    /// Bump the id counter past everything a recovered log has seen.
    pub fn resume_from(&self, max_trx: TrxId) {
        let mut state = self.state.lock().unwrap();
        if state.next_id <= max_trx {
            state.next_id = max_trx + 1;
        }
    }

    pub fn is_active(&self, trx_id: TrxId) -> bool {
        self.state.lock().unwrap().trxs.contains_key(&trx_id)
    }

    pub fn begin(&self) -> DbResult<TrxId> {
        let mut state = self.state.lock().unwrap();
        let trx_id = state.next_id;
        state.next_id += 1;
        let lsn = self.log.append(trx_id, 0, LogBody::Begin)?;
        state.trxs.insert(trx_id, TrxEntry::new(lsn));
        Ok(trx_id)
    }

    pub fn commit(&self, trx_id: TrxId) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .trxs
            .remove(&trx_id)
            .ok_or(DbError::InactiveTransaction(trx_id))?;
        self.log.append(trx_id, entry.last_lsn, LogBody::Commit)?;
        self.log.flush()?;
        for lock in entry.locks {
            state.locks.remove(lock);
        }
        state.locks.clear_edges(trx_id);
        self.cond.notify_all();
        Ok(())
    }

    /// Roll back: restore pre-images newest first, each behind a
    /// compensation record, then terminate the chain with ROLLBACK and
    /// release every lock.
    pub fn abort(&self, trx_id: TrxId, pool: &BufferPool) -> DbResult<()> {
        let (undo, mut last_lsn) = {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .trxs
                .get_mut(&trx_id)
                .ok_or(DbError::InactiveTransaction(trx_id))?;
            entry.undo_seen.clear();
            (std::mem::take(&mut entry.undo), entry.last_lsn)
        };

        for undo_record in undo.iter().rev() {
            let handle = pool.fetch(undo_record.table_id, undo_record.pagenum)?;
            {
                let mut page = handle.page();
                let current = page
                    .read_bytes(undo_record.offset as usize, undo_record.image.len())
                    .to_vec();
                let clr_lsn = self.log.append(
                    trx_id,
                    last_lsn,
                    LogBody::Compensate(
                        UpdateImage {
                            table_id: undo_record.table_id,
                            pagenum: undo_record.pagenum,
                            offset: undo_record.offset,
                            old: current,
                            new: undo_record.image.clone(),
                        },
                        undo_record.next_undo,
                    ),
                )?;
                page.write_bytes(undo_record.offset as usize, &undo_record.image);
                page.set_page_lsn(clr_lsn);
                last_lsn = clr_lsn;
            }
            pool.unpin(&handle, true);
        }

        self.log.append(trx_id, last_lsn, LogBody::Rollback)?;
        self.log.flush()?;

        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.trxs.remove(&trx_id) {
            for lock in entry.locks {
                state.locks.remove(lock);
            }
        }
        state.locks.clear_edges(trx_id);
        self.cond.notify_all();
        Ok(())
    }

    /// Take a shared lock on a record before reading it. `stamped_writer` is
    /// the slot's last-writer field, used for implicit-to-explicit
    /// promotion.
    pub fn lock_for_find(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        key: i64,
        trx_id: TrxId,
        stamped_writer: u32,
    ) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.trxs.contains_key(&trx_id) {
            return Err(DbError::InactiveTransaction(trx_id));
        }
        if state
            .locks
            .covered(table_id, pagenum, key, trx_id, LockMode::Shared)
        {
            return Ok(());
        }
        promote_implicit(&mut state, table_id, pagenum, key, trx_id, stamped_writer);
        self.acquire_locked(state, table_id, pagenum, key, trx_id, LockMode::Shared)
    }

    /// Take write ownership of a record. Returns [`WriteLock::Implicit`]
    /// when no explicit lock exists anywhere on the record, in which case
    /// the caller's slot stamp is the lock.
    pub fn lock_for_update(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        key: i64,
        trx_id: TrxId,
        stamped_writer: u32,
    ) -> DbResult<WriteLock> {
        let mut state = self.state.lock().unwrap();
        if !state.trxs.contains_key(&trx_id) {
            return Err(DbError::InactiveTransaction(trx_id));
        }
        if state
            .locks
            .covered(table_id, pagenum, key, trx_id, LockMode::Exclusive)
        {
            return Ok(WriteLock::Explicit);
        }
        promote_implicit(&mut state, table_id, pagenum, key, trx_id, stamped_writer);
        if !state.locks.any_lock_on_record(table_id, pagenum, key) {
            return Ok(WriteLock::Implicit);
        }
        self.acquire_locked(state, table_id, pagenum, key, trx_id, LockMode::Exclusive)?;
        Ok(WriteLock::Explicit)
    }

    /// Block until `writer` finishes. Used when a slot's writer stamp turns
    /// out, under the page latch, to name a transaction that slipped an
    /// implicit write in before this one's lock was decided: the stamp is a
    /// lock that predates ours, so under strict two-phase locking waiting
    /// for the transaction to end is waiting for the lock. The wait is a
    /// real edge in the wait-for graph and can lose a deadlock.
    pub fn wait_for_writer(&self, trx_id: TrxId, writer: TrxId) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.trxs.contains_key(&trx_id) {
                return Err(DbError::InactiveTransaction(trx_id));
            }
            if !state.trxs.contains_key(&writer) {
                state.locks.clear_edges(trx_id);
                return Ok(());
            }
            state.locks.set_edges(trx_id, &[writer]);
            if state.locks.wait_cycle(trx_id) {
                state.locks.clear_edges(trx_id);
                return Err(DbError::Deadlock(trx_id));
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Queue a lock request and block until it is conflict-free. A request
    /// that would close a wait cycle fails with `Deadlock` instead; the
    /// requester is always the victim.
    fn acquire_locked(
        &self,
        mut state: MutexGuard<'_, TrxState>,
        table_id: TableId,
        pagenum: PageNum,
        key: i64,
        trx_id: TrxId,
        mode: LockMode,
    ) -> DbResult<()> {
        let lock_id = state.locks.insert(table_id, pagenum, key, trx_id, mode);
        if let Some(entry) = state.trxs.get_mut(&trx_id) {
            entry.locks.push(lock_id);
        }
        loop {
            let holders = state.locks.conflicts(lock_id);
            if holders.is_empty() {
                state.locks.clear_edges(trx_id);
                return Ok(());
            }
            state.locks.set_edges(trx_id, &holders);
            if state.locks.wait_cycle(trx_id) {
                state.locks.remove(lock_id);
                state.locks.clear_edges(trx_id);
                if let Some(entry) = state.trxs.get_mut(&trx_id) {
                    entry.locks.retain(|l| *l != lock_id);
                }
                return Err(DbError::Deadlock(trx_id));
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Log one record write and remember its pre-image (first write to a
    /// record wins). Returns the LSN to stamp on the page.
    pub fn record_update(
        &self,
        trx_id: TrxId,
        table_id: TableId,
        pagenum: PageNum,
        key: i64,
        offset: u16,
        old: &[u8],
        new: &[u8],
    ) -> DbResult<Lsn> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .trxs
            .get_mut(&trx_id)
            .ok_or(DbError::InactiveTransaction(trx_id))?;
        let prev_lsn = entry.last_lsn;
        let lsn = self.log.append(
            trx_id,
            prev_lsn,
            LogBody::Update(UpdateImage {
                table_id,
                pagenum,
                offset,
                old: old.to_vec(),
                new: new.to_vec(),
            }),
        )?;
        entry.last_lsn = lsn;
        if entry.undo_seen.insert((table_id, pagenum, key)) {
            entry.undo.push(UndoRecord {
                table_id,
                pagenum,
                offset,
                image: old.to_vec(),
                next_undo: prev_lsn,
            });
        }
        Ok(lsn)
    }
}

/// If the record's stamped last writer is still in flight and holds no
/// explicit lock on the record, materialize an exclusive lock on its behalf
/// so the requester queues behind it.
fn promote_implicit(
    state: &mut TrxState,
    table_id: TableId,
    pagenum: PageNum,
    key: i64,
    requester: TrxId,
    stamped_writer: u32,
) {
    if stamped_writer == 0 || stamped_writer == requester {
        return;
    }
    if !state.trxs.contains_key(&stamped_writer) {
        return;
    }
    if state.locks.any_lock_on_record(table_id, pagenum, key) {
        return;
    }
    let lock_id = state
        .locks
        .insert(table_id, pagenum, key, stamped_writer, LockMode::Exclusive);
    if let Some(entry) = state.trxs.get_mut(&stamped_writer) {
        entry.locks.push(lock_id);
    }
}
