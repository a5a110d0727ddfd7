//! Buffer pool: a fixed arena of page frames with recency-ordered eviction.
//!
//! Bookkeeping (page map, pin counts, recency links) lives under one
//! pool-wide mutex; page contents live under a per-frame latch. No I/O ever
//! happens while the pool-wide mutex is held. The recency list is threaded
//! through the frame arena as explicit prev/next indices, most recent at the
//! head; eviction takes the coldest unpinned frame from the tail and follows
//! the write-ahead rule: log first, then the page.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::debug;
use crate::error::DbResult;
use crate::file_manager::{FileManager, TableId};
use crate::log_manager::LogManager;
use crate::page::{Page, PageNum};

pub struct Frame {
    page: Mutex<Page>,
}

struct FrameMeta {
    table_id: TableId,
    pagenum: PageNum,
    pins: u32,
    dirty: bool,
    valid: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

impl FrameMeta {
    fn empty() -> Self {
        Self {
            table_id: 0,
            pagenum: 0,
            pins: 0,
            dirty: false,
            valid: false,
            prev: None,
            next: None,
        }
    }
}

struct PoolState {
    metas: Vec<FrameMeta>,
    map: HashMap<(TableId, PageNum), usize>,
    head: Option<usize>,
    tail: Option<usize>,
    /// Frames that have never held a page.
    unused: Vec<usize>,
}

impl PoolState {
    fn detach(&mut self, index: usize) {
        let prev = self.metas[index].prev;
        let next = self.metas[index].next;
        match prev {
            Some(p) => self.metas[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.metas[n].prev = prev,
            None => self.tail = prev,
        }
        self.metas[index].prev = None;
        self.metas[index].next = None;
    }

    fn push_head(&mut self, index: usize) {
        self.metas[index].prev = None;
        self.metas[index].next = self.head;
        if let Some(h) = self.head {
            self.metas[h].prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn push_tail(&mut self, index: usize) {
        self.metas[index].next = None;
        self.metas[index].prev = self.tail;
        if let Some(t) = self.tail {
            self.metas[t].next = Some(index);
        }
        self.tail = Some(index);
        if self.head.is_none() {
            self.head = Some(index);
        }
    }

    fn move_to_head(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.detach(index);
        self.push_head(index);
    }

    fn demote_to_tail(&mut self, index: usize) {
        if self.tail == Some(index) {
            return;
        }
        self.detach(index);
        self.push_tail(index);
    }
}

/// A pinned frame. The pin keeps the frame out of eviction; `page()` takes
/// the frame latch for actual access. Callers hand the pin back through
/// [`BufferPool::unpin`].
pub struct FrameHandle {
    index: usize,
    frame: Arc<Frame>,
    table_id: TableId,
    pagenum: PageNum,
}

impl FrameHandle {
    pub fn page(&self) -> MutexGuard<'_, Page> {
        self.frame.page.lock().unwrap()
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn pagenum(&self) -> PageNum {
        self.pagenum
    }
}

pub struct BufferPool {
    frames: Vec<Arc<Frame>>,
    state: Mutex<PoolState>,
    available: Condvar,
    files: Arc<Mutex<FileManager>>,
    log: Arc<LogManager>,
}

impl BufferPool {
    pub fn new(files: Arc<Mutex<FileManager>>, log: Arc<LogManager>, capacity: usize) -> Self {
        let frames = (0..capacity)
            .map(|_| {
                Arc::new(Frame {
                    page: Mutex::new(Page::new()),
                })
            })
            .collect();
        let metas = (0..capacity).map(|_| FrameMeta::empty()).collect();
        Self {
            frames,
            state: Mutex::new(PoolState {
                metas,
                map: HashMap::new(),
                head: None,
                tail: None,
                unused: (0..capacity).rev().collect(),
            }),
            available: Condvar::new(),
            files,
            log,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Pin the frame holding `(table_id, pagenum)`, reading the page in (and
    /// evicting the coldest unpinned frame) on a miss. Blocks while every
    /// frame is pinned.
    pub fn fetch(&self, table_id: TableId, pagenum: PageNum) -> DbResult<FrameHandle> {
        let key = (table_id, pagenum);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(&index) = state.map.get(&key) {
                state.metas[index].pins += 1;
                state.move_to_head(index);
                drop(state);
                return Ok(self.handle(index, table_id, pagenum));
            }

            let (index, mut page, victim) = if let Some(index) = state.unused.pop() {
                // Fresh frame, unreachable by anyone else: the latch is free.
                let page = self.frames[index].page.lock().unwrap();
                (index, page, None)
            } else if let Some((index, page)) = self.find_victim(&state) {
                let meta = &state.metas[index];
                let victim = meta
                    .dirty
                    .then_some((meta.table_id, meta.pagenum));
                let old_key = (meta.table_id, meta.pagenum);
                debug!("evicting page {:?} for {:?}", old_key, key);
                state.map.remove(&old_key);
                state.detach(index);
                (index, page, victim)
            } else {
                state = self.available.wait(state).unwrap();
                continue;
            };

            {
                let meta = &mut state.metas[index];
                meta.table_id = table_id;
                meta.pagenum = pagenum;
                meta.pins = 1;
                meta.dirty = false;
                meta.valid = true;
            }
            state.map.insert(key, index);
            state.push_head(index);
            drop(state);

            // The frame latch is held across the I/O, so a concurrent hit on
            // the new mapping parks on the latch until the page is in.
            let io = (|| -> DbResult<()> {
                if let Some((old_table, old_page)) = victim {
                    self.log.flush()?;
                    self.files
                        .lock()
                        .unwrap()
                        .write_page(old_table, old_page, &page)?;
                }
                self.files
                    .lock()
                    .unwrap()
                    .read_page(table_id, pagenum, &mut page)
            })();
            drop(page);

            if let Err(err) = io {
                // A map hit may have pinned the frame while the latch was
                // held across the I/O; give back only our own pin and let
                // the last pinner's unpin free the frame the normal way.
                let mut state = self.state.lock().unwrap();
                let meta = &mut state.metas[index];
                meta.pins -= 1;
                meta.dirty = false;
                if meta.pins == 0 {
                    meta.valid = false;
                    state.map.remove(&key);
                    state.detach(index);
                    state.unused.push(index);
                }
                self.available.notify_all();
                return Err(err);
            }
            return Ok(self.handle(index, table_id, pagenum));
        }
    }

    fn handle(&self, index: usize, table_id: TableId, pagenum: PageNum) -> FrameHandle {
        FrameHandle {
            index,
            frame: Arc::clone(&self.frames[index]),
            table_id,
            pagenum,
        }
    }

    /// Walk from the recency tail toward the head for an unpinned frame
    /// whose latch can be taken without blocking.
    fn find_victim<'a>(&'a self, state: &PoolState) -> Option<(usize, MutexGuard<'a, Page>)> {
        let mut cursor = state.tail;
        while let Some(index) = cursor {
            if state.metas[index].pins == 0 {
                if let Ok(page) = self.frames[index].page.try_lock() {
                    return Some((index, page));
                }
            }
            cursor = state.metas[index].prev;
        }
        None
    }

    pub fn unpin(&self, handle: &FrameHandle, dirty: bool) {
        let mut state = self.state.lock().unwrap();
        let meta = &mut state.metas[handle.index];
        debug_assert!(meta.pins > 0);
        meta.dirty |= dirty;
        meta.pins -= 1;
        if meta.pins == 0 {
            self.available.notify_all();
        }
    }

    /// Unpin a frame whose page just went back to the free list: mark it
    /// dirty and park it at the recency tail, first in line for eviction.
    fn unpin_discard(&self, handle: &FrameHandle) {
        let mut state = self.state.lock().unwrap();
        let meta = &mut state.metas[handle.index];
        debug_assert!(meta.pins > 0);
        meta.dirty = true;
        meta.pins -= 1;
        let free = meta.pins == 0;
        state.demote_to_tail(handle.index);
        if free {
            self.available.notify_all();
        }
    }

    /// Pop a page off the table's free list, doubling the file when the list
    /// is empty. The returned frame is pinned, zeroed, and dirty-on-unpin is
    /// the caller's responsibility.
    pub fn alloc_page(&self, table_id: TableId) -> DbResult<(PageNum, FrameHandle)> {
        let header = self.fetch(table_id, 0)?;
        let result = (|| {
            // Header mutations are staged and applied only after the last
            // fallible step, so a failed allocation leaves the header frame
            // clean and the free list untouched.
            let (pagenum, grown) = {
                let hp = header.page();
                let head = hp.free_list_head();
                if head == 0 {
                    let current = hp.num_pages();
                    self.files
                        .lock()
                        .unwrap()
                        .extend(table_id, current, current)?;
                    (current, Some(2 * current))
                } else {
                    (head, None)
                }
            };
            let frame = self.fetch(table_id, pagenum)?;
            {
                let mut hp = header.page();
                let mut fp = frame.page();
                if let Some(num_pages) = grown {
                    hp.set_num_pages(num_pages);
                }
                hp.set_free_list_head(fp.next_free_page());
                fp.zero();
            }
            Ok((pagenum, frame))
        })();
        self.unpin(&header, result.is_ok());
        result
    }

    /// Thread `pagenum` back onto the table's free list.
    pub fn free_page(&self, table_id: TableId, pagenum: PageNum) -> DbResult<()> {
        let header = self.fetch(table_id, 0)?;
        let result = (|| {
            let freed = self.fetch(table_id, pagenum)?;
            {
                let mut hp = header.page();
                let mut fp = freed.page();
                fp.zero();
                fp.set_next_free_page(hp.free_list_head());
                hp.set_free_list_head(pagenum);
            }
            self.unpin_discard(&freed);
            Ok(())
        })();
        self.unpin(&header, result.is_ok());
        result
    }

    /// Write back every dirty frame (log first) and clear the flags. Used by
    /// shutdown and at the end of recovery; assumes no concurrent pinners
    /// are dirtying pages.
    pub fn flush_all(&self) -> DbResult<()> {
        self.log.flush()?;
        let dirty: Vec<(usize, TableId, PageNum)> = {
            let state = self.state.lock().unwrap();
            state
                .metas
                .iter()
                .enumerate()
                .filter(|(_, m)| m.valid && m.dirty)
                .map(|(i, m)| (i, m.table_id, m.pagenum))
                .collect()
        };
        for (index, table_id, pagenum) in dirty {
            let page = self.frames[index].page.lock().unwrap();
            self.files
                .lock()
                .unwrap()
                .write_page(table_id, pagenum, &page)?;
            drop(page);
            self.state.lock().unwrap().metas[index].dirty = false;
        }
        Ok(())
    }
}
