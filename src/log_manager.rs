//! Write-ahead log and restart recovery.
//!
//! Records accumulate in an in-memory buffer and reach disk on commit,
//! rollback, page eviction, or when the buffer outgrows its threshold. An
//! LSN is the record's byte offset in the log file, so LSNs are strictly
//! increasing and double as file positions during the undo pass.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::buffer_manager::BufferPool;
use crate::error::{DbError, DbResult};
use crate::file_manager::TableId;
use crate::page::PageNum;

pub type Lsn = u64;

/// The log buffer force-flushes past this many bytes.
const LOG_BUFFER_FLUSH: usize = 65536;

// Field offsets within a serialized record.
const SIZE_OFFSET: usize = 0;
const LSN_OFFSET: usize = 4;
const PREV_LSN_OFFSET: usize = 12;
const TRX_OFFSET: usize = 20;
const TYPE_OFFSET: usize = 24;
const TABLE_OFFSET: usize = 28;
const PAGENUM_OFFSET: usize = 36;
const PAGE_OFFSET_OFFSET: usize = 44;
const LENGTH_OFFSET: usize = 46;
const IMAGES_OFFSET: usize = 48;

const PLAIN_RECORD_SIZE: usize = 28;
const UPDATE_BASE_SIZE: usize = 48;

const TYPE_BEGIN: u32 = 0;
const TYPE_UPDATE: u32 = 1;
const TYPE_COMMIT: u32 = 2;
const TYPE_ROLLBACK: u32 = 3;
const TYPE_COMPENSATE: u32 = 4;

/// Physical images of one in-page write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateImage {
    pub table_id: TableId,
    pub pagenum: PageNum,
    pub offset: u16,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogBody {
    Begin,
    Commit,
    Rollback,
    Update(UpdateImage),
    /// Compensation record: redoes an undo. `Lsn` is the next record of the
    /// same transaction still to undo.
    Compensate(UpdateImage, Lsn),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub trx_id: u32,
    pub body: LogBody,
}

impl LogEntry {
    fn type_code(&self) -> u32 {
        match self.body {
            LogBody::Begin => TYPE_BEGIN,
            LogBody::Update(_) => TYPE_UPDATE,
            LogBody::Commit => TYPE_COMMIT,
            LogBody::Rollback => TYPE_ROLLBACK,
            LogBody::Compensate(..) => TYPE_COMPENSATE,
        }
    }

    pub fn encoded_size(&self) -> usize {
        match &self.body {
            LogBody::Begin | LogBody::Commit | LogBody::Rollback => PLAIN_RECORD_SIZE,
            LogBody::Update(img) => UPDATE_BASE_SIZE + 2 * img.old.len(),
            LogBody::Compensate(img, _) => UPDATE_BASE_SIZE + 2 * img.old.len() + 8,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let size = self.encoded_size();
        let start = out.len();
        out.resize(start + size, 0);
        let buf = &mut out[start..];
        buf[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&(size as u32).to_le_bytes());
        buf[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&self.lsn.to_le_bytes());
        buf[PREV_LSN_OFFSET..PREV_LSN_OFFSET + 8].copy_from_slice(&self.prev_lsn.to_le_bytes());
        buf[TRX_OFFSET..TRX_OFFSET + 4].copy_from_slice(&self.trx_id.to_le_bytes());
        buf[TYPE_OFFSET..TYPE_OFFSET + 4].copy_from_slice(&self.type_code().to_le_bytes());

        let img = match &self.body {
            LogBody::Update(img) => img,
            LogBody::Compensate(img, next_undo) => {
                let at = IMAGES_OFFSET + 2 * img.old.len();
                buf[at..at + 8].copy_from_slice(&next_undo.to_le_bytes());
                img
            }
            _ => return,
        };
        let len = img.old.len();
        debug_assert_eq!(len, img.new.len());
        buf[TABLE_OFFSET..TABLE_OFFSET + 8].copy_from_slice(&img.table_id.to_le_bytes());
        buf[PAGENUM_OFFSET..PAGENUM_OFFSET + 8].copy_from_slice(&img.pagenum.to_le_bytes());
        buf[PAGE_OFFSET_OFFSET..PAGE_OFFSET_OFFSET + 2]
            .copy_from_slice(&img.offset.to_le_bytes());
        buf[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&(len as u16).to_le_bytes());
        buf[IMAGES_OFFSET..IMAGES_OFFSET + len].copy_from_slice(&img.old);
        buf[IMAGES_OFFSET + len..IMAGES_OFFSET + 2 * len].copy_from_slice(&img.new);
    }

    /// Decode the record starting at `pos`. `Ok(None)` means the tail is
    /// torn (a partial final write) and the scan should stop there.
    fn decode(data: &[u8], pos: usize) -> DbResult<Option<LogEntry>> {
        if data.len() - pos < 4 {
            return Ok(None);
        }
        let size = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        if size < PLAIN_RECORD_SIZE || data.len() - pos < size {
            return Ok(None);
        }
        let buf = &data[pos..pos + size];
        let lsn = u64::from_le_bytes(buf[LSN_OFFSET..LSN_OFFSET + 8].try_into().unwrap());
        if lsn != pos as u64 {
            return Err(DbError::CorruptLog(pos as u64));
        }
        let prev_lsn =
            u64::from_le_bytes(buf[PREV_LSN_OFFSET..PREV_LSN_OFFSET + 8].try_into().unwrap());
        let trx_id = u32::from_le_bytes(buf[TRX_OFFSET..TRX_OFFSET + 4].try_into().unwrap());
        let type_code = u32::from_le_bytes(buf[TYPE_OFFSET..TYPE_OFFSET + 4].try_into().unwrap());

        let body = match type_code {
            TYPE_BEGIN => LogBody::Begin,
            TYPE_COMMIT => LogBody::Commit,
            TYPE_ROLLBACK => LogBody::Rollback,
            TYPE_UPDATE | TYPE_COMPENSATE => {
                let len = u16::from_le_bytes(
                    buf[LENGTH_OFFSET..LENGTH_OFFSET + 2].try_into().unwrap(),
                ) as usize;
                let want = UPDATE_BASE_SIZE
                    + 2 * len
                    + if type_code == TYPE_COMPENSATE { 8 } else { 0 };
                if size != want {
                    return Err(DbError::CorruptLog(pos as u64));
                }
                let img = UpdateImage {
                    table_id: i64::from_le_bytes(
                        buf[TABLE_OFFSET..TABLE_OFFSET + 8].try_into().unwrap(),
                    ),
                    pagenum: u64::from_le_bytes(
                        buf[PAGENUM_OFFSET..PAGENUM_OFFSET + 8].try_into().unwrap(),
                    ),
                    offset: u16::from_le_bytes(
                        buf[PAGE_OFFSET_OFFSET..PAGE_OFFSET_OFFSET + 2].try_into().unwrap(),
                    ),
                    old: buf[IMAGES_OFFSET..IMAGES_OFFSET + len].to_vec(),
                    new: buf[IMAGES_OFFSET + len..IMAGES_OFFSET + 2 * len].to_vec(),
                };
                if type_code == TYPE_UPDATE {
                    LogBody::Update(img)
                } else {
                    let at = IMAGES_OFFSET + 2 * len;
                    let next_undo = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
                    LogBody::Compensate(img, next_undo)
                }
            }
            _ => return Err(DbError::CorruptLog(pos as u64)),
        };
        Ok(Some(LogEntry {
            lsn,
            prev_lsn,
            trx_id,
            body,
        }))
    }
}

struct LogInner {
    file: File,
    buf: Vec<u8>,
    /// Bytes durably on disk. The next appended record gets LSN
    /// `durable_len + buf.len()`.
    durable_len: u64,
}

pub struct LogManager {
    inner: Mutex<LogInner>,
}

impl LogManager {
    pub fn open(path: &Path) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(LogInner {
                file,
                buf: Vec::new(),
                durable_len,
            }),
        })
    }

    /// Append a record and return its LSN. Spills the buffer to disk once it
    /// grows past the flush threshold.
    pub fn append(&self, trx_id: u32, prev_lsn: Lsn, body: LogBody) -> DbResult<Lsn> {
        let mut inner = self.inner.lock().unwrap();
        let lsn = inner.durable_len + inner.buf.len() as u64;
        let entry = LogEntry {
            lsn,
            prev_lsn,
            trx_id,
            body,
        };
        let mut buf = std::mem::take(&mut inner.buf);
        entry.encode_into(&mut buf);
        inner.buf = buf;
        if inner.buf.len() > LOG_BUFFER_FLUSH {
            flush_locked(&mut inner)?;
        }
        Ok(lsn)
    }

    /// Force everything buffered to disk. The pool calls this before any
    /// dirty page write; commit and rollback call it for durability.
    pub fn flush(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        flush_locked(&mut inner)
    }

    pub fn next_lsn(&self) -> Lsn {
        let inner = self.inner.lock().unwrap();
        inner.durable_len + inner.buf.len() as u64
    }

    /// Flush, then decode the whole log. A torn final record ends the scan.
    pub fn read_entries(&self) -> DbResult<Vec<LogEntry>> {
        let mut inner = self.inner.lock().unwrap();
        flush_locked(&mut inner)?;
        let mut data = Vec::new();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.read_to_end(&mut data)?;
        drop(inner);

        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            match LogEntry::decode(&data, pos)? {
                Some(entry) => {
                    pos += entry.encoded_size();
                    entries.push(entry);
                }
                None => break,
            }
        }
        Ok(entries)
    }

    /// Three-pass restart recovery. Tables addressed by the log must already
    /// be re-opened (ids are assigned in open order). Returns the largest
    /// transaction id seen so the id counter can resume past it.
    pub fn recover(&self, pool: &BufferPool) -> DbResult<u32> {
        let entries = self.read_entries()?;

        // Drop a torn tail so records appended from here on stay reachable.
        let valid_end = entries
            .last()
            .map_or(0, |e| e.lsn + e.encoded_size() as u64);
        {
            let mut inner = self.inner.lock().unwrap();
            if valid_end < inner.durable_len {
                inner.file.set_len(valid_end)?;
                inner.file.sync_all()?;
                inner.durable_len = valid_end;
            }
        }

        // Analysis: transactions without a COMMIT or ROLLBACK are losers.
        let mut losers: std::collections::HashMap<u32, Lsn> = std::collections::HashMap::new();
        let mut max_trx = 0;
        for entry in &entries {
            max_trx = max_trx.max(entry.trx_id);
            match entry.body {
                LogBody::Commit | LogBody::Rollback => {
                    losers.remove(&entry.trx_id);
                }
                _ => {
                    losers.insert(entry.trx_id, entry.lsn);
                }
            }
        }

        // Redo: repeat history for every physical write not yet on the page.
        for entry in &entries {
            let img = match &entry.body {
                LogBody::Update(img) => img,
                LogBody::Compensate(img, _) => img,
                _ => continue,
            };
            let handle = pool.fetch(img.table_id, img.pagenum)?;
            let mut page = handle.page();
            let dirty = entry.lsn > page.page_lsn();
            if dirty {
                page.write_bytes(img.offset as usize, &img.new);
                page.set_page_lsn(entry.lsn);
            }
            drop(page);
            pool.unpin(&handle, dirty);
        }

        // Undo: roll every loser back along its prev-LSN chain, logging a
        // compensation record per undone update so a crash during undo never
        // undoes twice.
        let by_lsn: std::collections::HashMap<Lsn, &LogEntry> =
            entries.iter().map(|e| (e.lsn, e)).collect();
        let mut loser_list: Vec<(u32, Lsn)> = losers.into_iter().collect();
        loser_list.sort_unstable();
        for (trx_id, last_lsn) in loser_list {
            let mut tail_lsn = last_lsn;
            let mut cursor = last_lsn;
            loop {
                let entry = by_lsn
                    .get(&cursor)
                    .ok_or(DbError::CorruptLog(cursor))?;
                match &entry.body {
                    LogBody::Begin => {
                        self.append(trx_id, tail_lsn, LogBody::Rollback)?;
                        break;
                    }
                    LogBody::Update(img) => {
                        let clr = UpdateImage {
                            table_id: img.table_id,
                            pagenum: img.pagenum,
                            offset: img.offset,
                            old: img.new.clone(),
                            new: img.old.clone(),
                        };
                        let clr_lsn = self.append(
                            trx_id,
                            tail_lsn,
                            LogBody::Compensate(clr, entry.prev_lsn),
                        )?;
                        let handle = pool.fetch(img.table_id, img.pagenum)?;
                        let mut page = handle.page();
                        page.write_bytes(img.offset as usize, &img.old);
                        page.set_page_lsn(clr_lsn);
                        drop(page);
                        pool.unpin(&handle, true);
                        tail_lsn = clr_lsn;
                        cursor = entry.prev_lsn;
                    }
                    LogBody::Compensate(_, next_undo) => {
                        cursor = *next_undo;
                    }
                    LogBody::Commit | LogBody::Rollback => {
                        return Err(DbError::CorruptLog(cursor));
                    }
                }
            }
        }

        self.flush()?;
        pool.flush_all()?;
        Ok(max_trx)
    }
}

fn flush_locked(inner: &mut LogInner) -> DbResult<()> {
    if inner.buf.is_empty() {
        return Ok(());
    }
    let at = inner.durable_len;
    inner.file.seek(SeekFrom::Start(at))?;
    let buf = std::mem::take(&mut inner.buf);
    inner.file.write_all(&buf)?;
    inner.file.sync_all()?;
    inner.durable_len += buf.len() as u64;
    Ok(())
}
