//! Block store: page-granular I/O over one file per table.
//!
//! A new table file is sized to 10 MiB up front: a header page followed by
//! 2559 free pages chained through their first eight bytes. Growth happens in
//! bulk through [`FileManager::extend`]; the buffer layer decides when.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{DbError, DbResult};
use crate::page::{Page, PageNum, PAGE_SIZE};

pub type TableId = i64;

/// Pages in a freshly created table file (10 MiB).
pub const INITIAL_TABLE_PAGES: u64 = (10 * 1024 * 1024 / PAGE_SIZE) as u64;

pub const MAX_OPEN_TABLES: usize = 20;

struct TableFile {
    file: File,
}

pub struct FileManager {
    tables: Vec<TableFile>,
    by_path: HashMap<PathBuf, TableId>,
}

impl FileManager {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            by_path: HashMap::new(),
        }
    }

    /// Open or create the table file at `path`. Table ids count up from 1 in
    /// open order; re-opening a path yields the id it already has.
    pub fn open_table(&mut self, path: &Path) -> DbResult<TableId> {
        let path = normalize(path)?;
        if let Some(&id) = self.by_path.get(&path) {
            return Ok(id);
        }
        if self.tables.len() >= MAX_OPEN_TABLES {
            return Err(DbError::TableLimit);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if file.metadata()?.len() == 0 {
            initialize_table_file(&mut file)?;
        }

        let id = self.tables.len() as TableId + 1;
        self.tables.push(TableFile { file });
        self.by_path.insert(path, id);
        Ok(id)
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn is_open(&self, table_id: TableId) -> bool {
        table_id >= 1 && (table_id as usize) <= self.tables.len()
    }

    fn table(&self, table_id: TableId) -> DbResult<&TableFile> {
        if !self.is_open(table_id) {
            return Err(DbError::UnknownTable(table_id));
        }
        Ok(&self.tables[table_id as usize - 1])
    }

    pub fn read_page(&self, table_id: TableId, pagenum: PageNum, page: &mut Page) -> DbResult<()> {
        let table = self.table(table_id)?;
        let mut file = &table.file;
        file.seek(SeekFrom::Start(pagenum * PAGE_SIZE as u64))?;
        file.read_exact(page.as_bytes_mut())?;
        Ok(())
    }

    /// Write one page and sync. Durability of the block layer is per write;
    /// ordering against the log is the buffer layer's problem.
    pub fn write_page(&self, table_id: TableId, pagenum: PageNum, page: &Page) -> DbResult<()> {
        let table = self.table(table_id)?;
        let mut file = &table.file;
        file.seek(SeekFrom::Start(pagenum * PAGE_SIZE as u64))?;
        file.write_all(page.as_bytes())?;
        table.file.sync_all()?;
        Ok(())
    }

    /// Append `additional` free pages chained first-to-last, starting at page
    /// number `current_pages`. The last new page terminates the chain; the
    /// caller re-points the free-list head at `current_pages`.
    pub fn extend(&self, table_id: TableId, current_pages: u64, additional: u64) -> DbResult<()> {
        let table = self.table(table_id)?;
        let mut file = &table.file;
        file.seek(SeekFrom::Start(current_pages * PAGE_SIZE as u64))?;
        let mut page = Page::new();
        for i in 0..additional {
            let next = if i + 1 < additional {
                current_pages + i + 1
            } else {
                0
            };
            page.set_next_free_page(next);
            file.write_all(page.as_bytes())?;
        }
        table.file.sync_all()?;
        Ok(())
    }

    pub fn sync_all(&self) -> DbResult<()> {
        for table in &self.tables {
            table.file.sync_all()?;
        }
        Ok(())
    }
}

impl Default for FileManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve to an absolute path so the same file cannot be opened twice under
/// two spellings. The file itself may not exist yet, so canonicalize the
/// parent directory instead.
fn normalize(path: &Path) -> DbResult<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.canonicalize()?,
        _ => std::env::current_dir()?,
    };
    let name = path
        .file_name()
        .ok_or_else(|| DbError::Io(std::io::Error::from(std::io::ErrorKind::InvalidInput)))?;
    Ok(parent.join(name))
}

fn initialize_table_file(file: &mut File) -> DbResult<()> {
    let mut header = Page::new();
    header.set_free_list_head(1);
    header.set_num_pages(INITIAL_TABLE_PAGES);
    header.set_root(0);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(header.as_bytes())?;

    let mut page = Page::new();
    for pagenum in 1..INITIAL_TABLE_PAGES {
        let next = if pagenum + 1 < INITIAL_TABLE_PAGES {
            pagenum + 1
        } else {
            0
        };
        page.set_next_free_page(next);
        file.write_all(page.as_bytes())?;
    }
    file.sync_all()?;
    Ok(())
}
