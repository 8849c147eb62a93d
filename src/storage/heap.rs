// Heap file: an ordered sequence of fixed-size pages on disk, indexed by
// page id and extended by appending freshly allocated pages.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageId, PageKind, DEFAULT_PAGE_SIZE};

pub struct HeapFile {
    path: PathBuf,
    file: Mutex<File>,
    page_size: usize,
    next_page_id: AtomicU64,
}

impl HeapFile {
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let next_page_id = len / page_size as u64;
        Ok(Self {
            path,
            file: Mutex::new(file),
            page_size,
            next_page_id: AtomicU64::new(next_page_id),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.next_page_id.load(Ordering::Acquire)
    }

    /// Allocate a fresh page at the tail of the file. Growth failures (disk
    /// full, etc.) surface as `OutOfSpace`.
    pub fn allocate_page(&self, kind: PageKind) -> Result<PageId> {
        let id = self.next_page_id.fetch_add(1, Ordering::AcqRel);
        let page = Page::new(id, kind, self.page_size);
        self.write_page(&page).map_err(|e| {
            self.next_page_id.fetch_sub(1, Ordering::AcqRel);
            match e {
                DbError::Io(msg) => DbError::OutOfSpace(msg),
                other => other,
            }
        })?;
        Ok(id)
    }

    pub fn read_page(&self, id: PageId) -> Result<Page> {
        if id >= self.next_page_id.load(Ordering::Acquire) {
            return Err(DbError::NotFound(format!("page {id}")));
        }
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.lock().expect("heap file mutex poisoned");
        file.seek(SeekFrom::Start(id * self.page_size as u64))?;
        file.read_exact(&mut buf)?;
        Page::from_bytes(buf)
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        let bytes = page.to_bytes();
        let mut file = self.file.lock().expect("heap file mutex poisoned");
        file.seek(SeekFrom::Start(page.id * self.page_size as u64))?;
        file.write_all(&bytes)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock().expect("heap file mutex poisoned");
        file.sync_data()?;
        Ok(())
    }

    /// Rewrite a page's body so tombstoned slots no longer hold dead bytes,
    /// compacting live records toward the tail. Callers must ensure the page
    /// is not pinned for write in the buffer pool while this runs.
    pub fn compact_page(&self, id: PageId) -> Result<()> {
        let old = self.read_page(id)?;
        let mut fresh = Page::new(id, old.kind, self.page_size);
        fresh.set_page_lsn(old.page_lsn);
        for record in old.records() {
            fresh.insert_record(record)?;
        }
        self.write_page(&fresh)
    }
}

pub fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_write_read_round_trips() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(dir.path().join("heap.db"), DEFAULT_PAGE_SIZE).unwrap();
        let id = heap.allocate_page(PageKind::Heap).unwrap();
        let mut page = heap.read_page(id).unwrap();
        page.insert_record(b"row").unwrap();
        heap.write_page(&page).unwrap();

        let reloaded = heap.read_page(id).unwrap();
        assert_eq!(reloaded.read_record(0).unwrap(), b"row");
    }

    #[test]
    fn reopen_recovers_page_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.db");
        {
            let heap = HeapFile::open(&path, DEFAULT_PAGE_SIZE).unwrap();
            heap.allocate_page(PageKind::Heap).unwrap();
            heap.allocate_page(PageKind::Heap).unwrap();
        }
        let heap = HeapFile::open(&path, DEFAULT_PAGE_SIZE).unwrap();
        assert_eq!(heap.page_count(), 2);
    }

    #[test]
    fn compact_preserves_live_records() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(dir.path().join("heap.db"), DEFAULT_PAGE_SIZE).unwrap();
        let id = heap.allocate_page(PageKind::Heap).unwrap();
        let mut page = heap.read_page(id).unwrap();
        let s1 = page.insert_record(b"keep").unwrap();
        let s2 = page.insert_record(b"drop").unwrap();
        page.delete_record(s2).unwrap();
        heap.write_page(&page).unwrap();

        heap.compact_page(id).unwrap();
        let compacted = heap.read_page(id).unwrap();
        assert_eq!(compacted.read_record(s1).unwrap(), b"keep");
    }
}
