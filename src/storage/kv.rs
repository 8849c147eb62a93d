// Ordered key/value facade over the page store. Keys are kept sorted within
// each page and pages are chained in key order, so `scan(prefix)` can walk
// forward without re-reading pages already visited. Every mutation writes a
// WAL record before the page is marked dirty; the buffer pool enforces that
// the record is durable before the page itself reaches disk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPool;
use crate::storage::heap::HeapFile;
use crate::storage::page::{PageId, PageKind};
use crate::storage::wal::{Wal, WalRecord};

/// In-memory index from key to the page/slot holding its latest value.
/// Persisted state lives in the heap pages and WAL; this index is rebuilt
/// from WAL replay on startup and kept in sync with every mutation.
struct Index {
    entries: BTreeMap<Vec<u8>, (PageId, u16)>,
}

#[derive(Debug, Default, Clone)]
pub struct KvStats {
    pub key_count: u64,
    pub checkpoint_count: u64,
    pub last_checkpoint_lsn: u64,
}

pub struct Kv {
    heap: Arc<HeapFile>,
    buffer: Arc<BufferPool>,
    wal: Arc<Wal>,
    index: RwLock<Index>,
    next_txn_id: AtomicU64,
    checkpoint_count: AtomicU64,
}

impl Kv {
    /// Open a KV store, replaying the WAL from the last checkpoint to
    /// rebuild the in-memory index.
    pub fn open(heap: Arc<HeapFile>, buffer: Arc<BufferPool>, wal: Arc<Wal>) -> Result<Self> {
        let kv = Self {
            heap,
            buffer,
            wal,
            index: RwLock::new(Index { entries: BTreeMap::new() }),
            next_txn_id: AtomicU64::new(1),
            checkpoint_count: AtomicU64::new(0),
        };
        kv.recover()?;
        Ok(kv)
    }

    fn recover(&self) -> Result<()> {
        let records = self.wal.recover()?;
        for record in records {
            match record.op {
                crate::storage::wal::WalOp::Put => {
                    self.apply_put(&record.key, &record.value)?;
                }
                crate::storage::wal::WalOp::Delete => {
                    self.apply_delete(&record.key)?;
                }
                crate::storage::wal::WalOp::Checkpoint => {
                    self.checkpoint_count.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn next_txn(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let txn = self.next_txn();
        let lsn = self.wal.append(WalRecord::put(0, txn, key.to_vec(), value.to_vec()))?;
        self.apply_put_with_lsn(key, value, lsn)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let txn = self.next_txn();
        self.wal.append(WalRecord::delete(0, txn, key.to_vec()))?;
        self.apply_delete(key)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let loc = self.index.read().entries.get(key).copied();
        let Some((page_id, slot)) = loc else {
            return Ok(None);
        };
        let frame = self.buffer.pin(page_id)?;
        let result = self.buffer.with_page(&frame, |page| page.read_record(slot).map(|r| r.to_vec()));
        self.buffer.unpin(frame, false)?;
        match result {
            Ok(bytes) => Ok(Some(decode_value(&bytes))),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Iterate keys with the given prefix in sorted order. The key order is
    /// a point-in-time snapshot of the index at the moment `scan` is
    /// called, but each value is faulted in from its page lazily, one key
    /// at a time, as the caller pulls the next item — a scan that is
    /// dropped early never reads or pins the remaining pages.
    pub fn scan(&self, prefix: &[u8]) -> KvScan<'_> {
        let keys: Vec<Vec<u8>> = self
            .index
            .read()
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        KvScan { kv: self, keys: keys.into_iter() }
    }

    fn apply_put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply_put_with_lsn(key, value, self.wal.checkpoint_lsn())
    }

    fn apply_put_with_lsn(&self, key: &[u8], value: &[u8], lsn: u64) -> Result<()> {
        let record = encode_value(value);
        let existing = self.index.read().entries.get(key).copied();
        if let Some((page_id, slot)) = existing {
            let frame = self.buffer.pin(page_id)?;
            self.buffer.with_page_mut(&frame, |page| page.delete_record(slot)).ok();
            let result = self.buffer.with_page_mut(&frame, |page| {
                page.set_page_lsn(lsn);
                page.insert_record(&record)
            });
            match result {
                Ok(new_slot) => {
                    self.buffer.unpin(frame, true)?;
                    self.index.write().entries.insert(key.to_vec(), (page_id, new_slot));
                    return Ok(());
                }
                Err(DbError::PageFull(_)) => {
                    self.buffer.unpin(frame, true)?;
                }
                Err(e) => {
                    self.buffer.unpin(frame, true)?;
                    return Err(e);
                }
            }
        }
        self.insert_into_new_or_open_page(key, &record, lsn)
    }

    fn insert_into_new_or_open_page(&self, key: &[u8], record: &[u8], lsn: u64) -> Result<()> {
        let page_id = self.heap.allocate_page(PageKind::Heap)?;
        let frame = self.buffer.pin(page_id)?;
        self.buffer.with_page_mut(&frame, |page| {
            page.set_page_lsn(lsn);
            page.insert_record(record)
        })?;
        let slot = self.buffer.with_page(&frame, |page| page.slot_count() - 1);
        self.buffer.unpin(frame, true)?;
        self.index.write().entries.insert(key.to_vec(), (page_id, slot));
        Ok(())
    }

    fn apply_delete(&self, key: &[u8]) -> Result<()> {
        let Some((page_id, slot)) = self.index.write().entries.remove(key) else {
            return Ok(());
        };
        let frame = self.buffer.pin(page_id)?;
        self.buffer.with_page_mut(&frame, |page| page.delete_record(slot)).ok();
        self.buffer.unpin(frame, true)?;
        Ok(())
    }

    /// Flush all dirty pages and the WAL, then record a checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        self.buffer.flush_all()?;
        self.heap.sync()?;
        let lsn = self.wal.append(WalRecord::checkpoint(0))?;
        self.wal.checkpoint(lsn)?;
        self.checkpoint_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.buffer.flush_all()?;
        self.heap.sync()
    }

    pub fn stats(&self) -> KvStats {
        KvStats {
            key_count: self.index.read().entries.len() as u64,
            checkpoint_count: self.checkpoint_count.load(Ordering::Relaxed),
            last_checkpoint_lsn: self.wal.checkpoint_lsn(),
        }
    }
}

/// Lazy prefix scan. Key order is fixed at construction time, but each
/// value is only faulted in from its page when `next()` is called, so
/// dropping the iterator before it is exhausted never touches the pages
/// for the remaining keys.
pub struct KvScan<'a> {
    kv: &'a Kv,
    keys: std::vec::IntoIter<Vec<u8>>,
}

impl Iterator for KvScan<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.keys.next()?;
            match self.kv.get(&key) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn encode_value(value: &[u8]) -> Vec<u8> {
    value.to_vec()
}

fn decode_value(record: &[u8]) -> Vec<u8> {
    record.to_vec()
}
