// Buffer pool: fixed-capacity frame table with LRU-K eviction, pin counts,
// and dirty tracking. Fetching a page faults it in from the heap file on a
// miss; evicting a dirty frame first confirms its protecting WAL record is
// durable (WAL-before-data), flushing the WAL if it is not.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::error::{DbError, Result};
use crate::storage::heap::HeapFile;
use crate::storage::page::{Page, PageId};

/// Anything that can report the LSN durably flushed to disk and be asked to
/// flush further. Implemented by the WAL; kept as a trait so the buffer pool
/// does not depend on the WAL's concrete type.
pub trait DurabilityOracle: Send + Sync {
    fn durable_lsn(&self) -> u64;
    fn flush(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(usize);

/// Opaque handle returned by `pin`. Must be passed back to `unpin`.
pub struct Frame {
    id: FrameId,
    page_id: PageId,
}

impl Frame {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

struct Slot {
    page: Option<Page>,
    pin_count: usize,
    dirty: bool,
    last_access: Instant,
    history: VecDeque<Instant>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            page: None,
            pin_count: 0,
            dirty: false,
            last_access: Instant::now(),
            history: VecDeque::new(),
        }
    }

    fn record_access(&mut self, k: usize) {
        let now = Instant::now();
        self.last_access = now;
        self.history.push_back(now);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }
}

#[derive(Debug, Default)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub faults: u64,
    pub evictions: u64,
    pub page_reads: u64,
    pub page_writes: u64,
}

pub struct BufferPool {
    heap: Arc<HeapFile>,
    wal: Arc<dyn DurabilityOracle>,
    frames: Vec<Mutex<Slot>>,
    page_table: RwLock<HashMap<PageId, usize>>,
    free_frames: Mutex<VecDeque<usize>>,
    k: usize,
    hits: AtomicU64,
    faults: AtomicU64,
    evictions: AtomicU64,
    page_reads: AtomicU64,
    page_writes: AtomicU64,
}

impl BufferPool {
    pub fn new(heap: Arc<HeapFile>, wal: Arc<dyn DurabilityOracle>, capacity: usize) -> Self {
        Self::with_k(heap, wal, capacity, 2)
    }

    pub fn with_k(
        heap: Arc<HeapFile>,
        wal: Arc<dyn DurabilityOracle>,
        capacity: usize,
        k: usize,
    ) -> Self {
        let frames = (0..capacity).map(|_| Mutex::new(Slot::empty())).collect();
        let free_frames = (0..capacity).collect();
        Self {
            heap,
            wal,
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_frames: Mutex::new(free_frames),
            k: k.max(1),
            hits: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            page_reads: AtomicU64::new(0),
            page_writes: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Pin a page, faulting it in from the heap file if it is not resident.
    pub fn pin(&self, page_id: PageId) -> Result<Frame> {
        if let Some(&idx) = self.page_table.read().get(&page_id) {
            let mut slot = self.frames[idx].lock();
            slot.pin_count += 1;
            slot.record_access(self.k);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Frame {
                id: FrameId(idx),
                page_id,
            });
        }

        self.faults.fetch_add(1, Ordering::Relaxed);
        let page = self.heap.read_page(page_id)?;
        self.page_reads.fetch_add(1, Ordering::Relaxed);

        let idx = self.acquire_frame()?;
        let mut slot = self.frames[idx].lock();
        slot.page = Some(page);
        slot.pin_count = 1;
        slot.dirty = false;
        slot.history.clear();
        slot.record_access(self.k);
        drop(slot);

        self.page_table.write().insert(page_id, idx);
        Ok(Frame {
            id: FrameId(idx),
            page_id,
        })
    }

    fn acquire_frame(&self) -> Result<usize> {
        if let Some(idx) = self.free_frames.lock().pop_front() {
            return Ok(idx);
        }
        self.evict_victim()
    }

    fn evict_victim(&self) -> Result<usize> {
        // group 0: fewer than k samples (falls back to plain LRU), group 1: full history (LRU-K)
        let mut best: Option<(u8, Instant, usize)> = None;
        for (idx, frame) in self.frames.iter().enumerate() {
            let slot = frame.lock();
            if slot.pin_count != 0 {
                continue;
            }
            let (group, key) = if slot.history.len() < self.k {
                (0u8, slot.last_access)
            } else {
                (1u8, *slot.history.front().expect("full history non-empty"))
            };
            if best
                .map(|(g, t, _)| (group, key) < (g, t))
                .unwrap_or(true)
            {
                best = Some((group, key, idx));
            }
        }

        let Some((_, _, idx)) = best else {
            return Err(DbError::Capacity(
                "buffer pool exhausted: no unpinned frames".into(),
            ));
        };

        let mut slot = self.frames[idx].lock();
        if let Some(page) = slot.page.take() {
            if slot.dirty {
                // WAL-before-data: block eviction until the protecting record is durable.
                if self.wal.durable_lsn() < page.page_lsn {
                    self.wal.flush()?;
                }
                self.heap.write_page(&page)?;
                self.page_writes.fetch_add(1, Ordering::Relaxed);
            }
            self.page_table.write().remove(&page.id);
        }
        slot.dirty = false;
        slot.history.clear();
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(idx)
    }

    pub fn unpin(&self, frame: Frame, dirty: bool) -> Result<()> {
        let mut slot = self.frames[frame.id.0].lock();
        if slot.pin_count == 0 {
            return Err(DbError::Internal(format!(
                "unpin underflow on frame {}",
                frame.id.0
            )));
        }
        slot.pin_count -= 1;
        if dirty {
            slot.dirty = true;
        }
        Ok(())
    }

    pub fn with_page<R>(&self, frame: &Frame, f: impl FnOnce(&Page) -> R) -> R {
        let slot = self.frames[frame.id.0].lock();
        f(slot.page.as_ref().expect("pinned frame holds a page"))
    }

    pub fn with_page_mut<R>(&self, frame: &Frame, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut slot = self.frames[frame.id.0].lock();
        f(slot.page.as_mut().expect("pinned frame holds a page"))
    }

    /// Flush every dirty, unpinned frame to disk.
    pub fn flush_all(&self) -> Result<()> {
        for frame in &self.frames {
            let mut slot = frame.lock();
            if slot.dirty {
                if let Some(page) = &slot.page {
                    if self.wal.durable_lsn() < page.page_lsn {
                        self.wal.flush()?;
                    }
                    self.heap.write_page(page)?;
                    self.page_writes.fetch_add(1, Ordering::Relaxed);
                    slot.dirty = false;
                }
            }
        }
        Ok(())
    }

    pub fn dirty_page_count(&self) -> usize {
        self.frames.iter().filter(|f| f.lock().dirty).count()
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            page_reads: self.page_reads.load(Ordering::Relaxed),
            page_writes: self.page_writes.load(Ordering::Relaxed),
        }
    }
}
