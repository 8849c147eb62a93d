//! Page-based storage engine: heap files, buffer pool, write-ahead log,
//! an ordered KV facade, and multi-database management.

pub mod buffer;
pub mod db;
pub mod heap;
pub mod kv;
pub mod page;
pub mod wal;

pub use buffer::{BufferPool, DurabilityOracle};
pub use db::{DatabaseManager, DatabaseManagerConfig};
pub use heap::HeapFile;
pub use kv::{Kv, KvStats};
pub use page::{Page, PageId, PageKind, DEFAULT_PAGE_SIZE};
pub use wal::{GroupCommitMode, Wal, WalOpenOptions, WalOp, WalRecord};
