// Crash recovery: data written before an unclean shutdown (no explicit
// close/flush call) must reappear after reopening the same heap + WAL
// directory, rebuilt entirely from WAL replay.

use std::sync::Arc;

use flydb::storage::page::DEFAULT_PAGE_SIZE;
use flydb::storage::wal::WalOpenOptions;
use flydb::storage::{BufferPool, HeapFile, Kv, Wal};
use tempfile::tempdir;

fn open_kv(heap_path: &std::path::Path, wal_path: &std::path::Path) -> Kv {
    let heap = Arc::new(HeapFile::open(heap_path, DEFAULT_PAGE_SIZE).unwrap());
    let wal = Arc::new(Wal::open(wal_path, WalOpenOptions::default()).unwrap());
    let buffer = Arc::new(BufferPool::new(heap.clone(), wal.clone(), 32));
    Kv::open(heap, buffer, wal).unwrap()
}

#[test]
fn uncommitted_buffer_pool_state_survives_reopen_via_wal_replay() {
    let dir = tempdir().unwrap();
    let heap_path = dir.path().join("heap.db");
    let wal_path = dir.path().join("wal");

    {
        let kv = open_kv(&heap_path, &wal_path);
        for i in 0..50u32 {
            kv.put(format!("k{i:04}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
        }
        kv.delete(b"k0010").unwrap();
        // Deliberately dropped without calling checkpoint()/sync() to model
        // an unclean shutdown; only the WAL's durability guarantee protects
        // this data.
    }

    let recovered = open_kv(&heap_path, &wal_path);
    assert_eq!(recovered.get(b"k0000").unwrap(), Some(b"v0".to_vec()));
    assert_eq!(recovered.get(b"k0049").unwrap(), Some(b"v49".to_vec()));
    assert_eq!(recovered.get(b"k0010").unwrap(), None);
}

#[test]
fn checkpoint_advances_and_survives_reopen() {
    let dir = tempdir().unwrap();
    let heap_path = dir.path().join("heap.db");
    let wal_path = dir.path().join("wal");

    {
        let kv = open_kv(&heap_path, &wal_path);
        kv.put(b"a", b"1").unwrap();
        kv.checkpoint().unwrap();
        kv.put(b"b", b"2").unwrap();
    }

    let recovered = open_kv(&heap_path, &wal_path);
    assert_eq!(recovered.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(recovered.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert!(recovered.stats().last_checkpoint_lsn > 0);
}

#[test]
fn encrypted_wal_round_trips_across_reopen() {
    let dir = tempdir().unwrap();
    let heap_path = dir.path().join("heap.db");
    let wal_path = dir.path().join("wal");
    let options = WalOpenOptions { encryption_passphrase: Some("correct horse battery staple".into()), ..WalOpenOptions::default() };

    {
        let heap = Arc::new(HeapFile::open(&heap_path, DEFAULT_PAGE_SIZE).unwrap());
        let wal = Arc::new(Wal::open(&wal_path, options.clone()).unwrap());
        let buffer = Arc::new(BufferPool::new(heap.clone(), wal.clone(), 32));
        let kv = Kv::open(heap, buffer, wal).unwrap();
        kv.put(b"secret", b"payload").unwrap();
    }

    let heap = Arc::new(HeapFile::open(&heap_path, DEFAULT_PAGE_SIZE).unwrap());
    let wal = Arc::new(Wal::open(&wal_path, options).unwrap());
    let buffer = Arc::new(BufferPool::new(heap.clone(), wal.clone(), 32));
    let kv = Kv::open(heap, buffer, wal).unwrap();
    assert_eq!(kv.get(b"secret").unwrap(), Some(b"payload".to_vec()));
}
