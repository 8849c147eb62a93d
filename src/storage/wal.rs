// Write-ahead log.
//
// Append-only, segmented on disk. Each record carries a monotonic LSN and a
// CRC32C over its on-disk bytes. When encryption is enabled the record body
// is sealed with AES-256-GCM; the only clear bytes are a small header
// holding the LSN and the per-record nonce, so the nonce never needs to be
// recovered from ciphertext. The nonce is derived deterministically from
// `(segment_id, byte_offset_in_segment)`, which is unique per record because
// offsets only grow within a segment and segment ids never repeat.
//
// Recovery scans segments from the last checkpoint LSN forward, validating
// CRCs (and AEAD tags, if encrypted) and replaying `Put`/`Delete`/`Commit`
// into the KV layer. A CRC or tag mismatch on the final record of the scan
// truncates the log at that boundary; any such mismatch earlier than the
// tail is a hard corruption error.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};
use crate::storage::buffer::DurabilityOracle;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".wal";
const CHECKPOINT_FILE: &str = "checkpoint";
const KEY_DESCRIPTOR_FILE: &str = "key.descriptor";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum WalOp {
    Put,
    Delete,
    Commit,
    Checkpoint,
    Membership,
    Raft,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct WalRecord {
    pub lsn: u64,
    pub txn_id: u64,
    pub op: WalOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl WalRecord {
    pub fn put(lsn: u64, txn_id: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { lsn, txn_id, op: WalOp::Put, key, value }
    }

    pub fn delete(lsn: u64, txn_id: u64, key: Vec<u8>) -> Self {
        Self { lsn, txn_id, op: WalOp::Delete, key, value: Vec::new() }
    }

    pub fn commit(lsn: u64, txn_id: u64) -> Self {
        Self { lsn, txn_id, op: WalOp::Commit, key: Vec::new(), value: Vec::new() }
    }

    pub fn checkpoint(lsn: u64) -> Self {
        Self { lsn, txn_id: 0, op: WalOp::Checkpoint, key: Vec::new(), value: Vec::new() }
    }

    pub fn membership(lsn: u64, payload: Vec<u8>) -> Self {
        Self { lsn, txn_id: 0, op: WalOp::Membership, key: Vec::new(), value: payload }
    }

    pub fn raft(lsn: u64, payload: Vec<u8>) -> Self {
        Self { lsn, txn_id: 0, op: WalOp::Raft, key: Vec::new(), value: payload }
    }
}

/// Group-commit policy: how eagerly appended records become durable.
#[derive(Debug, Clone, Copy)]
pub enum GroupCommitMode {
    /// fsync after every append.
    PerWrite,
    /// fsync only when the caller explicitly calls `flush`.
    PerBatch,
    /// fsync on a fixed wall-clock cadence, driven by a background task.
    IntervalMillis(u64),
}

/// Salt and KDF parameters for the at-rest encryption key. The raw key is
/// never persisted; it is re-derived from the passphrase on every startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub salt: [u8; 16],
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl KeyDescriptor {
    fn generate() -> Self {
        let mut salt = [0u8; 16];
        rand::rng().fill_bytes(&mut salt);
        Self { salt, m_cost: 19 * 1024, t_cost: 2, p_cost: 1 }
    }

    fn derive_key(&self, passphrase: &str) -> Result<[u8; KEY_LEN]> {
        let params = argon2::Params::new(self.m_cost, self.t_cost, self.p_cost, Some(KEY_LEN))
            .map_err(|e| DbError::Encryption(e.to_string()))?;
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(passphrase.as_bytes(), &self.salt, &mut key)
            .map_err(|e| DbError::Encryption(e.to_string()))?;
        Ok(key)
    }
}

struct Cipher {
    cipher: Aes256Gcm,
}

impl Cipher {
    fn new(key: [u8; KEY_LEN]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)) }
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| DbError::Encryption(e.to_string()))
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| DbError::Encryption(e.to_string()))
    }
}

fn derive_nonce(segment_id: u32, offset: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0..4].copy_from_slice(&segment_id.to_be_bytes());
    nonce[4..12].copy_from_slice(&offset.to_be_bytes());
    nonce
}

fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{id:010}{SEGMENT_SUFFIX}"))
}

fn segment_ids(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix(SEGMENT_PREFIX).and_then(|r| r.strip_suffix(SEGMENT_SUFFIX)) {
            if let Ok(id) = rest.parse::<u32>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

struct Inner {
    segment_id: u32,
    file: File,
    offset: u64,
}

pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    mode: GroupCommitMode,
    cipher: Option<Cipher>,
    inner: Mutex<Inner>,
    next_lsn: AtomicU64,
    durable_lsn: AtomicU64,
    checkpoint_lsn: AtomicU64,
    next_segment_id: AtomicU32,
}

#[derive(Clone)]
pub struct WalOpenOptions {
    pub segment_size: u64,
    pub mode: GroupCommitMode,
    pub encryption_passphrase: Option<String>,
}

impl Default for WalOpenOptions {
    fn default() -> Self {
        Self {
            segment_size: 16 * 1024 * 1024,
            mode: GroupCommitMode::PerBatch,
            encryption_passphrase: None,
        }
    }
}

impl Wal {
    pub fn open(dir: impl AsRef<Path>, opts: WalOpenOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let cipher = match &opts.encryption_passphrase {
            None => None,
            Some(passphrase) => {
                let descriptor_path = dir.join(KEY_DESCRIPTOR_FILE);
                let descriptor = if descriptor_path.exists() {
                    let bytes = fs::read(&descriptor_path)?;
                    serde_json::from_slice::<KeyDescriptor>(&bytes)
                        .map_err(|e| DbError::Encryption(e.to_string()))?
                } else {
                    let descriptor = KeyDescriptor::generate();
                    fs::write(
                        &descriptor_path,
                        serde_json::to_vec(&descriptor).expect("descriptor serializes"),
                    )?;
                    descriptor
                };
                let key = descriptor.derive_key(passphrase)?;
                Some(Cipher::new(key))
            }
        };

        let mut ids = segment_ids(&dir)?;
        let checkpoint_lsn = read_checkpoint(&dir)?;

        let (segment_id, file, offset) = if let Some(&last) = ids.last() {
            let path = segment_path(&dir, last);
            let file = OpenOptions::new().read(true).append(true).open(&path)?;
            let offset = file.metadata()?.len();
            (last, file, offset)
        } else {
            let id = 0;
            ids.push(id);
            let path = segment_path(&dir, id);
            let file = OpenOptions::new().read(true).append(true).create(true).open(&path)?;
            (id, file, 0)
        };

        let next_lsn = scan_max_lsn(&dir, &ids, cipher.as_ref())?.map(|m| m + 1).unwrap_or(1);

        Ok(Self {
            dir,
            segment_size: opts.segment_size,
            mode: opts.mode,
            cipher,
            inner: Mutex::new(Inner { segment_id, file, offset }),
            next_lsn: AtomicU64::new(next_lsn),
            durable_lsn: AtomicU64::new(next_lsn.saturating_sub(1)),
            checkpoint_lsn: AtomicU64::new(checkpoint_lsn),
            next_segment_id: AtomicU32::new(segment_id + 1),
        })
    }

    pub fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn.load(Ordering::Acquire)
    }

    /// Append a record, assigning it the next monotonic LSN. Returns the LSN.
    pub fn append(&self, mut record: WalRecord) -> Result<u64> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::AcqRel);
        record.lsn = lsn;
        let body = bincode::encode_to_vec(&record, bincode::config::standard())?;

        let mut inner = self.inner.lock();
        if inner.offset >= self.segment_size {
            self.roll_segment(&mut inner)?;
        }

        let nonce = derive_nonce(inner.segment_id, inner.offset);
        let sealed = match &self.cipher {
            Some(cipher) => cipher.seal(&nonce, &body)?,
            None => body,
        };

        let mut frame = Vec::with_capacity(8 + NONCE_LEN + 1 + 4 + sealed.len() + 4);
        frame.extend_from_slice(&lsn.to_be_bytes());
        frame.extend_from_slice(&nonce);
        frame.push(self.cipher.is_some() as u8);
        frame.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&sealed);
        let crc = crc32c::crc32c(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());

        inner.file.write_all(&frame)?;
        inner.offset += frame.len() as u64;

        if matches!(self.mode, GroupCommitMode::PerWrite) {
            inner.file.sync_data()?;
            self.durable_lsn.store(lsn, Ordering::Release);
        }

        Ok(lsn)
    }

    fn roll_segment(&self, inner: &mut Inner) -> Result<()> {
        inner.file.sync_data()?;
        let id = self.next_segment_id.fetch_add(1, Ordering::AcqRel);
        let path = segment_path(&self.dir, id);
        let file = OpenOptions::new().read(true).append(true).create(true).open(&path)?;
        inner.segment_id = id;
        inner.file = file;
        inner.offset = 0;
        Ok(())
    }

    /// Record a checkpoint at `lsn` and persist the low watermark.
    pub fn checkpoint(&self, lsn: u64) -> Result<()> {
        self.append(WalRecord::checkpoint(lsn))?;
        self.flush()?;
        fs::write(self.dir.join(CHECKPOINT_FILE), lsn.to_be_bytes())?;
        self.checkpoint_lsn.store(lsn, Ordering::Release);
        Ok(())
    }

    /// Replay every record at or after the checkpoint LSN, in LSN order. A
    /// segment that ends mid-write (too few trailing bytes for a full frame)
    /// truncates the scan at that point, since that's the expected shape of
    /// an unclean shutdown. A full-length frame that fails its checksum,
    /// decryption, or decode is corruption rather than truncation and is a
    /// hard error, since enough bytes were written for a complete record and
    /// something other than an incomplete write damaged it.
    pub fn recover(&self) -> Result<Vec<WalRecord>> {
        let ids = segment_ids(&self.dir)?;
        let checkpoint = self.checkpoint_lsn();
        let mut records = Vec::new();
        for id in ids {
            let bytes = fs::read(segment_path(&self.dir, id))?;
            let parsed = parse_segment(&bytes, self.cipher.as_ref())?;
            for record in parsed {
                if record.lsn >= checkpoint {
                    records.push(record);
                }
            }
        }
        records.sort_by_key(|r| r.lsn);
        Ok(records)
    }
}

impl DurabilityOracle for Wal {
    fn durable_lsn(&self) -> u64 {
        self.durable_lsn.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_data()?;
        let lsn = self.next_lsn.load(Ordering::Acquire).saturating_sub(1);
        self.durable_lsn.store(lsn, Ordering::Release);
        Ok(())
    }
}

fn read_checkpoint(dir: &Path) -> Result<u64> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Ok(0);
    }
    let bytes = fs::read(path)?;
    if bytes.len() != 8 {
        return Ok(0);
    }
    Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
}

/// One parsed record, or a benign tail truncation (too few bytes left for a
/// full frame). A full-length frame that fails validation is not
/// represented here; it returns an `Err` directly.
enum ParseOutcome {
    Record(WalRecord, usize),
    TailTruncated,
}

fn parse_one(bytes: &[u8], cipher: Option<&Cipher>) -> Result<ParseOutcome> {
    const HEADER: usize = 8 + NONCE_LEN + 1 + 4;
    if bytes.len() < HEADER {
        return Ok(ParseOutcome::TailTruncated);
    }
    let lsn = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let nonce: [u8; NONCE_LEN] = bytes[8..8 + NONCE_LEN].try_into().unwrap();
    let encrypted = bytes[8 + NONCE_LEN] != 0;
    let len_off = 8 + NONCE_LEN + 1;
    let body_len = u32::from_be_bytes(bytes[len_off..len_off + 4].try_into().unwrap()) as usize;
    let body_off = len_off + 4;
    if bytes.len() < body_off + body_len + 4 {
        return Ok(ParseOutcome::TailTruncated);
    }
    // From here on the buffer holds a complete, full-length frame: any
    // failure is corruption in an already-fully-written record, not an
    // incomplete tail write, so it surfaces as a hard error instead of
    // silently truncating the replay.
    let frame_end = body_off + body_len + 4;
    let crc_stored = u32::from_be_bytes(bytes[body_off + body_len..frame_end].try_into().unwrap());
    let crc_computed = crc32c::crc32c(&bytes[..body_off + body_len]);
    if crc_stored != crc_computed {
        return Err(DbError::ChecksumMismatch(format!("wal record at lsn {lsn} failed its checksum")));
    }

    let sealed = &bytes[body_off..body_off + body_len];
    let plaintext = match (encrypted, cipher) {
        (true, Some(cipher)) => match cipher.open(&nonce, sealed) {
            Ok(p) => p,
            Err(_) => return Err(DbError::Encryption(format!("wal record at lsn {lsn} failed to decrypt"))),
        },
        (true, None) => return Err(DbError::Encryption("record encrypted but no key configured".into())),
        (false, _) => sealed.to_vec(),
    };

    let (record, _): (WalRecord, usize) =
        match bincode::decode_from_slice(&plaintext, bincode::config::standard()) {
            Ok(v) => v,
            Err(e) => return Err(DbError::Corruption(format!("wal record at lsn {lsn} failed to decode: {e}"))),
        };
    debug_assert_eq!(record.lsn, lsn);
    Ok(ParseOutcome::Record(record, frame_end))
}

fn parse_segment(bytes: &[u8], cipher: Option<&Cipher>) -> Result<Vec<WalRecord>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        match parse_one(&bytes[pos..], cipher)? {
            ParseOutcome::Record(record, consumed) => {
                out.push(record);
                pos += consumed;
            }
            ParseOutcome::TailTruncated => break,
        }
    }
    Ok(out)
}

fn scan_max_lsn(dir: &Path, ids: &[u32], cipher: Option<&Cipher>) -> Result<Option<u64>> {
    let mut max_lsn = None;
    for &id in ids {
        let path = segment_path(dir, id);
        if !path.exists() {
            continue;
        }
        let bytes = fs::read(path)?;
        for record in parse_segment(&bytes, cipher)? {
            max_lsn = Some(max_lsn.map_or(record.lsn, |m: u64| m.max(record.lsn)));
        }
    }
    Ok(max_lsn)
}

/// Spawn a background task that calls `flush` on a fixed interval, for
/// `GroupCommitMode::IntervalMillis`. The returned handle can be aborted on
/// shutdown.
pub fn spawn_group_commit(wal: std::sync::Arc<Wal>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = wal.flush() {
                tracing::warn!(error = %e, "group commit flush failed");
            }
        }
    })
}

pub fn mode_from_config(interval_ms: Option<u64>, per_write: bool) -> GroupCommitMode {
    match (per_write, interval_ms) {
        (true, _) => GroupCommitMode::PerWrite,
        (false, Some(ms)) => GroupCommitMode::IntervalMillis(ms),
        (false, None) => GroupCommitMode::PerBatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_recover_round_trip() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), WalOpenOptions::default()).unwrap();
        wal.append(WalRecord::put(0, 1, b"k1".to_vec(), b"v1".to_vec())).unwrap();
        wal.append(WalRecord::delete(0, 1, b"k2".to_vec())).unwrap();
        wal.flush().unwrap();

        let records = wal.recover().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, WalOp::Put);
        assert_eq!(records[1].op, WalOp::Delete);
    }

    #[test]
    fn encrypted_records_round_trip() {
        let dir = tempdir().unwrap();
        let opts = WalOpenOptions {
            encryption_passphrase: Some("correct horse battery staple".into()),
            ..Default::default()
        };
        let wal = Wal::open(dir.path(), opts).unwrap();
        wal.append(WalRecord::put(0, 1, b"secret-key".to_vec(), b"secret-value".to_vec())).unwrap();
        wal.flush().unwrap();

        let records = wal.recover().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"secret-key");
        assert_eq!(records[0].value, b"secret-value");
    }

    #[test]
    fn truncated_tail_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), WalOpenOptions::default()).unwrap();
        wal.append(WalRecord::put(0, 1, b"k".to_vec(), b"v".to_vec())).unwrap();
        wal.flush().unwrap();
        drop(wal);

        // simulate a crash mid-write: append a few garbage bytes after the last record
        let ids = segment_ids(dir.path()).unwrap();
        let path = segment_path(dir.path(), ids[0]);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();

        let wal2 = Wal::open(dir.path(), WalOpenOptions::default()).unwrap();
        let records = wal2.recover().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn corrupt_full_length_frame_is_a_hard_error() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), WalOpenOptions::default()).unwrap();
        wal.append(WalRecord::put(0, 1, b"k1".to_vec(), b"v1".to_vec())).unwrap();
        wal.append(WalRecord::put(0, 1, b"k2".to_vec(), b"v2".to_vec())).unwrap();
        wal.flush().unwrap();
        drop(wal);

        // Flip a byte inside the first record's body. The frame is still
        // full-length (a second valid-looking record follows it), so this
        // must surface as an error rather than silently truncate replay.
        let ids = segment_ids(dir.path()).unwrap();
        let path = segment_path(dir.path(), ids[0]);
        let mut bytes = fs::read(&path).unwrap();
        let flip_at = 8 + NONCE_LEN + 1 + 4 + 2;
        bytes[flip_at] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let wal2 = Wal::open(dir.path(), WalOpenOptions::default()).unwrap();
        let err = wal2.recover().unwrap_err();
        assert!(matches!(err, DbError::ChecksumMismatch(_) | DbError::Corruption(_)));
    }

    #[test]
    fn durable_lsn_tracks_flush() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), WalOpenOptions::default()).unwrap();
        assert_eq!(wal.durable_lsn(), 0);
        wal.append(WalRecord::commit(0, 1)).unwrap();
        assert_eq!(wal.durable_lsn(), 0);
        wal.flush().unwrap();
        assert_eq!(wal.durable_lsn(), 1);
    }
}
