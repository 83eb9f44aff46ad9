//! Durable, file-backed log store.
//!
//! `FileLog` implements the `LogStore` contract over a single append-only
//! file of CRC-framed records. Appends are funneled through a dedicated
//! worker thread that coalesces concurrent requests into batches and fsyncs
//! before acknowledging, so a successful `append` is durable. A torn tail
//! frame left by a crash is discarded on reopen. The (term, voted-for) hard
//! state and the latest snapshot live in small sibling files replaced
//! atomically via temp-file rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use std::{env, thread};

use anyhow::Context;
use crc32fast::Hasher;

use chain_raft::raft::{
    HardState, LogEntry, LogIndex, LogStore, SnapshotHandle, SnapshotStore, Term,
};

const LOG_FILE: &str = "log.bin";
const HARD_STATE_FILE: &str = "hard_state.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Default maximum number of appends coalesced into one write+fsync.
const WAL_BATCH_MAX: usize = 64;
/// Default batching window for appends (microseconds).
const WAL_BATCH_WAIT_US: u64 = 200;

/// Snapshot of WAL performance statistics for logging/monitoring.
#[derive(Default, Debug, Clone, Copy)]
pub struct WalStatsSnapshot {
    pub fsync_count: u64,
    pub fsync_total_us: u64,
    pub fsync_max_us: u64,
    pub batch_count: u64,
    pub batch_items: u64,
    pub batch_max_items: u64,
    pub batch_total_bytes: u64,
    pub batch_max_bytes: u64,
}

/// Internal counters used to build `WalStatsSnapshot`.
#[derive(Default)]
struct WalStats {
    fsync_count: AtomicU64,
    fsync_total_us: AtomicU64,
    fsync_max_us: AtomicU64,
    batch_count: AtomicU64,
    batch_items: AtomicU64,
    batch_max_items: AtomicU64,
    batch_total_bytes: AtomicU64,
    batch_max_bytes: AtomicU64,
}

impl WalStats {
    fn record_fsync(&self, dur: Duration) {
        let us = dur.as_micros().min(u128::from(u64::MAX)) as u64;
        self.fsync_count.fetch_add(1, Ordering::Relaxed);
        self.fsync_total_us.fetch_add(us, Ordering::Relaxed);
        self.fsync_max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn record_batch(&self, items: u64, bytes: u64) {
        self.batch_count.fetch_add(1, Ordering::Relaxed);
        self.batch_items.fetch_add(items, Ordering::Relaxed);
        self.batch_max_items.fetch_max(items, Ordering::Relaxed);
        self.batch_total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.batch_max_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    /// Return the current snapshot and reset counters.
    fn snapshot_and_reset(&self) -> WalStatsSnapshot {
        WalStatsSnapshot {
            fsync_count: self.fsync_count.swap(0, Ordering::Relaxed),
            fsync_total_us: self.fsync_total_us.swap(0, Ordering::Relaxed),
            fsync_max_us: self.fsync_max_us.swap(0, Ordering::Relaxed),
            batch_count: self.batch_count.swap(0, Ordering::Relaxed),
            batch_items: self.batch_items.swap(0, Ordering::Relaxed),
            batch_max_items: self.batch_max_items.swap(0, Ordering::Relaxed),
            batch_total_bytes: self.batch_total_bytes.swap(0, Ordering::Relaxed),
            batch_max_bytes: self.batch_max_bytes.swap(0, Ordering::Relaxed),
        }
    }
}

/// Sync strategy applied after each write batch.
#[derive(Clone, Copy, Debug)]
enum SyncMode {
    None,
    Data,
    All,
}

/// Single append work item sent to the WAL worker.
struct AppendWork {
    payload: Vec<u8>,
    resp: mpsc::Sender<anyhow::Result<()>>,
}

/// File-backed `LogStore` with a dedicated append worker thread.
pub struct FileLog {
    entries: Mutex<Vec<LogEntry>>,
    hard_state_path: PathBuf,
    tx: mpsc::Sender<AppendWork>,
    stats: Arc<WalStats>,
}

impl FileLog {
    /// Open or create a log directory, recover the entry mirror (discarding
    /// any torn tail frame), and spawn the append worker.
    ///
    /// Batching and sync behavior read env overrides: `CHAIN_WAL_SYNC`
    /// (`none`/`data`/`all`, default `data`), `CHAIN_WAL_BATCH_MAX`, and
    /// `CHAIN_WAL_BATCH_WAIT_US`.
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create log dir")?;
        let log_path = dir.join(LOG_FILE);

        let entries = recover_entries(&log_path)?;

        let sync_mode = parse_sync_mode(env::var("CHAIN_WAL_SYNC").ok().as_deref());
        let batch_max = read_env_usize("CHAIN_WAL_BATCH_MAX", WAL_BATCH_MAX).max(1);
        let batch_wait =
            Duration::from_micros(read_env_u64("CHAIN_WAL_BATCH_WAIT_US", WAL_BATCH_WAIT_US));

        let stats = Arc::new(WalStats::default());
        let file = open_for_append(&log_path).context("open log for append")?;
        let (tx, rx) = mpsc::channel();
        let worker_stats = stats.clone();
        thread::Builder::new()
            .name("chain-wal".to_string())
            .spawn(move || wal_worker(file, rx, sync_mode, batch_max, batch_wait, worker_stats))
            .context("spawn wal worker")?;

        Ok(Self {
            entries: Mutex::new(entries),
            hard_state_path: dir.join(HARD_STATE_FILE),
            tx,
            stats,
        })
    }

    /// Fetch and reset WAL stats for logging/monitoring.
    pub fn stats_snapshot(&self) -> WalStatsSnapshot {
        self.stats.snapshot_and_reset()
    }
}

impl LogStore for FileLog {
    fn append(&self, entry: &LogEntry) -> anyhow::Result<u64> {
        // The mirror lock is held across the worker round-trip so file order
        // always matches mirror order; the store is single-writer anyway.
        let mut entries = self.entries.lock().expect("file log lock");
        if let Some(last) = entries.last() {
            anyhow::ensure!(
                entry.index > last.index,
                "append out of order: {} after {}",
                entry.index,
                last.index
            );
        }

        let payload = serde_json::to_vec(entry).context("encode log entry")?;
        let (resp_tx, resp_rx) = mpsc::channel();
        self.tx
            .send(AppendWork {
                payload,
                resp: resp_tx,
            })
            .map_err(|_| anyhow::anyhow!("wal worker closed"))?;
        resp_rx.recv().context("wal append response dropped")??;

        let offset = entries.len() as u64;
        entries.push(entry.clone());
        Ok(offset)
    }

    fn read_range(&self, from: LogIndex, to: LogIndex) -> anyhow::Result<Vec<LogEntry>> {
        let entries = self.entries.lock().expect("file log lock");
        Ok(entries
            .iter()
            .filter(|e| e.index >= from && e.index <= to)
            .cloned()
            .collect())
    }

    fn last_index(&self) -> anyhow::Result<Option<LogIndex>> {
        Ok(self
            .entries
            .lock()
            .expect("file log lock")
            .last()
            .map(|e| e.index))
    }

    fn last_term(&self) -> anyhow::Result<Option<Term>> {
        Ok(self
            .entries
            .lock()
            .expect("file log lock")
            .last()
            .map(|e| e.term))
    }

    fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(hs).context("encode hard state")?;
        write_atomic(&self.hard_state_path, &payload).context("persist hard state")
    }

    fn load_hard_state(&self) -> anyhow::Result<Option<HardState>> {
        read_optional_json(&self.hard_state_path)
    }
}

/// Durable home for the latest snapshot, replaced atomically on save.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create snapshot dir")?;
        Ok(Self {
            path: dir.join(SNAPSHOT_FILE),
        })
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &SnapshotHandle) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(snapshot).context("encode snapshot")?;
        write_atomic(&self.path, &payload).context("persist snapshot")
    }

    fn load(&self) -> anyhow::Result<Option<SnapshotHandle>> {
        read_optional_json(&self.path)
    }
}

/// Worker loop: coalesce appends into batches, write, fsync, then ack.
///
/// The fsync happens before any acknowledgment leaves the worker; group
/// commit amortizes its cost over the batch without weakening the
/// durability contract.
fn wal_worker(
    mut file: File,
    rx: mpsc::Receiver<AppendWork>,
    sync_mode: SyncMode,
    batch_max: usize,
    batch_wait: Duration,
    stats: Arc<WalStats>,
) {
    loop {
        let first = match rx.recv() {
            Ok(work) => work,
            Err(_) => return,
        };

        let mut batch = Vec::with_capacity(batch_max);
        batch.push(first);
        if batch_max > 1 {
            let deadline = if batch_wait.is_zero() {
                None
            } else {
                Some(Instant::now() + batch_wait)
            };
            while batch.len() < batch_max {
                match rx.try_recv() {
                    Ok(work) => {
                        batch.push(work);
                        continue;
                    }
                    Err(mpsc::TryRecvError::Empty) => {}
                    Err(mpsc::TryRecvError::Disconnected) => break,
                }
                let Some(deadline) = deadline else {
                    break;
                };
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match rx.recv_timeout(deadline.saturating_duration_since(now)) {
                    Ok(work) => batch.push(work),
                    Err(_) => break,
                }
            }
        }

        let mut result: std::io::Result<()> = Ok(());
        let mut bytes = 0u64;
        for work in &batch {
            if result.is_ok() {
                result = write_record(&mut file, &work.payload);
                bytes += work.payload.len() as u64 + 8;
            }
        }
        if result.is_ok() {
            result = file.flush().and_then(|()| sync_file(&file, sync_mode, &stats));
        }
        if result.is_ok() {
            stats.record_batch(batch.len() as u64, bytes);
        }

        let err_msg = result.err().map(|err| err.to_string());
        for work in batch {
            let res = match &err_msg {
                None => Ok(()),
                Some(msg) => Err(anyhow::anyhow!(msg.clone())),
            };
            let _ = work.resp.send(res);
        }
    }
}

/// Write a single length-prefixed record with CRC32 checksum.
fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

/// Read every intact record from the log file, truncating a torn tail.
///
/// Only the tail may legitimately be damaged (a crash mid-write); the file
/// is cut back to the last intact frame so subsequent appends continue from
/// a clean boundary.
fn recover_entries(path: &Path) -> anyhow::Result<Vec<LogEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).context("open log for recovery"),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut good_bytes = 0u64;
    let mut torn = false;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("read log frame header"),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        let mut payload = vec![0u8; len];
        let frame_ok = reader.read_exact(&mut crc_buf).is_ok()
            && reader.read_exact(&mut payload).is_ok();
        if !frame_ok {
            torn = true;
            break;
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != u32::from_be_bytes(crc_buf) {
            torn = true;
            break;
        }
        let entry: LogEntry = match serde_json::from_slice(&payload) {
            Ok(entry) => entry,
            Err(_) => {
                torn = true;
                break;
            }
        };
        good_bytes += 8 + len as u64;
        entries.push(entry);
    }

    if torn {
        tracing::warn!(offset = good_bytes, "discarding torn log tail");
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .context("open log for truncate")?;
        file.set_len(good_bytes).context("truncate torn tail")?;
        file.sync_all().context("sync truncated log")?;
    }

    Ok(entries)
}

fn open_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Replace `path` atomically: write a temp sibling, fsync, rename.
fn write_atomic(path: &Path, payload: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)
        .context("open temp file")?;
    file.write_all(payload).context("write temp file")?;
    file.sync_all().context("sync temp file")?;
    fs::rename(&tmp, path).context("rename temp file")?;
    Ok(())
}

fn read_optional_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let payload = match fs::read(path) {
        Ok(payload) => payload,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("read state file"),
    };
    Ok(Some(serde_json::from_slice(&payload).context("decode state file")?))
}

fn sync_file(file: &File, mode: SyncMode, stats: &WalStats) -> std::io::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::Data => {
            let start = Instant::now();
            let res = file.sync_data();
            stats.record_fsync(start.elapsed());
            res
        }
        SyncMode::All => {
            let start = Instant::now();
            let res = file.sync_all();
            stats.record_fsync(start.elapsed());
            res
        }
    }
}

/// Parse the requested sync mode; unknown strings fall back to the safest.
fn parse_sync_mode(value: Option<&str>) -> SyncMode {
    match value.map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "none" => SyncMode::None,
        Some(v) if v == "data" => SyncMode::Data,
        Some(v) if v == "all" => SyncMode::All,
        Some(_) => SyncMode::All,
        None => SyncMode::Data,
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use chain_raft::raft::{AccessKeys, Batch, Transaction};

    fn entry(term: Term, index: LogIndex) -> LogEntry {
        let tx = Transaction::new(
            AccessKeys {
                reads: vec![],
                writes: vec![index.to_le_bytes().to_vec()],
            },
            index.to_le_bytes().to_vec(),
            vec![],
        );
        LogEntry {
            term,
            index,
            batch: Batch::new(1, term, vec![tx]),
        }
    }

    #[test]
    fn entries_and_hard_state_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open_dir(dir.path()).unwrap();
            for i in 1..=3 {
                log.append(&entry(1, i)).unwrap();
            }
            log.save_hard_state(&HardState {
                term: 4,
                voted_for: Some(2),
            })
            .unwrap();
        }

        let log = FileLog::open_dir(dir.path()).unwrap();
        assert_eq!(log.last_index().unwrap(), Some(3));
        assert_eq!(log.last_term().unwrap(), Some(1));
        let range = log.read_range(2, 3).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].index, 2);
        assert_eq!(
            log.load_hard_state().unwrap(),
            Some(HardState {
                term: 4,
                voted_for: Some(2),
            })
        );
    }

    #[test]
    fn torn_tail_is_discarded_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open_dir(dir.path()).unwrap();
            log.append(&entry(1, 1)).unwrap();
            log.append(&entry(1, 2)).unwrap();
        }

        // Simulate a crash mid-write: a frame header with no payload.
        let log_path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[0, 0, 1, 0, 0xde, 0xad]).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let log = FileLog::open_dir(dir.path()).unwrap();
        assert_eq!(log.last_index().unwrap(), Some(2));
        // The log accepts appends again after the tail was cut.
        log.append(&entry(2, 3)).unwrap();
        drop(log);

        let log = FileLog::open_dir(dir.path()).unwrap();
        assert_eq!(log.last_index().unwrap(), Some(3));
    }

    #[test]
    fn corrupted_tail_checksum_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open_dir(dir.path()).unwrap();
            log.append(&entry(1, 1)).unwrap();
        }

        // A full frame whose checksum does not match its payload.
        let log_path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        let payload = b"garbage";
        file.write_all(&(payload.len() as u32).to_be_bytes()).unwrap();
        file.write_all(&0xdead_beefu32.to_be_bytes()).unwrap();
        file.write_all(payload).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let log = FileLog::open_dir(dir.path()).unwrap();
        assert_eq!(log.last_index().unwrap(), Some(1));
    }

    #[test]
    fn out_of_order_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open_dir(dir.path()).unwrap();
        log.append(&entry(1, 5)).unwrap();
        assert!(log.append(&entry(1, 4)).is_err());
        // Gaps above the last index are allowed (post-snapshot appends).
        log.append(&entry(2, 9)).unwrap();
        assert_eq!(log.last_index().unwrap(), Some(9));
    }

    #[test]
    fn snapshot_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open_dir(dir.path()).unwrap();
        assert!(store.load().unwrap().is_none());

        store
            .save(&SnapshotHandle {
                last_included_index: 12,
                last_included_term: 3,
                state: b"state".to_vec(),
            })
            .unwrap();

        let store = FileSnapshotStore::open_dir(dir.path()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.last_included_index, 12);
        assert_eq!(loaded.last_included_term, 3);
        assert_eq!(loaded.state, b"state");
    }

    #[test]
    fn stats_track_batches_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open_dir(dir.path()).unwrap();
        log.append(&entry(1, 1)).unwrap();
        let stats = log.stats_snapshot();
        assert!(stats.batch_count >= 1);
        assert!(stats.batch_items >= 1);
        // Counters reset on snapshot.
        assert_eq!(log.stats_snapshot().batch_count, 0);
    }
}
