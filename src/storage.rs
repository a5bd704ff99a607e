//! History persistence: interesting frames saved to disk and indexed in SQLite.
//!
//! The streaming path never waits on storage. Delivery loops hand encoded
//! frames to a `PersistenceWorker` through a bounded queue; the worker writes
//! the JPEG under the history directory and then records it through a
//! `PersistenceSink`. A full queue drops the job with a warning.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{SendError, Sender, TrySendError};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::StreamError;
use crate::worker::{JoinOutcome, Worker};
use crate::{now_s, open_db_connection, random_hex};

/// Default depth of the persistence queue.
pub const PERSIST_QUEUE_DEPTH: usize = 64;

pub trait PersistenceSink: Send + Sync {
    /// Record that `image_path` holds a frame showing `categories`.
    fn persist(&self, image_path: &Path, categories: &[String], session_id: &str) -> Result<()>;
}

impl<S: PersistenceSink + ?Sized> PersistenceSink for Arc<S> {
    fn persist(&self, image_path: &Path, categories: &[String], session_id: &str) -> Result<()> {
        (**self).persist(image_path, categories, session_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub session_id: String,
    pub categories: Vec<String>,
    pub src: String,
    pub created_at: u64,
}

// ----------------------------------------------------------------------------
// SQLite sink
// ----------------------------------------------------------------------------

pub struct SqliteHistorySink {
    conn: Mutex<Connection>,
}

impl SqliteHistorySink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("opening history database {}", db_path))?;
        let sink = Self {
            conn: Mutex::new(conn),
        };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS history (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              categories TEXT NOT NULL,
              src TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_created ON history(created_at);
            "#,
        )?;
        Ok(())
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, categories, src, created_at FROM history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let categories: String = row.get(2)?;
            let created_at: i64 = row.get(4)?;
            Ok(HistoryRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                categories: split_categories(&categories),
                src: row.get(3)?,
                created_at: created_at.max(0) as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

impl PersistenceSink for SqliteHistorySink {
    fn persist(&self, image_path: &Path, categories: &[String], session_id: &str) -> Result<()> {
        let created_at = i64::try_from(now_s()?).context("timestamp exceeds i64 range")?;
        self.conn().execute(
            "INSERT INTO history(session_id, categories, src, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session_id,
                categories.join(","),
                image_path.to_string_lossy(),
                created_at
            ],
        )?;
        Ok(())
    }
}

fn split_categories(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ----------------------------------------------------------------------------
// In-memory sink
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PersistenceSink for MemorySink {
    fn persist(&self, image_path: &Path, categories: &[String], session_id: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let id = records.len() as i64 + 1;
        records.push(HistoryRecord {
            id,
            session_id: session_id.to_string(),
            categories: categories.to_vec(),
            src: image_path.to_string_lossy().into_owned(),
            created_at: now_s()?,
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Persistence worker
// ----------------------------------------------------------------------------

/// One encoded frame waiting to be stored.
#[derive(Debug)]
pub struct PersistenceJob {
    pub session_id: String,
    pub categories: Vec<String>,
    pub jpeg: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceStats {
    pub written: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PersistenceStats {
        PersistenceStats {
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable submit side of the persistence queue.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: Sender<PersistenceJob>,
    counters: Arc<Counters>,
}

impl PersistenceHandle {
    /// Queue a job without waiting. Returns false when it was dropped.
    pub fn try_submit(&self, job: PersistenceJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "persistence queue full; dropping frame from session {}",
                    job.session_id
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("persistence worker stopped; dropping frame");
                false
            }
        }
    }

    /// Queue a job, waiting for room. For callers that must not lose
    /// entries and are allowed to block. Returns false once the worker is gone.
    pub fn submit(&self, job: PersistenceJob) -> bool {
        match self.tx.send(job) {
            Ok(()) => true,
            Err(SendError(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "persistence worker stopped; dropping frame from session {}",
                    job.session_id
                );
                false
            }
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        self.counters.snapshot()
    }
}

pub struct PersistenceWorker {
    handle: Option<PersistenceHandle>,
    counters: Arc<Counters>,
    worker: Worker<()>,
}

impl PersistenceWorker {
    pub fn spawn(
        history_dir: impl Into<PathBuf>,
        sink: Arc<dyn PersistenceSink>,
        depth: usize,
    ) -> Result<Self> {
        let history_dir = history_dir.into();
        fs::create_dir_all(&history_dir)
            .with_context(|| format!("creating history dir {}", history_dir.display()))?;

        let (tx, rx) = crossbeam_channel::bounded::<PersistenceJob>(depth.max(1));
        let counters = Arc::new(Counters::default());
        let thread_counters = counters.clone();
        let worker = Worker::spawn("persistence", move || {
            // Ends once every handle is dropped.
            for job in rx {
                match store_job(&history_dir, sink.as_ref(), &job) {
                    Ok(path) => {
                        thread_counters.written.fetch_add(1, Ordering::Relaxed);
                        log::debug!("saved {} ({})", path.display(), job.categories.join(","));
                    }
                    Err(err) => {
                        thread_counters.failed.fetch_add(1, Ordering::Relaxed);
                        let err = StreamError::Persistence(format!("{:#}", err));
                        log::error!("session {}: {}", job.session_id, err);
                    }
                }
            }
        })
        .context("spawning persistence worker")?;

        Ok(Self {
            handle: Some(PersistenceHandle {
                tx,
                counters: counters.clone(),
            }),
            counters,
            worker,
        })
    }

    /// A submit handle. `None` after shutdown.
    pub fn handle(&self) -> Option<PersistenceHandle> {
        self.handle.clone()
    }

    pub fn stats(&self) -> PersistenceStats {
        self.counters.snapshot()
    }

    /// Close the queue and wait up to `timeout` for pending jobs to finish.
    /// Jobs still held by outstanding handles keep the worker alive until
    /// those handles drop.
    pub fn shutdown(&mut self, timeout: Duration) {
        self.handle = None;
        if let JoinOutcome::Panicked = self.worker.join_timeout(timeout) {
            log::error!("persistence worker panicked");
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(2));
    }
}

fn store_job(dir: &Path, sink: &dyn PersistenceSink, job: &PersistenceJob) -> Result<PathBuf> {
    let path = dir.join(history_file_name(now_s()?));
    fs::write(&path, &job.jpeg).with_context(|| format!("writing {}", path.display()))?;
    sink.persist(&path, &job.categories, &job.session_id)?;
    Ok(path)
}

fn history_file_name(epoch_s: u64) -> String {
    format!("{}_{}.jpg", epoch_s, random_hex(8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn job(session: &str) -> PersistenceJob {
        PersistenceJob {
            session_id: session.to_string(),
            categories: vec!["bird".into(), "person".into()],
            jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
        }
    }

    #[test]
    fn sqlite_sink_round_trips_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("history.db");
        let sink = SqliteHistorySink::open(db.to_str().expect("utf8 path"))?;
        sink.persist(Path::new("/tmp/a.jpg"), &["bird".into()], "s1")?;
        sink.persist(Path::new("/tmp/b.jpg"), &["bird".into(), "bottle".into()], "s2")?;

        assert_eq!(sink.count()?, 2);
        let recent = sink.recent(10)?;
        assert_eq!(recent[0].session_id, "s2");
        assert_eq!(recent[0].categories, vec!["bird", "bottle"]);
        assert_eq!(recent[1].src, "/tmp/a.jpg");
        Ok(())
    }

    #[test]
    fn history_file_name_has_epoch_and_hex16() {
        let name = history_file_name(1_700_000_000);
        let (epoch, rest) = name.split_once('_').expect("separator");
        assert_eq!(epoch, "1700000000");
        let hex_part = rest.strip_suffix(".jpg").expect("jpg suffix");
        assert_eq!(hex_part.len(), 16);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn worker_writes_file_and_records_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(MemorySink::new());
        let mut worker = PersistenceWorker::spawn(dir.path(), sink.clone(), 4)?;
        let handle = worker.handle().expect("handle");
        assert!(handle.try_submit(job("live-1")));
        drop(handle);

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.records().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.shutdown(Duration::from_secs(2));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].categories, vec!["bird", "person"]);
        let saved = PathBuf::from(&records[0].src);
        assert!(saved.starts_with(dir.path()));
        assert_eq!(fs::read(saved)?, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(worker.stats().written, 1);
        Ok(())
    }

    struct BlockingSink(crossbeam_channel::Receiver<()>);

    impl PersistenceSink for BlockingSink {
        fn persist(&self, _: &Path, _: &[String], _: &str) -> Result<()> {
            let _ = self.0.recv_timeout(Duration::from_secs(5));
            Ok(())
        }
    }

    #[test]
    fn full_queue_drops_without_blocking() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let mut worker =
            PersistenceWorker::spawn(dir.path(), Arc::new(BlockingSink(release_rx)), 1)?;
        let handle = worker.handle().expect("handle");

        let started = Instant::now();
        let accepted = (0..10).filter(|_| handle.try_submit(job("s"))).count();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(accepted <= 2, "one in flight plus one queued at most");
        assert!(handle.stats().dropped >= 8);

        drop(handle);
        for _ in 0..10 {
            let _ = release_tx.send(());
        }
        worker.shutdown(Duration::from_secs(2));
        Ok(())
    }

    struct SlowSink {
        inner: MemorySink,
        delay: Duration,
    }

    impl PersistenceSink for SlowSink {
        fn persist(&self, image_path: &Path, categories: &[String], session_id: &str) -> Result<()> {
            std::thread::sleep(self.delay);
            self.inner.persist(image_path, categories, session_id)
        }
    }

    #[test]
    fn blocking_submit_keeps_every_job() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(SlowSink {
            inner: MemorySink::new(),
            delay: Duration::from_millis(3),
        });
        let mut worker = PersistenceWorker::spawn(dir.path(), sink.clone(), 1)?;
        let handle = worker.handle().expect("handle");

        let accepted = (0..20).filter(|_| handle.submit(job("offline"))).count();
        assert_eq!(accepted, 20);
        drop(handle);
        worker.shutdown(Duration::from_secs(5));

        assert_eq!(sink.inner.records().len(), 20);
        assert_eq!(worker.stats().written, 20);
        assert_eq!(worker.stats().dropped, 0);
        Ok(())
    }
}
