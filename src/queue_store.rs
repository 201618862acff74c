//! Durable storage for the pending-submission queue.
//!
//! The queue is always written as a whole: one JSON array under a fixed key. There are no keyed
//! or partial updates, so a save either replaces the previous snapshot or fails and leaves it
//! untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use lmdb::{Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use log::{info, warn};

use crate::error::{CoreError, Result};
use crate::record::Record;

/// Key the serialized queue lives under.
pub const QUEUE_KEY: &str = "pendingSubmissions";

const QUEUE_DB_NAME: &str = "submission_queue";
const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;

/// Persistence backend for [`SubmissionQueue`](crate::submission_queue::SubmissionQueue).
pub trait QueueStore: Send + Sync {
    /// Reads the last saved snapshot. An absent snapshot is an empty queue.
    fn load(&self) -> Result<Vec<Record>>;

    /// Replaces the saved snapshot with `records`, in order.
    fn save(&self, records: &[Record]) -> Result<()>;
}

/// LMDB-backed queue storage.
///
/// The environment lives in a `<name>.lmdb` directory, created on first use.
pub struct LmdbQueueStore {
    env: Environment,
    db: Database,
    path: PathBuf,
}

impl LmdbQueueStore {
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with_map_size(name, DEFAULT_MAP_SIZE)
    }

    /// Opens the store with an explicit LMDB map size. Once the map is full, saves fail with
    /// [`lmdb::Error::MapFull`].
    pub fn open_with_map_size(name: &str, map_size: usize) -> Result<Self> {
        let path = PathBuf::from(format!("{name}.lmdb"));

        if !path.exists() {
            info!("Creating queue storage at: {}", path.display());
            fs::create_dir_all(&path)?;
        }

        let env = Environment::new()
            .set_max_dbs(1)
            .set_map_size(map_size)
            .open(&path)?;
        let db = env.create_db(Some(QUEUE_DB_NAME), DatabaseFlags::empty())?;

        info!("Queue storage opened at: {}", path.display());
        Ok(Self { env, db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueueStore for LmdbQueueStore {
    fn load(&self) -> Result<Vec<Record>> {
        let txn = self.env.begin_ro_txn()?;
        let records = match txn.get(self.db, &QUEUE_KEY) {
            Ok(bytes) => serde_json::from_slice(bytes)?,
            Err(lmdb::Error::NotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        txn.abort();
        Ok(records)
    }

    fn save(&self, records: &[Record]) -> Result<()> {
        let json = serde_json::to_vec(records)?;
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.db, &QUEUE_KEY, &json, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }
}

/// In-memory queue storage.
///
/// Snapshots still go through JSON, so a test that rehydrates from it sees the same encoding the
/// LMDB store would produce. Saves can be made to fail to exercise degraded durability.
#[derive(Default)]
pub struct MemoryQueueStore {
    snapshot: Mutex<Option<String>>,
    fail_saves: AtomicBool,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a raw snapshot, which does not have to be valid.
    pub fn with_snapshot(raw: impl Into<String>) -> Self {
        Self {
            snapshot: Mutex::new(Some(raw.into())),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// The raw JSON last written.
    pub fn snapshot(&self) -> Option<String> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> Result<Vec<Record>> {
        match self.snapshot() {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, records: &[Record]) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            warn!("In-memory queue store refusing save of {} record(s)", records.len());
            return Err(CoreError::Storage(lmdb::Error::MapFull));
        }

        let json = serde_json::to_string(records)?;
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(json);
        Ok(())
    }
}
