use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;

pub const FILE_NAME_PREFIX: &str = "iteration";
pub const FILE_EXTENSION: &str = "txt";

/// Builds the tracked file name for an iteration id, e.g. `iteration-3.txt`.
pub fn file_name_for(id: u64) -> String {
    format!("{FILE_NAME_PREFIX}-{id}.{FILE_EXTENSION}")
}

/// Named timestamp slots of an iteration record.
///
/// A later phase reusing an id writes into its own slots, never into the
/// slots of an earlier phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stamp {
    UploadStartedAt,
    UploadCompletedAt,
    WebSyncAt,
    DeleteStartedAt,
    DeleteCompletedAt,
    LocalDeletedAt,
}

impl Stamp {
    pub fn as_str(self) -> &'static str {
        match self {
            Stamp::UploadStartedAt => "upload_started_at",
            Stamp::UploadCompletedAt => "upload_completed_at",
            Stamp::WebSyncAt => "web_sync_at",
            Stamp::DeleteStartedAt => "delete_started_at",
            Stamp::DeleteCompletedAt => "delete_completed_at",
            Stamp::LocalDeletedAt => "local_deleted_at",
        }
    }

    /// The action start an observation stamp is measured from.
    pub fn baseline(self) -> Option<Stamp> {
        match self {
            Stamp::WebSyncAt => Some(Stamp::UploadStartedAt),
            Stamp::LocalDeletedAt => Some(Stamp::DeleteStartedAt),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("iteration {0} is already tracked")]
    DuplicateId(u64),
}

#[derive(Debug)]
pub struct IterationRecord {
    id: u64,
    stamps: Mutex<Vec<(Stamp, OffsetDateTime)>>,
}

impl IterationRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            stamps: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stamp(&self, stamp: Stamp) -> Option<OffsetDateTime> {
        self.lock_stamps()
            .iter()
            .find_map(|(name, at)| (*name == stamp).then_some(*at))
    }

    /// Writes `at` into `stamp` unless it is already set. Returns whether this call wrote it.
    fn set_once(&self, stamp: Stamp, at: OffsetDateTime) -> bool {
        let mut stamps = self.lock_stamps();
        if stamps.iter().any(|(name, _)| *name == stamp) {
            return false;
        }
        stamps.push((stamp, at));
        true
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            id: self.id,
            stamps: self.lock_stamps().clone(),
        }
    }

    fn lock_stamps(&self) -> std::sync::MutexGuard<'_, Vec<(Stamp, OffsetDateTime)>> {
        self.stamps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time copy of a record, stamps in the order they were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub id: u64,
    pub stamps: Vec<(Stamp, OffsetDateTime)>,
}

impl RecordSnapshot {
    pub fn get(&self, stamp: Stamp) -> Option<OffsetDateTime> {
        self.stamps
            .iter()
            .find_map(|(name, at)| (*name == stamp).then_some(*at))
    }

    pub fn has(&self, stamp: Stamp) -> bool {
        self.get(stamp).is_some()
    }
}

#[derive(Debug, Default)]
struct Records {
    ordered: Vec<Arc<IterationRecord>>,
    by_id: HashMap<u64, Arc<IterationRecord>>,
}

/// Append-only, id-keyed collection of iteration records shared by the
/// driver and the signal adapters for the lifetime of a run.
#[derive(Debug)]
pub struct IterationStore {
    records: RwLock<Records>,
    changes: watch::Sender<u64>,
}

impl Default for IterationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IterationStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            records: RwLock::new(Records::default()),
            changes,
        }
    }

    pub fn append(&self, record: IterationRecord) -> Result<Arc<IterationRecord>, StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.by_id.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        let record = Arc::new(record);
        records.by_id.insert(record.id, Arc::clone(&record));
        records.ordered.push(Arc::clone(&record));
        drop(records);
        self.bump();
        Ok(record)
    }

    pub fn find_by_id(&self, id: u64) -> Option<Arc<IterationRecord>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .cloned()
    }

    /// Sets a stamp once and wakes completion waiters. A stamp that is
    /// already set keeps its first value and the call returns `false`.
    pub fn set_stamp(&self, record: &IterationRecord, stamp: Stamp, at: OffsetDateTime) -> bool {
        let written = record.set_once(stamp, at);
        if written {
            self.bump();
        }
        written
    }

    /// Evaluates `predicate` over a snapshot of every record, in insertion order.
    pub fn all_satisfy<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&RecordSnapshot) -> bool,
    {
        self.snapshot().iter().all(|record| predicate(record))
    }

    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        let ordered = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .clone();
        ordered.iter().map(|record| record.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver that changes whenever a record is appended or a stamp is written.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}
