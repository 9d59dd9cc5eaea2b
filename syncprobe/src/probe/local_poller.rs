use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::correlate::Correlator;

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Watching,
    Done,
}

/// Diffs successive directory snapshots. Stops once the watched set drains
/// to empty after having held at least one file.
#[derive(Debug)]
pub struct DeletionTracker {
    previous: BTreeSet<String>,
    seen_files: bool,
    state: PollerState,
}

impl Default for DeletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeletionTracker {
    pub fn new() -> Self {
        Self {
            previous: BTreeSet::new(),
            seen_files: false,
            state: PollerState::Watching,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Feeds the next snapshot and returns the names that disappeared since the previous one.
    pub fn observe(&mut self, current: BTreeSet<String>) -> Vec<String> {
        if self.state == PollerState::Done {
            return Vec::new();
        }
        let removed = self.previous.difference(&current).cloned().collect();
        if current.is_empty() {
            if self.seen_files {
                self.state = PollerState::Done;
            }
        } else {
            self.seen_files = true;
        }
        self.previous = current;
        removed
    }
}

/// Lists file names in `dir` that start with `prefix`.
pub async fn list_prefixed(dir: &Path, prefix: &str) -> std::io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(prefix) {
            names.insert(name);
        }
    }
    Ok(names)
}

/// Watches a local sync folder for deletions and reports each removed file
/// to a correlator with the tick time as observation time.
#[derive(Debug, Clone)]
pub struct LocalPoller {
    dir: PathBuf,
    prefix: String,
    tick: Duration,
}

impl LocalPoller {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Takes the baseline snapshot, then keeps polling in a background task.
    /// Anything removed after this returns is reported.
    pub async fn spawn(
        self,
        correlator: Correlator,
        cancel: CancellationToken,
    ) -> JoinHandle<PollerState> {
        let mut tracker = DeletionTracker::new();
        self.poll_once(&mut tracker, &correlator).await;
        tokio::spawn(self.watch(tracker, correlator, cancel))
    }

    async fn watch(
        self,
        mut tracker: DeletionTracker,
        correlator: Correlator,
        cancel: CancellationToken,
    ) -> PollerState {
        while tracker.state() == PollerState::Watching {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {}
            }
            self.poll_once(&mut tracker, &correlator).await;
        }
        debug!(dir = %self.dir.display(), state = ?tracker.state(), "local poller stopped");
        tracker.state()
    }

    async fn poll_once(&self, tracker: &mut DeletionTracker, correlator: &Correlator) {
        let current = match list_prefixed(&self.dir, &self.prefix).await {
            Ok(current) => current,
            Err(err) => {
                warn!(dir = %self.dir.display(), "skipping poll tick, listing failed: {err}");
                return;
            }
        };
        let observed_at = OffsetDateTime::now_utc();
        for name in tracker.observe(current) {
            correlator.absorb(&name, Some(observed_at));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::iteration::{IterationRecord, IterationStore, Stamp};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn reports_only_removed_files() {
        let mut tracker = DeletionTracker::new();
        assert!(
            tracker
                .observe(names(&["iteration-0.txt", "iteration-1.txt"]))
                .is_empty()
        );
        assert_eq!(
            tracker.observe(names(&["iteration-1.txt"])),
            vec!["iteration-0.txt".to_string()]
        );
        assert_eq!(tracker.state(), PollerState::Watching);
    }

    #[test]
    fn new_files_are_not_reported() {
        let mut tracker = DeletionTracker::new();
        tracker.observe(names(&["iteration-0.txt"]));
        assert!(
            tracker
                .observe(names(&["iteration-0.txt", "iteration-1.txt"]))
                .is_empty()
        );
    }

    #[test]
    fn drains_to_done_after_being_non_empty() {
        let mut tracker = DeletionTracker::new();
        tracker.observe(names(&["iteration-0.txt"]));
        assert_eq!(
            tracker.observe(BTreeSet::new()),
            vec!["iteration-0.txt".to_string()]
        );
        assert_eq!(tracker.state(), PollerState::Done);
        assert!(tracker.observe(names(&["iteration-5.txt"])).is_empty());
        assert_eq!(tracker.state(), PollerState::Done);
    }

    #[test]
    fn empty_start_keeps_watching() {
        let mut tracker = DeletionTracker::new();
        tracker.observe(BTreeSet::new());
        tracker.observe(BTreeSet::new());
        assert_eq!(tracker.state(), PollerState::Watching);
    }

    #[tokio::test]
    async fn lists_only_prefixed_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("iteration-0.txt"), "<empty>").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let listed = list_prefixed(dir.path(), "iteration").await.unwrap();
        assert_eq!(listed, names(&["iteration-0.txt"]));
    }

    #[tokio::test]
    async fn poller_stamps_local_deletions_and_stops_when_drained() {
        let dir = tempdir().unwrap();
        let store = Arc::new(IterationStore::new());
        for id in [0u64, 1] {
            store.append(IterationRecord::new(id)).unwrap();
            std::fs::write(dir.path().join(format!("iteration-{id}.txt")), "<empty>").unwrap();
        }
        let correlator = Correlator::new(Arc::clone(&store), Stamp::LocalDeletedAt);
        let handle = LocalPoller::new(dir.path(), "iteration")
            .with_tick(Duration::from_millis(10))
            .spawn(correlator, CancellationToken::new())
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let before_delete = OffsetDateTime::now_utc();
        std::fs::remove_file(dir.path().join("iteration-0.txt")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = store.find_by_id(0).unwrap();
        assert!(first.stamp(Stamp::LocalDeletedAt).unwrap() >= before_delete);
        assert!(store.find_by_id(1).unwrap().stamp(Stamp::LocalDeletedAt).is_none());

        std::fs::remove_file(dir.path().join("iteration-1.txt")).unwrap();
        let state = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, PollerState::Done);
        assert!(store.find_by_id(1).unwrap().stamp(Stamp::LocalDeletedAt).is_some());
    }

    #[tokio::test]
    async fn deletion_right_after_spawn_is_reported() {
        let dir = tempdir().unwrap();
        let store = Arc::new(IterationStore::new());
        store.append(IterationRecord::new(7)).unwrap();
        std::fs::write(dir.path().join("iteration-7.txt"), "<empty>").unwrap();

        let handle = LocalPoller::new(dir.path(), "iteration")
            .with_tick(Duration::from_millis(10))
            .spawn(
                Correlator::new(Arc::clone(&store), Stamp::LocalDeletedAt),
                CancellationToken::new(),
            )
            .await;
        std::fs::remove_file(dir.path().join("iteration-7.txt")).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, PollerState::Done);
        assert!(store.find_by_id(7).unwrap().stamp(Stamp::LocalDeletedAt).is_some());
    }

    #[tokio::test]
    async fn poller_stops_on_cancel_and_survives_missing_dir() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("not-created-yet");
        let store = Arc::new(IterationStore::new());
        let cancel = CancellationToken::new();
        let handle = LocalPoller::new(&missing, "iteration")
            .with_tick(Duration::from_millis(10))
            .spawn(
                Correlator::new(Arc::clone(&store), Stamp::LocalDeletedAt),
                cancel.clone(),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        let state = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, PollerState::Watching);
    }
}
