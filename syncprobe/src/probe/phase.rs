use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::time::Instant;
use tracing::{info, warn};

use super::aggregate::IterationTiming;
use super::correlate::parse_iteration_id;
use super::iteration::{IterationRecord, IterationStore, RecordSnapshot, Stamp, StoreError, file_name_for};
use super::pacing::Pacing;
use super::provider::{ProviderError, StorageProvider};

pub const FILE_CONTENT: &str = "<empty>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhaseKind {
    ApiToWeb,
    LocalDriveToWeb,
    ApiToLocalDrive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStamps {
    pub started: Stamp,
    pub completed: Stamp,
    pub observed: Stamp,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::ApiToWeb => "api_to_web",
            PhaseKind::LocalDriveToWeb => "local_drive_to_web",
            PhaseKind::ApiToLocalDrive => "api_to_local_drive",
        }
    }

    pub fn stamps(self) -> PhaseStamps {
        match self {
            PhaseKind::ApiToWeb | PhaseKind::LocalDriveToWeb => PhaseStamps {
                started: Stamp::UploadStartedAt,
                completed: Stamp::UploadCompletedAt,
                observed: Stamp::WebSyncAt,
            },
            PhaseKind::ApiToLocalDrive => PhaseStamps {
                started: Stamp::DeleteStartedAt,
                completed: Stamp::DeleteCompletedAt,
                observed: Stamp::LocalDeletedAt,
            },
        }
    }

    pub fn summary_subject(self) -> &'static str {
        match self {
            PhaseKind::ApiToWeb | PhaseKind::LocalDriveToWeb => "web sync time",
            PhaseKind::ApiToLocalDrive => "local drive sync time",
        }
    }

    pub fn action_noun(self) -> &'static str {
        match self {
            PhaseKind::ApiToWeb => "API upload",
            PhaseKind::LocalDriveToWeb => "local drive write",
            PhaseKind::ApiToLocalDrive => "API delete",
        }
    }
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("iteration store rejected a record: {0}")]
    Store(#[from] StoreError),
    #[error("provider action failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("phase {phase} did not complete within {waited:?}")]
    Timeout {
        phase: &'static str,
        waited: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub max_wait: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_wait: None,
        }
    }
}

/// Per-phase output: one timing per iteration plus the CSV-like rows to print.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub kind: PhaseKind,
    pub records: Vec<RecordSnapshot>,
    pub timings: Vec<IterationTiming>,
}

impl PhaseReport {
    fn build(kind: PhaseKind, records: Vec<RecordSnapshot>) -> Self {
        let timings = records
            .iter()
            .filter_map(|record| IterationTiming::from_record(record, kind))
            .collect();
        Self {
            kind,
            records,
            timings,
        }
    }

    /// Header from the first record's stamp order, then one line per iteration
    /// with its cells in header order.
    pub fn csv_lines(&self) -> Vec<String> {
        let Some(first) = self.records.first() else {
            return Vec::new();
        };
        let columns: Vec<_> = first.stamps.iter().map(|(stamp, _)| *stamp).collect();
        let mut header = vec!["id".to_string()];
        header.extend(columns.iter().map(|stamp| stamp.as_str().to_string()));
        header.push("sync_duration_from_action_start".into());
        header.push("sync_duration_from_action_complete".into());

        let mut lines = vec![header.join(",")];
        for record in &self.records {
            let mut row = vec![record.id.to_string()];
            row.extend(
                columns
                    .iter()
                    .map(|stamp| record.get(*stamp).map(format_timestamp).unwrap_or_default()),
            );
            match IterationTiming::from_record(record, self.kind) {
                Some(timing) => {
                    row.push(format!("{:.3}", timing.from_start));
                    row.push(format!("{:.3}", timing.from_completion));
                }
                None => row.extend([String::new(), String::new()]),
            }
            lines.push(row.join(","));
        }
        lines
    }
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Runs phases one after another against a shared iteration store.
pub struct PhaseDriver {
    store: Arc<IterationStore>,
    pacing: Pacing,
    wait: WaitPolicy,
    rng: StdRng,
}

impl PhaseDriver {
    pub fn new(store: Arc<IterationStore>, pacing: Pacing, wait: WaitPolicy) -> Self {
        Self {
            store,
            pacing,
            wait,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Creates `iterations` files with ids starting at `first_id`, then waits
    /// until every one of them has been observed.
    ///
    /// Each record is appended before its action is issued so a callback can
    /// never arrive for an id the store does not know yet.
    pub async fn run_creates<P: StorageProvider>(
        &mut self,
        kind: PhaseKind,
        provider: &P,
        first_id: u64,
        iterations: usize,
    ) -> Result<PhaseReport, PhaseError> {
        let stamps = kind.stamps();
        let ids = first_id..first_id + iterations as u64;
        for id in ids.clone() {
            let record = self.store.append(IterationRecord::new(id))?;
            let started = OffsetDateTime::now_utc();
            self.store.set_stamp(&record, stamps.started, started);
            provider.create(&file_name_for(id), FILE_CONTENT).await?;
            let completed = OffsetDateTime::now_utc();
            self.store.set_stamp(&record, stamps.completed, completed);

            let pause = self.pacing.pause_with_rng(&mut self.rng);
            info!(
                phase = kind.as_str(),
                id,
                took = %format!("{:.2}s", (completed - started).as_seconds_f64()),
                pause_secs = pause.as_secs(),
                "created test file"
            );
            tokio::time::sleep(pause).await;
        }
        self.wait_for_completion(kind, ids.clone(), iterations).await?;
        Ok(self.report(kind, ids))
    }

    /// Deletes the provider's test files whose ids fall in `ids`, then waits
    /// until every deletion has been observed. Files with unrecognised names
    /// are logged and left alone.
    pub async fn run_deletes<P: StorageProvider>(
        &mut self,
        kind: PhaseKind,
        provider: &P,
        ids: Range<u64>,
    ) -> Result<PhaseReport, PhaseError> {
        let stamps = kind.stamps();
        let entries = provider.list_entries().await?;
        for entry in entries {
            let Some(id) = parse_iteration_id(&entry.name) else {
                warn!(name = %entry.name, "remote file has an unrecognised name, skipping");
                continue;
            };
            let Some(record) = self.store.find_by_id(id).filter(|_| ids.contains(&id)) else {
                warn!(name = %entry.name, id, "remote file is not part of this phase, skipping");
                continue;
            };
            self.store
                .set_stamp(&record, stamps.started, OffsetDateTime::now_utc());
            provider.delete(&entry).await?;
            self.store
                .set_stamp(&record, stamps.completed, OffsetDateTime::now_utc());

            let pause = self.pacing.pause_with_rng(&mut self.rng);
            info!(
                phase = kind.as_str(),
                id,
                pause_secs = pause.as_secs(),
                "deleted test file"
            );
            tokio::time::sleep(pause).await;
        }
        let expected = (ids.end - ids.start) as usize;
        self.wait_for_completion(kind, ids.clone(), expected).await?;
        Ok(self.report(kind, ids))
    }

    /// Blocks until `expected` records with ids in `ids` carry the phase's
    /// observation stamp. Wakes on every store change and re-checks at least
    /// once per poll interval.
    pub async fn wait_for_completion(
        &self,
        kind: PhaseKind,
        ids: Range<u64>,
        expected: usize,
    ) -> Result<(), PhaseError> {
        let observed = kind.stamps().observed;
        let mut changes = self.store.subscribe();
        let started = Instant::now();
        let deadline = self.wait.max_wait.map(|max_wait| started + max_wait);
        loop {
            changes.borrow_and_update();
            if phase_complete(&self.store, &ids, expected, observed) {
                return Ok(());
            }
            let mut tick = self.wait.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(PhaseError::Timeout {
                        phase: kind.as_str(),
                        waited: now - started,
                    });
                }
                tick = tick.min(deadline - now);
            }
            let _ = tokio::time::timeout(tick, changes.changed()).await;
        }
    }

    fn report(&self, kind: PhaseKind, ids: Range<u64>) -> PhaseReport {
        let records = self
            .store
            .snapshot()
            .into_iter()
            .filter(|record| ids.contains(&record.id))
            .collect();
        PhaseReport::build(kind, records)
    }
}

/// True once exactly `expected` records in `ids` exist and all carry `observed`.
/// An empty id range never counts as complete unless nothing is expected.
fn phase_complete(
    store: &IterationStore,
    ids: &Range<u64>,
    expected: usize,
    observed: Stamp,
) -> bool {
    let mut seen = 0usize;
    let all_observed = store.all_satisfy(|record| {
        if !ids.contains(&record.id) {
            return true;
        }
        seen += 1;
        record.has(observed)
    });
    all_observed && seen == expected
}

#[cfg(test)]
#[path = "phase_tests.rs"]
mod tests;
