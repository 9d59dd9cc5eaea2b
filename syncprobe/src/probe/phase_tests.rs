use super::*;
use crate::probe::correlate::Correlator;
use crate::probe::provider::RemoteEntry;
use std::sync::Mutex;

/// Provider double that optionally "syncs" each action by correlating it
/// shortly afterwards, like the browser script or the local poller would.
struct FakeProvider {
    store: Arc<IterationStore>,
    echo: Option<Correlator>,
    entries: Vec<RemoteEntry>,
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeProvider {
    fn new(store: &Arc<IterationStore>) -> Self {
        Self {
            store: Arc::clone(store),
            echo: None,
            entries: Vec::new(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn echoing(mut self, target: Stamp) -> Self {
        self.echo = Some(Correlator::new(Arc::clone(&self.store), target));
        self
    }

    fn with_entries(mut self, names: &[&str]) -> Self {
        self.entries = names
            .iter()
            .map(|name| RemoteEntry {
                name: name.to_string(),
                handle: format!("/perf/{name}"),
            })
            .collect();
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn act(&self, call: String, name: &str) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(ProviderError::Io(std::io::Error::other("provider unavailable")));
        }
        if let Some(correlator) = self.echo.clone() {
            let name = name.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                correlator.absorb(&name, Some(OffsetDateTime::now_utc()));
            });
        }
        Ok(())
    }
}

impl StorageProvider for FakeProvider {
    async fn create(&self, name: &str, content: &str) -> Result<(), ProviderError> {
        let id = parse_iteration_id(name).unwrap();
        let record = self.store.find_by_id(id).expect("record appended before action");
        assert!(record.stamp(Stamp::UploadStartedAt).is_some());
        assert!(record.stamp(Stamp::UploadCompletedAt).is_none());
        assert_eq!(content, FILE_CONTENT);
        self.act(format!("create {name}"), name)
    }

    async fn delete(&self, entry: &RemoteEntry) -> Result<(), ProviderError> {
        self.act(format!("delete {}", entry.handle), &entry.name)
    }

    async fn list_entries(&self) -> Result<Vec<RemoteEntry>, ProviderError> {
        Ok(self.entries.clone())
    }
}

fn fast_wait() -> WaitPolicy {
    WaitPolicy {
        poll_interval: Duration::from_millis(20),
        max_wait: Some(Duration::from_secs(5)),
    }
}

fn driver(store: &Arc<IterationStore>, wait: WaitPolicy) -> PhaseDriver {
    PhaseDriver::new(Arc::clone(store), Pacing::none(), wait).with_seed(7)
}

#[tokio::test]
async fn creates_wait_until_every_iteration_is_observed() {
    let store = Arc::new(IterationStore::new());
    let provider = FakeProvider::new(&store).echoing(Stamp::WebSyncAt);

    let report = driver(&store, fast_wait())
        .run_creates(PhaseKind::ApiToWeb, &provider, 0, 3)
        .await
        .unwrap();

    assert_eq!(
        provider.calls(),
        vec![
            "create iteration-0.txt",
            "create iteration-1.txt",
            "create iteration-2.txt"
        ]
    );
    assert_eq!(report.records.len(), 3);
    assert_eq!(report.timings.len(), 3);
    for timing in &report.timings {
        assert!(timing.from_start >= timing.from_completion);
        assert!(timing.from_completion >= 0.0);
    }
}

#[tokio::test]
async fn second_phase_offsets_ids_and_reports_only_its_records() {
    let store = Arc::new(IterationStore::new());
    let provider = FakeProvider::new(&store).echoing(Stamp::WebSyncAt);
    let mut driver = driver(&store, fast_wait());

    driver
        .run_creates(PhaseKind::ApiToWeb, &provider, 0, 2)
        .await
        .unwrap();
    let report = driver
        .run_creates(PhaseKind::LocalDriveToWeb, &provider, 2, 2)
        .await
        .unwrap();

    let ids: Vec<_> = report.records.iter().map(|record| record.id).collect();
    assert_eq!(ids, vec![2, 3]);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn reusing_ids_is_a_duplicate_error() {
    let store = Arc::new(IterationStore::new());
    let provider = FakeProvider::new(&store).echoing(Stamp::WebSyncAt);
    let mut driver = driver(&store, fast_wait());

    driver
        .run_creates(PhaseKind::ApiToWeb, &provider, 0, 1)
        .await
        .unwrap();
    let err = driver
        .run_creates(PhaseKind::ApiToWeb, &provider, 0, 1)
        .await
        .unwrap_err();

    assert!(matches!(err, PhaseError::Store(StoreError::DuplicateId(0))));
}

#[tokio::test]
async fn provider_failure_aborts_the_phase() {
    let store = Arc::new(IterationStore::new());
    let provider = FakeProvider::new(&store).failing();

    let err = driver(&store, WaitPolicy::default())
        .run_creates(PhaseKind::ApiToWeb, &provider, 0, 3)
        .await
        .unwrap_err();

    assert!(matches!(err, PhaseError::Provider(_)));
    assert_eq!(provider.calls().len(), 1);
    let record = store.find_by_id(0).unwrap();
    assert!(record.stamp(Stamp::UploadCompletedAt).is_none());
}

#[tokio::test]
async fn unobserved_phase_times_out_when_bounded() {
    let store = Arc::new(IterationStore::new());
    let provider = FakeProvider::new(&store);
    let wait = WaitPolicy {
        poll_interval: Duration::from_millis(10),
        max_wait: Some(Duration::from_millis(60)),
    };

    let err = driver(&store, wait)
        .run_creates(PhaseKind::ApiToWeb, &provider, 0, 2)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PhaseError::Timeout {
            phase: "api_to_web",
            ..
        }
    ));
}

#[tokio::test]
async fn waiter_wakes_on_late_observation() {
    let store = Arc::new(IterationStore::new());
    let record = store.append(IterationRecord::new(0)).unwrap();
    let wait = WaitPolicy {
        poll_interval: Duration::from_secs(30),
        max_wait: Some(Duration::from_secs(5)),
    };
    let driver = driver(&store, wait);

    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.set_stamp(&record, Stamp::WebSyncAt, OffsetDateTime::now_utc());
        })
    };
    let started = std::time::Instant::now();
    driver
        .wait_for_completion(PhaseKind::ApiToWeb, 0..1, 1)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    writer.await.unwrap();
}

#[test]
fn empty_store_is_not_complete_for_a_non_empty_phase() {
    let store = IterationStore::new();
    assert!(store.all_satisfy(|record| record.has(Stamp::WebSyncAt)));
    assert!(!phase_complete(&store, &(0..3), 3, Stamp::WebSyncAt));
    assert!(phase_complete(&store, &(0..0), 0, Stamp::WebSyncAt));
}

#[test]
fn partial_phase_is_not_complete() {
    let store = IterationStore::new();
    let now = OffsetDateTime::now_utc();
    for id in 0..2 {
        let record = store.append(IterationRecord::new(id)).unwrap();
        store.set_stamp(&record, Stamp::WebSyncAt, now);
    }
    assert!(!phase_complete(&store, &(0..3), 3, Stamp::WebSyncAt));
    let record = store.append(IterationRecord::new(2)).unwrap();
    assert!(!phase_complete(&store, &(0..3), 3, Stamp::WebSyncAt));
    store.set_stamp(&record, Stamp::WebSyncAt, now);
    assert!(phase_complete(&store, &(0..3), 3, Stamp::WebSyncAt));
}

#[tokio::test]
async fn deletes_stamp_fresh_fields_on_existing_records() {
    let store = Arc::new(IterationStore::new());
    let synced_at = OffsetDateTime::now_utc();
    for id in [2u64, 3] {
        let record = store.append(IterationRecord::new(id)).unwrap();
        store.set_stamp(&record, Stamp::UploadStartedAt, synced_at);
        store.set_stamp(&record, Stamp::UploadCompletedAt, synced_at);
        store.set_stamp(&record, Stamp::WebSyncAt, synced_at);
    }
    let provider = FakeProvider::new(&store)
        .echoing(Stamp::LocalDeletedAt)
        .with_entries(&["iteration-2.txt", "notes.txt", "iteration-3.txt", "iteration-0.txt"]);

    let report = driver(&store, fast_wait())
        .run_deletes(PhaseKind::ApiToLocalDrive, &provider, 2..4)
        .await
        .unwrap();

    assert_eq!(
        provider.calls(),
        vec!["delete /perf/iteration-2.txt", "delete /perf/iteration-3.txt"]
    );
    assert_eq!(report.timings.len(), 2);
    for id in [2u64, 3] {
        let record = store.find_by_id(id).unwrap();
        assert_eq!(record.stamp(Stamp::WebSyncAt), Some(synced_at));
        assert!(record.stamp(Stamp::DeleteStartedAt).is_some());
        assert!(record.stamp(Stamp::DeleteCompletedAt).is_some());
        assert!(record.stamp(Stamp::LocalDeletedAt).is_some());
    }
}

#[test]
fn csv_lines_follow_stamp_order_and_append_durations() {
    let t0 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
    let record = RecordSnapshot {
        id: 3,
        stamps: vec![
            (Stamp::UploadStartedAt, t0),
            (Stamp::UploadCompletedAt, t0 + time::Duration::seconds(1)),
            (Stamp::WebSyncAt, t0 + time::Duration::seconds(5)),
        ],
    };
    let report = PhaseReport::build(PhaseKind::ApiToWeb, vec![record]);

    let lines = report.csv_lines();
    assert_eq!(
        lines[0],
        "id,upload_started_at,upload_completed_at,web_sync_at,sync_duration_from_action_start,sync_duration_from_action_complete"
    );
    assert_eq!(
        lines[1],
        "3,2023-11-14T22:13:20Z,2023-11-14T22:13:21Z,2023-11-14T22:13:25Z,5.000,4.000"
    );
}

#[test]
fn csv_rows_keep_header_columns_when_stamps_arrive_out_of_order() {
    let t0 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
    let in_order = RecordSnapshot {
        id: 0,
        stamps: vec![
            (Stamp::UploadStartedAt, t0),
            (Stamp::UploadCompletedAt, t0 + time::Duration::seconds(1)),
            (Stamp::WebSyncAt, t0 + time::Duration::seconds(5)),
        ],
    };
    let observed_first = RecordSnapshot {
        id: 1,
        stamps: vec![
            (Stamp::UploadStartedAt, t0),
            (Stamp::WebSyncAt, t0 + time::Duration::seconds(2)),
            (Stamp::UploadCompletedAt, t0 + time::Duration::seconds(3)),
        ],
    };
    let unobserved = RecordSnapshot {
        id: 2,
        stamps: vec![(Stamp::UploadStartedAt, t0)],
    };
    let report = PhaseReport::build(
        PhaseKind::ApiToWeb,
        vec![in_order, observed_first, unobserved],
    );

    let lines = report.csv_lines();
    assert_eq!(
        lines[2],
        "1,2023-11-14T22:13:20Z,2023-11-14T22:13:23Z,2023-11-14T22:13:22Z,2.000,-1.000"
    );
    assert_eq!(lines[3], "2,2023-11-14T22:13:20Z,,,,");
}
