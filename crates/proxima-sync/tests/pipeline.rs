use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local};
use proxima_adapters::{FetchContext, FixturePlanetSource, PlanetSource, SourceError};
use proxima_core::{RawPlanet, ScheduleWindow};
use proxima_notify::sink::build_client;
use proxima_notify::{Notifier, RenderOptions, RenderStyle, SinkTarget, WebhookSink};
use proxima_storage::{BackoffPolicy, OutputStore, VersionedStore};
use proxima_sync::{
    run_loop, CycleError, CycleErrorKind, CycleOutcome, LoopSettings, SyncPipeline, Trigger, DATA_FILE,
    REPORT_FILE,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Serves whatever list the test put in last, or a failure.
#[derive(Clone, Default)]
struct ScriptedSource {
    planets: Arc<Mutex<Option<Vec<RawPlanet>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedSource {
    fn set(&self, planets: Vec<RawPlanet>) {
        *self.planets.lock().unwrap() = Some(planets);
    }

    fn fail(&self) {
        *self.planets.lock().unwrap() = None;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanetSource for ScriptedSource {
    fn source_id(&self) -> &str {
        "scripted"
    }

    fn location(&self) -> String {
        "memory".to_string()
    }

    async fn fetch_planets(&self, _ctx: &FetchContext) -> Result<Vec<RawPlanet>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.planets.lock().unwrap().clone().ok_or_else(|| SourceError::Fixture {
            path: PathBuf::from("memory"),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "upstream down"),
        })
    }
}

fn planet(name: &str, coordinates: &str, score: u64) -> RawPlanet {
    RawPlanet {
        name: name.to_string(),
        coordinates: coordinates.to_string(),
        score,
        delete_on: "2025-09-17T16:06:58.000000Z".to_string(),
    }
}

async fn pipeline(source: &ScriptedSource, out: &tempfile::TempDir) -> SyncPipeline {
    let store = VersionedStore::in_memory().await.expect("store");
    SyncPipeline::new(Box::new(source.clone()), store, OutputStore::new(out.path()))
}

#[tokio::test]
async fn first_capture_of_one_planet_against_empty_store() {
    let source = ScriptedSource::default();
    source.set(vec![planet("Proxima 5-2", "123:456", 300)]);
    let out = tempfile::tempdir().expect("tempdir");
    let pipeline = pipeline(&source, &out).await;

    let outcome = pipeline.run_cycle(Trigger::Forced).await.expect("cycle");
    let CycleOutcome::Changed(changed) = outcome else {
        panic!("expected a stored capture, got {outcome:?}");
    };
    assert_eq!(changed.appended, 1);
    assert_eq!(changed.total_entities, 1);
    assert!(changed.output_error.is_none());
    assert!(changed.notify.is_none());

    let (snapshot, stats) = pipeline.current_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.observations[0].name, "Proxima 5-2");
    assert_eq!(snapshot.observations[0].period_number, 5);
    assert_eq!(stats.total_entities, 1);
    assert_eq!(stats.latest_period, Some(5));
    assert_eq!(pipeline.store().row_count().await.expect("rows"), 1);
}

#[tokio::test]
async fn repeated_and_reordered_fetches_write_nothing() {
    let source = ScriptedSource::default();
    let records = vec![planet("Proxima 10-1", "1:1", 740), planet("Proxima 10-2", "1:2", 515)];
    source.set(records.clone());
    let out = tempfile::tempdir().expect("tempdir");
    let pipeline = pipeline(&source, &out).await;

    pipeline.run_cycle(Trigger::Forced).await.expect("first");
    let rows = pipeline.store().row_count().await.expect("rows");

    let again = pipeline.run_cycle(Trigger::Forced).await.expect("second");
    assert!(matches!(again, CycleOutcome::Unchanged { fetched: 2, .. }));

    let mut reordered = records;
    reordered.reverse();
    source.set(reordered);
    let third = pipeline.run_cycle(Trigger::Forced).await.expect("third");
    assert!(matches!(third, CycleOutcome::Unchanged { .. }));

    assert_eq!(pipeline.store().row_count().await.expect("rows"), rows);
}

#[tokio::test]
async fn repeated_names_in_one_fetch_do_not_retrigger_changes() {
    let source = ScriptedSource::default();
    source.set(vec![
        planet("Proxima 1-1", "1:1", 10),
        planet("Proxima 1-1", "1:1", 10),
        planet("Proxima 1-2", "1:2", 20),
    ]);
    let out = tempfile::tempdir().expect("tempdir");
    let pipeline = pipeline(&source, &out).await;

    let first = pipeline.run_cycle(Trigger::Forced).await.expect("first");
    let CycleOutcome::Changed(changed) = first else {
        panic!("expected a stored capture, got {first:?}");
    };
    assert_eq!(changed.appended, 2);
    assert_eq!(pipeline.store().row_count().await.expect("rows"), 2);

    let second = pipeline.run_cycle(Trigger::Forced).await.expect("second");
    assert!(
        matches!(second, CycleOutcome::Unchanged { fetched: 2, .. }),
        "got {second:?}"
    );
    let third = pipeline.run_cycle(Trigger::Forced).await.expect("third");
    assert!(matches!(third, CycleOutcome::Unchanged { .. }));
    assert_eq!(pipeline.store().row_count().await.expect("rows"), 2);
}

#[tokio::test]
async fn changed_score_appends_a_new_version_and_keeps_history() {
    let source = ScriptedSource::default();
    source.set(vec![planet("Proxima 10-1", "1:1", 740), planet("Proxima 10-2", "1:2", 515)]);
    let out = tempfile::tempdir().expect("tempdir");
    let pipeline = pipeline(&source, &out).await;
    pipeline.run_cycle(Trigger::Forced).await.expect("first");

    source.set(vec![planet("Proxima 10-1", "1:1", 800), planet("Proxima 10-2", "1:2", 515)]);
    let outcome = pipeline.run_cycle(Trigger::Forced).await.expect("second");
    assert!(matches!(outcome, CycleOutcome::Changed(_)));
    assert_eq!(pipeline.store().row_count().await.expect("rows"), 4);

    let (snapshot, stats) = pipeline.current_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.observations[0].score, 800);
    assert_eq!(stats.total_entities, 2);

    let history = pipeline.store().history("Proxima 10-1").await.expect("history");
    assert_eq!(history.iter().map(|o| o.score).collect::<Vec<_>>(), vec![740, 800]);
}

#[tokio::test]
async fn scheduled_cycle_outside_the_window_does_not_fetch() {
    let source = ScriptedSource::default();
    source.set(vec![planet("Proxima 1-1", "1:1", 1)]);
    let out = tempfile::tempdir().expect("tempdir");
    let tomorrow = Local::now().weekday().succ();
    let pipeline = pipeline(&source, &out)
        .await
        .with_gate(ScheduleWindow::new(tomorrow, 0, 24).expect("window"));

    let outcome = pipeline.run_cycle(Trigger::Scheduled).await.expect("cycle");
    assert!(matches!(outcome, CycleOutcome::Skipped { .. }));
    assert_eq!(source.calls(), 0);

    let forced = pipeline.run_cycle(Trigger::Forced).await.expect("forced");
    assert!(matches!(forced, CycleOutcome::Changed(_)));
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn scheduled_cycle_inside_the_window_runs() {
    let source = ScriptedSource::default();
    source.set(vec![planet("Proxima 1-1", "1:1", 1)]);
    let out = tempfile::tempdir().expect("tempdir");
    let today = Local::now().weekday();
    let pipeline = pipeline(&source, &out)
        .await
        .with_gate(ScheduleWindow::new(today, 0, 24).expect("window"));

    let outcome = pipeline.run_cycle(Trigger::Scheduled).await.expect("cycle");
    assert!(matches!(outcome, CycleOutcome::Changed(_)));
}

#[tokio::test]
async fn fetch_failure_is_reported_and_leaves_the_store_untouched() {
    let source = ScriptedSource::default();
    source.set(vec![planet("Proxima 1-1", "1:1", 1)]);
    let out = tempfile::tempdir().expect("tempdir");
    let pipeline = pipeline(&source, &out).await;
    pipeline.run_cycle(Trigger::Forced).await.expect("first");

    source.fail();
    let err = pipeline.run_cycle(Trigger::Forced).await.expect_err("fetch error");
    assert!(matches!(err, CycleError::Fetch(_)));

    let report = pipeline.run_reported(Trigger::Forced).await;
    assert!(!report.ok);
    assert_eq!(report.error_kind, Some(CycleErrorKind::Fetch));
    assert!(report.error.unwrap_or_default().contains("upstream down"));
    assert_eq!(pipeline.store().row_count().await.expect("rows"), 1);
    assert!(pipeline.last_report().await.is_some());
}

#[tokio::test]
async fn empty_upstream_list_keeps_previous_capture() {
    let source = ScriptedSource::default();
    source.set(vec![planet("Proxima 1-1", "1:1", 1)]);
    let out = tempfile::tempdir().expect("tempdir");
    let pipeline = pipeline(&source, &out).await;
    pipeline.run_cycle(Trigger::Forced).await.expect("first");

    source.set(Vec::new());
    let outcome = pipeline.run_cycle(Trigger::Forced).await.expect("empty");
    assert!(matches!(outcome, CycleOutcome::Unchanged { fetched: 0, .. }));
    assert_eq!(pipeline.current_snapshot().await.expect("snapshot").0.len(), 1);
}

#[tokio::test]
async fn changed_cycle_writes_outputs_and_notifies_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let source = ScriptedSource::default();
    source.set(vec![planet("Proxima 10-1", "101:202:3", 740)]);
    let out = tempfile::tempdir().expect("tempdir");
    let client = build_client(Duration::from_secs(2), None).expect("client");
    let notifier = Notifier::new(
        vec![SinkTarget {
            sink: WebhookSink::new("test", server.uri(), client),
            styles: vec![RenderStyle::Table],
        }],
        RenderOptions::default(),
    )
    .with_page_delay(Duration::ZERO);
    let pipeline = pipeline(&source, &out).await.with_notifier(notifier);

    let outcome = pipeline.run_cycle(Trigger::Forced).await.expect("changed");
    let CycleOutcome::Changed(changed) = outcome else {
        panic!("expected change, got {outcome:?}");
    };
    assert!(changed.notify.expect("report").all_delivered());
    assert_eq!(changed.outputs.len(), 2);
    assert!(out.path().join(DATA_FILE).exists());
    assert!(out.path().join(REPORT_FILE).exists());

    // No change, no second delivery.
    pipeline.run_cycle(Trigger::Forced).await.expect("unchanged");
}

#[tokio::test]
async fn fixture_source_drives_a_full_cycle() {
    let fixture = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/proxima_sample.json");
    let out = tempfile::tempdir().expect("tempdir");
    let store = VersionedStore::in_memory().await.expect("store");
    let pipeline = SyncPipeline::new(
        Box::new(FixturePlanetSource::new(fixture)),
        store,
        OutputStore::new(out.path()),
    );

    pipeline.run_cycle(Trigger::Forced).await.expect("cycle");
    let (_, stats) = pipeline.current_snapshot().await.expect("snapshot");
    assert_eq!(stats.total_entities, 5);
    assert_eq!(stats.latest_period, Some(10));

    let (file_name, bytes) = pipeline
        .export_current(proxima_notify::ExportFormat::Csv)
        .await
        .expect("export");
    assert!(file_name.ends_with(".csv"));
    assert_eq!(String::from_utf8(bytes).expect("utf8").lines().count(), 6);
}

#[tokio::test]
async fn loop_stops_when_cancelled() {
    let source = ScriptedSource::default();
    source.set(vec![planet("Proxima 1-1", "1:1", 1)]);
    let out = tempfile::tempdir().expect("tempdir");
    let today = Local::now().weekday();
    let pipeline = Arc::new(
        pipeline(&source, &out)
            .await
            .with_gate(ScheduleWindow::new(today, 0, 24).expect("window")),
    );
    let settings = LoopSettings {
        poll_interval: Duration::from_secs(3600),
        failure_backoff: BackoffPolicy::default(),
    };
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_loop(pipeline.clone(), settings, cancel.clone()));

    for _ in 0..50 {
        if source.calls() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop exits promptly")
        .expect("loop task");

    assert_eq!(source.calls(), 1);
    assert!(pipeline.last_report().await.expect("report").ok);
}

#[tokio::test]
async fn loop_keeps_retrying_after_failed_cycles() {
    let source = ScriptedSource::default();
    source.fail();
    let out = tempfile::tempdir().expect("tempdir");
    let today = Local::now().weekday();
    let pipeline = Arc::new(
        pipeline(&source, &out)
            .await
            .with_gate(ScheduleWindow::new(today, 0, 24).expect("window")),
    );
    let settings = LoopSettings {
        poll_interval: Duration::from_secs(3600),
        failure_backoff: BackoffPolicy {
            max_retries: usize::MAX,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        },
    };
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_loop(pipeline.clone(), settings, cancel.clone()));

    for _ in 0..100 {
        if source.calls() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        source.calls() >= 3,
        "failed cycles were not retried on the backoff: {} call(s)",
        source.calls()
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop exits promptly")
        .expect("loop task");

    let report = pipeline.last_report().await.expect("report");
    assert!(!report.ok);
    assert_eq!(report.error_kind, Some(CycleErrorKind::Fetch));
    assert_eq!(pipeline.store().row_count().await.expect("rows"), 0);
}
