//! Cycle orchestration: schedule gate, fetch, change detection, versioned
//! append, output files and notification fan-out, plus the poll loop that
//! drives it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, SubsecRound, Utc};
use proxima_adapters::{ApiPlanetSource, FetchContext, PlanetSource, SourceError};
use proxima_core::{
    dedupe_by_name, has_changed, normalize_all, snapshot_fingerprint, GateState, PlanetObservation, RawPlanet,
    ScheduleWindow, Snapshot, SnapshotOrder, SnapshotStatistics,
};
use proxima_notify::export::{encode, export_document, export_file_name};
use proxima_notify::sink::build_client;
use proxima_notify::{
    ExportFormat, Notifier, NotifyReport, RenderOptions, RenderStyle, SinkTarget, WebhookSink,
};
use proxima_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, OutputStore, PersistenceError, StoredOutput,
    VersionedStore,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod report;

pub use config::{ConfigError, ProximaConfig, SinkConfig};
pub use report::{render_html_report, write_outputs, DATA_FILE, REPORT_FILE};

pub const CRATE_NAME: &str = "proxima-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Loop tick; subject to the schedule gate.
    Scheduled,
    /// Manual run; bypasses the gate.
    Forced,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] SourceError),
    #[error("store failed: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleErrorKind {
    Fetch,
    Persistence,
}

impl CycleError {
    pub fn kind(&self) -> CycleErrorKind {
        match self {
            CycleError::Fetch(_) => CycleErrorKind::Fetch,
            CycleError::Persistence(_) => CycleErrorKind::Persistence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangedCycle {
    pub fetched: usize,
    pub appended: usize,
    pub fingerprint: String,
    pub captured_at: DateTime<Utc>,
    pub total_entities: u64,
    pub outputs: Vec<String>,
    pub output_error: Option<String>,
    pub notify: Option<NotifyReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// The gate was closed; nothing was fetched.
    Skipped { window: String },
    /// The fetched list matched the newest capture; nothing was written.
    Unchanged { fetched: usize, fingerprint: String },
    Changed(ChangedCycle),
}

/// Result of one cycle as seen by callers that need a yes/no answer.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
    pub outcome: Option<CycleOutcome>,
    pub error: Option<String>,
    pub error_kind: Option<CycleErrorKind>,
}

/// Process start time and deployment label, reported by the status API.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub started_at: DateTime<Utc>,
    pub environment: String,
    pub version: &'static str,
    started: Instant,
}

impl ServiceContext {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            started_at: Utc::now(),
            environment: environment.into(),
            version: env!("CARGO_PKG_VERSION"),
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

pub struct SyncPipeline {
    source: Box<dyn PlanetSource>,
    store: VersionedStore,
    outputs: OutputStore,
    notifier: Option<Notifier>,
    gate: ScheduleWindow,
    order: SnapshotOrder,
    cycle_lock: Mutex<()>,
    last_report: RwLock<Option<CycleReport>>,
}

impl SyncPipeline {
    pub fn new(source: Box<dyn PlanetSource>, store: VersionedStore, outputs: OutputStore) -> Self {
        Self {
            source,
            store,
            outputs,
            notifier: None,
            gate: ScheduleWindow::default(),
            order: SnapshotOrder::ScoreDesc,
            cycle_lock: Mutex::new(()),
            last_report: RwLock::new(None),
        }
    }

    pub fn with_gate(mut self, gate: ScheduleWindow) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = (!notifier.is_empty()).then_some(notifier);
        self
    }

    pub fn with_source(mut self, source: Box<dyn PlanetSource>) -> Self {
        self.source = source;
        self
    }

    /// Wires the live API source, the store at `database_url` and the
    /// configured sinks.
    pub async fn from_config(config: &ProximaConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let source = ApiPlanetSource::new(config.api_url.clone(), http);
        let store = VersionedStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening store {}", config.database_url))?;
        let outputs = OutputStore::new(config.output_dir.clone());

        let pipeline = Self::new(Box::new(source), store, outputs).with_gate(config.schedule);
        if !config.notifications_enabled() {
            warn!("no webhook sinks configured; notifications disabled");
            return Ok(pipeline);
        }
        Ok(pipeline.with_notifier(build_notifier(config)?))
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    pub fn gate(&self) -> &ScheduleWindow {
        &self.gate
    }

    pub fn notifier(&self) -> Option<&Notifier> {
        self.notifier.as_ref()
    }

    pub fn source_location(&self) -> String {
        self.source.location()
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    pub async fn current_snapshot(&self) -> Result<(Snapshot, SnapshotStatistics), PersistenceError> {
        let snapshot = self.store.latest_snapshot().await?;
        let stats = self.store.statistics().await?;
        Ok((snapshot, stats))
    }

    /// Runs one cycle and records it as the last report. Errors are folded
    /// into the report; this never fails.
    pub async fn run_reported(&self, trigger: Trigger) -> CycleReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let result = self.run_cycle_with_id(run_id, trigger).await;
        let mut report = CycleReport {
            run_id,
            trigger,
            started_at,
            finished_at: Utc::now(),
            ok: result.is_ok(),
            outcome: None,
            error: None,
            error_kind: None,
        };
        match result {
            Ok(outcome) => report.outcome = Some(outcome),
            Err(err) => {
                error!(%run_id, error = %err, kind = ?err.kind(), "cycle failed");
                report.error_kind = Some(err.kind());
                report.error = Some(err.to_string());
            }
        }
        if !matches!(report.outcome, Some(CycleOutcome::Skipped { .. })) {
            *self.last_report.write().await = Some(report.clone());
        }
        report
    }

    pub async fn run_cycle(&self, trigger: Trigger) -> Result<CycleOutcome, CycleError> {
        self.run_cycle_with_id(Uuid::new_v4(), trigger).await
    }

    async fn run_cycle_with_id(&self, run_id: Uuid, trigger: Trigger) -> Result<CycleOutcome, CycleError> {
        let span = info_span!("cycle", %run_id, ?trigger, source = self.source.source_id());
        self.cycle(run_id, trigger).instrument(span).await
    }

    async fn cycle(&self, run_id: Uuid, trigger: Trigger) -> Result<CycleOutcome, CycleError> {
        if trigger == Trigger::Scheduled && self.gate.evaluate(&Local::now()) == GateState::Waiting {
            return Ok(CycleOutcome::Skipped {
                window: self.gate.to_string(),
            });
        }

        let _guard = self.cycle_lock.lock().await;

        let fetched = self.source.fetch_planets(&FetchContext::new(run_id)).await?;
        let received = fetched.len();
        let fetched = dedupe_by_name(&fetched);
        if fetched.len() < received {
            warn!(
                received,
                distinct = fetched.len(),
                "source repeated planet names; keeping the last record of each"
            );
        }
        let fingerprint = snapshot_fingerprint(&fetched);
        if fetched.is_empty() {
            warn!(location = %self.source.location(), "source returned no planets; keeping previous capture");
            return Ok(CycleOutcome::Unchanged {
                fetched: 0,
                fingerprint,
            });
        }

        let previous = self.store.latest_capture().await?;
        if !has_changed(&previous, &fetched) {
            info!(fetched = fetched.len(), %fingerprint, "no change since last capture");
            return Ok(CycleOutcome::Unchanged {
                fetched: fetched.len(),
                fingerprint,
            });
        }

        let observations = normalize_all(&fetched);
        log_lossy_fields(&fetched, &observations);

        let captured_at = next_capture_time(&previous, Utc::now());
        let appended = self.store.append(&observations, captured_at).await?;
        let (snapshot, stats) = self.current_snapshot().await?;
        info!(
            fetched = fetched.len(),
            appended,
            total_entities = stats.total_entities,
            %fingerprint,
            "stored new capture"
        );

        let (outputs, output_error) =
            match report::write_outputs(&self.outputs, &snapshot, &stats, self.order).await {
                Ok(written) => (
                    written
                        .iter()
                        .map(|o: &StoredOutput| o.path.display().to_string())
                        .collect(),
                    None,
                ),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "writing output files failed");
                    (Vec::new(), Some(format!("{err:#}")))
                }
            };

        let notify = match &self.notifier {
            Some(notifier) => Some(notifier.notify(&snapshot, &stats).await),
            None => None,
        };

        Ok(CycleOutcome::Changed(ChangedCycle {
            fetched: fetched.len(),
            appended,
            fingerprint,
            captured_at,
            total_entities: stats.total_entities,
            outputs,
            output_error,
            notify,
        }))
    }

    /// Delivers the stored snapshot without fetching, optionally in one style only.
    pub async fn notify_current(&self, style: Option<RenderStyle>) -> Result<NotifyReport> {
        let notifier = self
            .notifier
            .as_ref()
            .context("no webhook sinks configured")?;
        let (snapshot, stats) = self.current_snapshot().await?;
        Ok(notifier.notify_with(&snapshot, &stats, style).await)
    }

    /// Encodes the stored snapshot in `format`, returning the suggested file
    /// name and the bytes.
    pub async fn export_current(&self, format: ExportFormat) -> Result<(String, Vec<u8>)> {
        let (snapshot, stats) = self.current_snapshot().await?;
        let document = export_document(&snapshot, &stats, self.order);
        let bytes = encode(format, &document).with_context(|| format!("encoding {format} export"))?;
        Ok((export_file_name(format, &stats), bytes))
    }
}

/// Capture instants must strictly increase at the store's microsecond
/// precision; a clock that went backwards is nudged past the newest capture.
fn next_capture_time(previous: &[PlanetObservation], now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    let newest = previous.iter().filter_map(|o| o.captured_at).max();
    match newest {
        Some(newest) if now <= newest.trunc_subsecs(6) => {
            warn!(%now, %newest, "clock is behind the newest capture");
            newest.trunc_subsecs(6) + chrono::Duration::microseconds(1)
        }
        _ => now,
    }
}

fn log_lossy_fields(fetched: &[RawPlanet], observations: &[PlanetObservation]) {
    let unnumbered = observations.iter().filter(|o| o.period_number == 0).count();
    if unnumbered > 0 {
        warn!(count = unnumbered, "planet names without a week number; stored with period 0");
    }
    let unparsed = fetched
        .iter()
        .zip(observations)
        .filter(|(_, o)| o.expires_at_utc().is_none())
        .map(|(raw, _)| raw.delete_on.as_str())
        .collect::<Vec<_>>();
    if let Some(example) = unparsed.first() {
        warn!(count = unparsed.len(), example, "unparseable deleteOn values stored verbatim");
    }
}

pub fn build_notifier(config: &ProximaConfig) -> Result<Notifier> {
    let client = build_client(config.http_timeout, Some(&config.user_agent))
        .context("building webhook client")?;
    let targets = config
        .sinks
        .iter()
        .map(|sink| {
            let mut webhook = WebhookSink::new(sink.name.clone(), sink.url.clone(), client.clone());
            if let Some(status) = sink.success_status {
                webhook = webhook.with_success_status(status);
            }
            SinkTarget {
                sink: webhook,
                styles: sink.styles.clone(),
            }
        })
        .collect();
    let options = RenderOptions {
        page_size: config.page_size,
        ..Default::default()
    };
    Ok(Notifier::new(targets, options).with_page_delay(config.page_delay))
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub failure_backoff: BackoffPolicy,
}

impl LoopSettings {
    pub fn from_config(config: &ProximaConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            failure_backoff: BackoffPolicy {
                max_retries: usize::MAX,
                base_delay: config.retry_backoff.min(config.poll_interval),
                max_delay: config.poll_interval,
            },
        }
    }

    /// Delay before the next tick given the number of consecutive failures.
    pub fn delay_after(&self, consecutive_failures: usize) -> Duration {
        if consecutive_failures == 0 {
            return self.poll_interval;
        }
        self.failure_backoff
            .delay_for_attempt(consecutive_failures - 1)
            .min(self.poll_interval)
    }
}

/// Polls until `cancel` fires. A cycle in progress finishes before the loop
/// observes cancellation; failed cycles are retried on the failure backoff.
pub async fn run_loop(pipeline: Arc<SyncPipeline>, settings: LoopSettings, cancel: CancellationToken) {
    info!(
        gate = %pipeline.gate(),
        poll_secs = settings.poll_interval.as_secs(),
        source = %pipeline.source_location(),
        "poll loop started"
    );
    let mut failures = 0usize;
    while !cancel.is_cancelled() {
        let report = pipeline.run_reported(Trigger::Scheduled).await;
        if report.ok {
            failures = 0;
        } else {
            failures += 1;
        }
        let delay = settings.delay_after(failures);
        if failures > 0 {
            warn!(failures, retry_in_secs = delay.as_secs_f64(), "cycle failed; backing off");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("poll loop stopped");
}
