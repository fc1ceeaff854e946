//! Published output files: the JSON data document and the HTML report.

use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, Utc};
use proxima_core::{format_expiry, Snapshot, SnapshotOrder, SnapshotStatistics};
use proxima_notify::export::{export_document, ExportDocument};
use proxima_notify::{group_thousands, ScoreTier};
use proxima_storage::{OutputStore, StoredOutput};

pub const DATA_FILE: &str = "proxima_data.json";
pub const REPORT_FILE: &str = "proxima_report.html";

#[derive(Debug, Clone)]
struct ReportRow {
    rank: usize,
    name: String,
    coordinates: String,
    score: String,
    expires: String,
    week: i64,
    tier_class: &'static str,
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate {
    total_planets: u64,
    latest_week: i64,
    last_update: String,
    generated_at: String,
    rows: Vec<ReportRow>,
}

pub fn render_html_report(
    snapshot: &Snapshot,
    stats: &SnapshotStatistics,
    order: SnapshotOrder,
    generated_at: DateTime<Utc>,
) -> Result<String> {
    let rows = snapshot
        .ordered(order)
        .into_iter()
        .enumerate()
        .map(|(idx, planet)| ReportRow {
            rank: idx + 1,
            score: group_thousands(planet.score),
            expires: format_expiry(&planet.expires_at),
            week: planet.period_number,
            tier_class: ScoreTier::of(planet.score).css_class(),
            name: planet.name,
            coordinates: planet.coordinates,
        })
        .collect();

    ReportTemplate {
        total_planets: stats.total_entities,
        latest_week: stats.latest_period_or_zero(),
        last_update: stats.last_update_label(),
        generated_at: generated_at.format("%d.%m.%Y %H:%M UTC").to_string(),
        rows,
    }
    .render()
    .context("rendering proxima_report.html")
}

pub fn data_document(snapshot: &Snapshot, stats: &SnapshotStatistics, order: SnapshotOrder) -> ExportDocument {
    export_document(snapshot, stats, order)
}

/// Regenerates both output files wholesale. Each file is replaced atomically.
pub async fn write_outputs(
    outputs: &OutputStore,
    snapshot: &Snapshot,
    stats: &SnapshotStatistics,
    order: SnapshotOrder,
) -> Result<Vec<StoredOutput>> {
    let document = data_document(snapshot, stats, order);
    let json = serde_json::to_vec_pretty(&document).context("serializing proxima_data.json")?;
    let html = render_html_report(snapshot, stats, order, Utc::now())?;

    let data = outputs.write_atomic(DATA_FILE, &json).await?;
    let report = outputs.write_atomic(REPORT_FILE, html.as_bytes()).await?;
    Ok(vec![data, report])
}
