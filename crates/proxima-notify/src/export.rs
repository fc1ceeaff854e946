//! Full-snapshot exports attached to webhook messages: JSON, CSV and Parquet.

use std::fmt;
use std::sync::Arc;

use arrow_array::{Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{ArrowError, DataType, Field, Schema};
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use proxima_core::{Snapshot, SnapshotOrder, SnapshotStatistics};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::FileAttachment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    Parquet,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Parquet => "parquet",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
            ExportFormat::Parquet => "application/vnd.apache.parquet",
        }
    }

    pub(crate) fn style_name(self) -> &'static str {
        self.extension()
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Parquet(#[from] ParquetError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One row of the exported planet list, in the upstream field naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow {
    pub name: String,
    pub coordinates: String,
    pub score: u64,
    pub delete_on: String,
    pub week_number: i64,
}

/// The published data document (`proxima_data.json` and the JSON export).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub total_planets: u64,
    pub latest_week: i64,
    pub last_update: Option<String>,
    pub planets: Vec<ExportRow>,
}

pub fn export_document(
    snapshot: &Snapshot,
    stats: &SnapshotStatistics,
    order: SnapshotOrder,
) -> ExportDocument {
    ExportDocument {
        total_planets: stats.total_entities,
        latest_week: stats.latest_period_or_zero(),
        last_update: stats.last_capture_time.map(|t| t.to_rfc3339()),
        planets: snapshot
            .ordered(order)
            .into_iter()
            .map(|p| ExportRow {
                name: p.name,
                coordinates: p.coordinates,
                score: p.score,
                delete_on: p.expires_at,
                week_number: p.period_number,
            })
            .collect(),
    }
}

fn export_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("name", DataType::Utf8, false),
        Field::new("coordinates", DataType::Utf8, false),
        Field::new("score", DataType::UInt64, false),
        Field::new("deleteOn", DataType::Utf8, false),
        Field::new("weekNumber", DataType::Int64, false),
    ]))
}

pub fn record_batch(rows: &[ExportRow]) -> Result<RecordBatch, ArrowError> {
    let names = StringArray::from(rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>());
    let coordinates = StringArray::from(rows.iter().map(|r| r.coordinates.as_str()).collect::<Vec<_>>());
    let scores = UInt64Array::from(rows.iter().map(|r| r.score).collect::<Vec<_>>());
    let delete_on = StringArray::from(rows.iter().map(|r| r.delete_on.as_str()).collect::<Vec<_>>());
    let weeks = Int64Array::from(rows.iter().map(|r| r.week_number).collect::<Vec<_>>());

    RecordBatch::try_new(
        export_schema(),
        vec![
            Arc::new(names),
            Arc::new(coordinates),
            Arc::new(scores),
            Arc::new(delete_on),
            Arc::new(weeks),
        ],
    )
}

pub fn encode_csv(rows: &[ExportRow]) -> Result<Vec<u8>, ExportError> {
    let batch = record_batch(rows)?;
    let mut writer = arrow_csv::WriterBuilder::new()
        .with_header(true)
        .build(Vec::new());
    writer.write(&batch)?;
    Ok(writer.into_inner())
}

pub fn encode_parquet(rows: &[ExportRow]) -> Result<Vec<u8>, ExportError> {
    let batch = record_batch(rows)?;
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)?;
    writer.write(&batch)?;
    Ok(writer.into_inner()?)
}

pub fn encode(format: ExportFormat, document: &ExportDocument) -> Result<Vec<u8>, ExportError> {
    match format {
        ExportFormat::Csv => encode_csv(&document.planets),
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(document)?),
        ExportFormat::Parquet => encode_parquet(&document.planets),
    }
}

/// `proxima_data_YYYYMMDD_HHMMSS.<ext>`, stamped with the last capture time.
pub fn export_file_name(format: ExportFormat, stats: &SnapshotStatistics) -> String {
    let stamp = stats.last_capture_time.unwrap_or_else(Utc::now);
    format!(
        "proxima_data_{}.{}",
        stamp.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

pub(crate) fn build_attachment(
    format: ExportFormat,
    snapshot: &Snapshot,
    stats: &SnapshotStatistics,
    order: SnapshotOrder,
) -> Result<FileAttachment, ExportError> {
    let document = export_document(snapshot, stats, order);
    Ok(FileAttachment {
        file_name: export_file_name(format, stats),
        content_type: format.content_type(),
        bytes: encode(format, &document)?,
    })
}
