//! Append-only SQLite history of planet observations (sqlx).

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use proxima_core::{dedupe_last_wins, PlanetObservation, Snapshot, SnapshotStatistics};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("capture time {attempted} is not later than the newest stored capture {newest}")]
    NonMonotonicCapture { attempted: String, newest: String },
    #[error("score {score} of {name} does not fit the store")]
    ScoreOutOfRange { name: String, score: u64 },
    #[error("stored row has an unreadable timestamp {value:?}")]
    CorruptTimestamp { value: String },
}

#[derive(Debug, sqlx::FromRow)]
struct ObservationRow {
    name: String,
    coordinates: String,
    score: i64,
    expires_at: String,
    period_number: i64,
    captured_at: String,
}

impl TryFrom<ObservationRow> for PlanetObservation {
    type Error = PersistenceError;

    fn try_from(row: ObservationRow) -> Result<Self, Self::Error> {
        Ok(PlanetObservation {
            name: row.name,
            coordinates: row.coordinates,
            score: u64::try_from(row.score).unwrap_or(0),
            expires_at: row.expires_at,
            period_number: row.period_number,
            captured_at: Some(decode_capture_time(&row.captured_at)?),
        })
    }
}

/// Fixed-width UTC text with microseconds, so lexical and chronological order agree.
pub(crate) fn encode_capture_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_capture_time(value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PersistenceError::CorruptTimestamp {
            value: value.to_string(),
        })
}

fn rows_to_observations(rows: Vec<ObservationRow>) -> Result<Vec<PlanetObservation>, PersistenceError> {
    rows.into_iter().map(PlanetObservation::try_from).collect()
}

const SELECT_COLUMNS: &str = "name, coordinates, score, expires_at, period_number, captured_at";

#[derive(Debug, Clone)]
pub struct VersionedStore {
    pool: SqlitePool,
}

impl VersionedStore {
    /// Opens (creating if needed) the database at `database_url` and applies migrations.
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(database_url, "versioned store ready");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, PersistenceError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts every observation with the shared `captured_at` in one
    /// transaction. A name repeated inside the batch keeps its last record.
    pub async fn append(
        &self,
        observations: &[PlanetObservation],
        captured_at: DateTime<Utc>,
    ) -> Result<usize, PersistenceError> {
        if observations.is_empty() {
            return Ok(0);
        }
        let stamp = encode_capture_time(captured_at.trunc_subsecs(6));

        let batch = dedupe_last_wins(observations, |obs| obs.name.as_str());

        let mut tx = self.pool.begin().await?;

        let newest: Option<String> =
            sqlx::query_scalar("SELECT MAX(captured_at) FROM planet_observations")
                .fetch_one(&mut *tx)
                .await?;
        if let Some(newest) = newest {
            if newest >= stamp {
                return Err(PersistenceError::NonMonotonicCapture {
                    attempted: stamp,
                    newest,
                });
            }
        }

        for obs in &batch {
            let score = i64::try_from(obs.score).map_err(|_| PersistenceError::ScoreOutOfRange {
                name: obs.name.clone(),
                score: obs.score,
            })?;
            sqlx::query(
                r#"
                INSERT INTO planet_observations
                    (name, coordinates, score, expires_at, period_number, captured_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&obs.name)
            .bind(&obs.coordinates)
            .bind(score)
            .bind(&obs.expires_at)
            .bind(obs.period_number)
            .bind(&stamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(rows = batch.len(), captured_at = %stamp, "appended capture");
        Ok(batch.len())
    }

    /// Latest row per name, ordered by score descending.
    pub async fn latest_snapshot(&self) -> Result<Snapshot, PersistenceError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
              FROM (
                    SELECT {SELECT_COLUMNS},
                           ROW_NUMBER() OVER (
                               PARTITION BY name
                               ORDER BY captured_at DESC, id DESC
                           ) AS rn
                      FROM planet_observations
                   )
             WHERE rn = 1
             ORDER BY score DESC, name ASC
            "#
        );
        let rows: Vec<ObservationRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(Snapshot::new(rows_to_observations(rows)?))
    }

    /// Rows written by the most recent capture, in insertion order.
    pub async fn latest_capture(&self) -> Result<Vec<PlanetObservation>, PersistenceError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
              FROM planet_observations
             WHERE captured_at = (SELECT MAX(captured_at) FROM planet_observations)
             ORDER BY id
            "#
        );
        let rows: Vec<ObservationRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows_to_observations(rows)
    }

    pub async fn history(&self, name: &str) -> Result<Vec<PlanetObservation>, PersistenceError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM planet_observations WHERE name = ? ORDER BY captured_at, id"
        );
        let rows: Vec<ObservationRow> = sqlx::query_as(&sql)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        rows_to_observations(rows)
    }

    /// Aggregates over the full history.
    pub async fn statistics(&self) -> Result<SnapshotStatistics, PersistenceError> {
        let (total, latest_period, last_capture): (i64, Option<i64>, Option<String>) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT name), MAX(period_number), MAX(captured_at)
              FROM planet_observations
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(SnapshotStatistics {
            total_entities: u64::try_from(total).unwrap_or(0),
            latest_period,
            last_capture_time: last_capture.as_deref().map(decode_capture_time).transpose()?,
        })
    }

    pub async fn row_count(&self) -> Result<u64, PersistenceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM planet_observations")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
