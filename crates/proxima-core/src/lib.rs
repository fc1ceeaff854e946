//! Core domain model for the Proxima tracker: planet records, normalization,
//! change detection and the weekly schedule gate.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Datelike, SecondsFormat, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "proxima-core";

/// One planet record exactly as the upstream API returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPlanet {
    pub name: String,
    pub coordinates: String,
    pub score: u64,
    #[serde(rename = "deleteOn")]
    pub delete_on: String,
}

/// One stored observation of a planet. `captured_at` is `None` until the
/// versioned store assigns the capture instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanetObservation {
    pub name: String,
    pub coordinates: String,
    pub score: u64,
    pub expires_at: String,
    pub period_number: i64,
    pub captured_at: Option<DateTime<Utc>>,
}

impl PlanetObservation {
    /// Reverse projection onto the upstream wire shape, used for change detection.
    pub fn to_raw(&self) -> RawPlanet {
        RawPlanet {
            name: self.name.clone(),
            coordinates: self.coordinates.clone(),
            score: self.score,
            delete_on: self.expires_at.clone(),
        }
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.expires_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn name_suffix(&self) -> i64 {
        name_suffix(&self.name)
    }
}

pub fn normalize(raw: &RawPlanet) -> PlanetObservation {
    PlanetObservation {
        name: raw.name.clone(),
        coordinates: raw.coordinates.clone(),
        score: raw.score,
        expires_at: canonical_timestamp(&raw.delete_on),
        period_number: period_number(&raw.name),
        captured_at: None,
    }
}

pub fn normalize_all(raw: &[RawPlanet]) -> Vec<PlanetObservation> {
    raw.iter().map(normalize).collect()
}

/// Week number encoded in names like `"Proxima 10-1"`; `0` when absent.
pub fn period_number(name: &str) -> i64 {
    second_token_part(name, 0)
}

/// Secondary number of names like `"Proxima 10-1"` (here `1`); `0` when absent.
pub fn name_suffix(name: &str) -> i64 {
    second_token_part(name, 1)
}

fn second_token_part(name: &str, index: usize) -> i64 {
    name.split_whitespace()
        .nth(1)
        .and_then(|token| token.split('-').nth(index))
        .and_then(|part| part.parse::<i64>().ok())
        .unwrap_or(0)
}

/// Canonical UTC text for an RFC 3339 timestamp. Input that does not parse is
/// kept verbatim (trimmed) so the record is still stored.
pub fn canonical_timestamp(text: &str) -> String {
    let trimmed = text.trim();
    match DateTime::parse_from_rfc3339(trimmed) {
        Ok(dt) => {
            let utc = dt.with_timezone(&Utc);
            let format = if utc.nanosecond() == 0 {
                SecondsFormat::Secs
            } else {
                SecondsFormat::Micros
            };
            utc.to_rfc3339_opts(format, true)
        }
        Err(_) => trimmed.to_string(),
    }
}

/// `DD.MM.YYYY HH:MM` in UTC for display, falling back to the raw text.
pub fn format_expiry(text: &str) -> String {
    match DateTime::parse_from_rfc3339(text.trim()) {
        Ok(dt) => dt.with_timezone(&Utc).format("%d.%m.%Y %H:%M").to_string(),
        Err(_) => text.to_string(),
    }
}

/// Sorted-key JSON serialization of a record with its timestamp canonicalized.
pub fn canonical_record(raw: &RawPlanet) -> String {
    serde_json::json!({
        "name": raw.name,
        "coordinates": raw.coordinates,
        "score": raw.score,
        "deleteOn": canonical_timestamp(&raw.delete_on),
    })
    .to_string()
}

/// Keeps one item per key: the first occurrence fixes the position, the last
/// occurrence supplies the value.
pub fn dedupe_last_wins<'a, T>(items: &'a [T], key: impl Fn(&'a T) -> &'a str) -> Vec<&'a T> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut kept: Vec<&T> = Vec::with_capacity(items.len());
    for item in items {
        match positions.get(key(item)) {
            Some(&idx) => kept[idx] = item,
            None => {
                positions.insert(key(item), kept.len());
                kept.push(item);
            }
        }
    }
    kept
}

/// A fetched list with repeated names collapsed, last record wins.
pub fn dedupe_by_name(records: &[RawPlanet]) -> Vec<RawPlanet> {
    dedupe_last_wins(records, |r| r.name.as_str())
        .into_iter()
        .cloned()
        .collect()
}

fn canonical_set<'a>(records: impl Iterator<Item = &'a RawPlanet>) -> BTreeSet<String> {
    records.map(canonical_record).collect()
}

/// Order-independent comparison between the previously stored capture and a
/// freshly fetched list.
pub fn has_changed(previous: &[PlanetObservation], fetched: &[RawPlanet]) -> bool {
    if previous.len() != fetched.len() {
        return true;
    }
    let previous_raw = previous.iter().map(PlanetObservation::to_raw).collect::<Vec<_>>();
    canonical_set(previous_raw.iter()) != canonical_set(fetched.iter())
}

/// SHA-256 over the sorted canonical records.
pub fn snapshot_fingerprint(records: &[RawPlanet]) -> String {
    let mut hasher = Sha256::new();
    for line in canonical_set(records.iter()) {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrder {
    #[default]
    ScoreDesc,
    PeriodDesc,
}

impl SnapshotOrder {
    pub fn compare(self, a: &PlanetObservation, b: &PlanetObservation) -> Ordering {
        match self {
            SnapshotOrder::ScoreDesc => b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)),
            SnapshotOrder::PeriodDesc => b
                .period_number
                .cmp(&a.period_number)
                .then_with(|| a.name_suffix().cmp(&b.name_suffix()))
                .then_with(|| a.name.cmp(&b.name)),
        }
    }
}

/// Latest observation per planet name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub observations: Vec<PlanetObservation>,
}

impl Snapshot {
    pub fn new(observations: Vec<PlanetObservation>) -> Self {
        Self { observations }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn ordered(&self, order: SnapshotOrder) -> Vec<PlanetObservation> {
        let mut rows = self.observations.clone();
        rows.sort_by(|a, b| order.compare(a, b));
        rows
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatistics {
    pub total_entities: u64,
    pub latest_period: Option<i64>,
    pub last_capture_time: Option<DateTime<Utc>>,
}

impl SnapshotStatistics {
    pub fn latest_period_or_zero(&self) -> i64 {
        self.latest_period.unwrap_or(0)
    }

    pub fn last_update_label(&self) -> String {
        self.last_capture_time
            .map(|t| t.format("%d.%m.%Y %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Waiting,
    Eligible,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule hours must satisfy start < end <= 24 (got {start}..{end})")]
    InvalidHours { start: u32, end: u32 },
}

/// Weekly window in which automatic cycles may run: one weekday, hours
/// `[start_hour, end_hour)` of the evaluated clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    weekday: Weekday,
    start_hour: u32,
    end_hour: u32,
}

impl Default for ScheduleWindow {
    fn default() -> Self {
        Self {
            weekday: Weekday::Wed,
            start_hour: 17,
            end_hour: 23,
        }
    }
}

impl ScheduleWindow {
    pub fn new(weekday: Weekday, start_hour: u32, end_hour: u32) -> Result<Self, ScheduleError> {
        if start_hour >= end_hour || end_hour > 24 {
            return Err(ScheduleError::InvalidHours {
                start: start_hour,
                end: end_hour,
            });
        }
        Ok(Self {
            weekday,
            start_hour,
            end_hour,
        })
    }

    pub fn weekday(&self) -> Weekday {
        self.weekday
    }

    pub fn start_hour(&self) -> u32 {
        self.start_hour
    }

    pub fn end_hour(&self) -> u32 {
        self.end_hour
    }

    pub fn evaluate<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> GateState {
        if at.weekday() == self.weekday && (self.start_hour..self.end_hour).contains(&at.hour()) {
            GateState::Eligible
        } else {
            GateState::Waiting
        }
    }

    pub fn is_eligible<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.evaluate(at) == GateState::Eligible
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:00-{:02}:00",
            self.weekday, self.start_hour, self.end_hour
        )
    }
}
