//! Snapshot renderings for chat webhooks and their delivery.
//!
//! Every rendering is a pure function of a [`Snapshot`] and its
//! [`SnapshotStatistics`]; delivery lives in [`sink`].

use std::fmt;
use std::str::FromStr;

use proxima_core::{format_expiry, PlanetObservation, Snapshot, SnapshotOrder, SnapshotStatistics};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod export;
pub mod sink;

pub use export::{ExportError, ExportFormat};
pub use sink::{DeliveryError, DeliveryOutcome, Notifier, NotifyReport, SinkTarget, WebhookSink};

pub const CRATE_NAME: &str = "proxima-notify";

/// Maximum `content` length accepted by the webhook.
pub const CONTENT_LIMIT: usize = 2000;
/// Maximum number of fields in one embed.
pub const EMBED_FIELD_LIMIT: usize = 25;
pub const EMBED_FIELD_NAME_LIMIT: usize = 256;
pub const EMBED_FIELD_VALUE_LIMIT: usize = 1024;
pub const EMBED_COLOR: u32 = 0x00FF88;

const NAME_WIDTH: usize = 18;
const COORD_WIDTH: usize = 14;
const TITLE: &str = "🌌 **Proxima - Planet Overview**";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RenderStyle {
    Embed,
    Table,
    Website,
    Paginated,
    Minimal,
    Export(ExportFormat),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown render style {0:?}")]
pub struct UnknownStyle(pub String);

impl FromStr for RenderStyle {
    type Err = UnknownStyle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embed" | "card" => Ok(RenderStyle::Embed),
            "table" | "simple" => Ok(RenderStyle::Table),
            "website" => Ok(RenderStyle::Website),
            "paginated" | "all" => Ok(RenderStyle::Paginated),
            "minimal" | "list" => Ok(RenderStyle::Minimal),
            "csv" | "spreadsheet" => Ok(RenderStyle::Export(ExportFormat::Csv)),
            "json" => Ok(RenderStyle::Export(ExportFormat::Json)),
            "parquet" => Ok(RenderStyle::Export(ExportFormat::Parquet)),
            other => Err(UnknownStyle(other.to_string())),
        }
    }
}

impl TryFrom<String> for RenderStyle {
    type Error = UnknownStyle;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RenderStyle> for String {
    fn from(style: RenderStyle) -> Self {
        style.to_string()
    }
}

impl fmt::Display for RenderStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenderStyle::Embed => "embed",
            RenderStyle::Table => "table",
            RenderStyle::Website => "website",
            RenderStyle::Paginated => "paginated",
            RenderStyle::Minimal => "minimal",
            RenderStyle::Export(format) => format.style_name(),
        };
        f.write_str(name)
    }
}

/// Parses a comma separated style list such as `"minimal,csv"`.
pub fn parse_styles(list: &str) -> Result<Vec<RenderStyle>, UnknownStyle> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(RenderStyle::from_str)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    /// Leaderboard size of the embed.
    pub top_n: usize,
    /// Rows in the single-message tables.
    pub table_rows: usize,
    pub page_size: usize,
    pub content_limit: usize,
    pub order: SnapshotOrder,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            username: Some("Proxima Bot".to_string()),
            avatar_url: None,
            top_n: 10,
            table_rows: 15,
            page_size: 15,
            content_limit: CONTENT_LIMIT,
            order: SnapshotOrder::ScoreDesc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct WebhookMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// One webhook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Message(WebhookMessage),
    File {
        message: WebhookMessage,
        attachment: FileAttachment,
    },
}

impl Payload {
    pub fn message(&self) -> &WebhookMessage {
        match self {
            Payload::Message(message) => message,
            Payload::File { message, .. } => message,
        }
    }

    pub fn content(&self) -> Option<&str> {
        self.message().content.as_deref()
    }
}

/// A rendered snapshot: one or more payloads delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendering {
    pub style: RenderStyle,
    pub pages: Vec<Payload>,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("building {format} export: {source}")]
    Export {
        format: ExportFormat,
        #[source]
        source: ExportError,
    },
}

pub fn render(
    style: RenderStyle,
    snapshot: &Snapshot,
    stats: &SnapshotStatistics,
    options: &RenderOptions,
) -> Result<Rendering, RenderError> {
    let pages = match style {
        RenderStyle::Embed => vec![Payload::Message(render_embed(snapshot, stats, options))],
        RenderStyle::Table => vec![Payload::Message(render_table(snapshot, stats, options))],
        RenderStyle::Website => vec![Payload::Message(render_website(snapshot, stats, options))],
        RenderStyle::Paginated => render_paginated(snapshot, stats, options)
            .into_iter()
            .map(Payload::Message)
            .collect(),
        RenderStyle::Minimal => render_minimal(snapshot, stats, options)
            .into_iter()
            .map(Payload::Message)
            .collect(),
        RenderStyle::Export(format) => {
            let attachment = export::build_attachment(format, snapshot, stats, options.order)
                .map_err(|source| RenderError::Export { format, source })?;
            let content = format!(
                "📁 **Complete Proxima export**\n📊 {} planets • week {}",
                stats.total_entities,
                stats.latest_period_or_zero()
            );
            vec![Payload::File {
                message: base_message(options, Some(content)),
                attachment,
            }]
        }
    };
    Ok(Rendering { style, pages })
}

fn base_message(options: &RenderOptions, content: Option<String>) -> WebhookMessage {
    WebhookMessage {
        username: options.username.clone(),
        avatar_url: options.avatar_url.clone(),
        content,
        embeds: Vec::new(),
    }
}

/// `1234567` -> `"1,234,567"`.
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn statistics_block(stats: &SnapshotStatistics) -> String {
    format!(
        "📊 **Statistics:**\n• Total planets: **{}**\n• Current week: **{}**",
        stats.total_entities,
        stats.latest_period_or_zero()
    )
}

fn last_updated_footer(stats: &SnapshotStatistics) -> String {
    format!("⏰ Last updated: {}", stats.last_update_label())
}

fn rank_marker(rank: usize) -> String {
    match rank {
        1 => "🥇".to_string(),
        2 => "🥈".to_string(),
        3 => "🥉".to_string(),
        n => format!("{n}."),
    }
}

fn render_embed(snapshot: &Snapshot, stats: &SnapshotStatistics, options: &RenderOptions) -> WebhookMessage {
    let top_n = options.top_n.min(EMBED_FIELD_LIMIT);
    let fields = snapshot
        .ordered(SnapshotOrder::ScoreDesc)
        .into_iter()
        .take(top_n)
        .enumerate()
        .map(|(idx, planet)| EmbedField {
            name: truncate_chars(
                &format!("{} {}", rank_marker(idx + 1), planet.name),
                EMBED_FIELD_NAME_LIMIT,
            ),
            value: truncate_chars(
                &format!(
                    "📍 `{}`\n💎 **{}** points\n⏰ {}\n📅 Week {}",
                    planet.coordinates,
                    group_thousands(planet.score),
                    format_expiry(&planet.expires_at),
                    planet.period_number
                ),
                EMBED_FIELD_VALUE_LIMIT,
            ),
            inline: true,
        })
        .collect::<Vec<_>>();

    let description = format!(
        "**Current Proxima data from Spacenations**\n\n📊 **Statistics:**\n• Total planets: **{}**\n• Current week: **{}**\n• Last updated: {}",
        stats.total_entities,
        stats.latest_period_or_zero(),
        stats.last_update_label()
    );

    let mut message = base_message(options, None);
    message.embeds.push(Embed {
        title: "🌌 Proxima - Planet Overview".to_string(),
        description,
        color: EMBED_COLOR,
        fields,
        footer: Some(EmbedFooter {
            text: "Spacenations Tools • Proxima".to_string(),
        }),
        timestamp: stats.last_capture_time.map(|t| t.to_rfc3339()),
    });
    message
}

fn table_header() -> [String; 2] {
    [
        format!(
            "{:>4} | {:<NAME_WIDTH$} | {:<COORD_WIDTH$} | {:>7} | {}",
            "Rank", "Name", "Coordinates", "Score", "Week"
        ),
        format!(
            "{}-|-{}-|-{}-|-{}-|-{}",
            "-".repeat(4),
            "-".repeat(NAME_WIDTH),
            "-".repeat(COORD_WIDTH),
            "-".repeat(7),
            "-".repeat(4)
        ),
    ]
}

fn table_row(rank: usize, planet: &PlanetObservation) -> String {
    format!(
        "{:>4} | {:<NAME_WIDTH$} | {:<COORD_WIDTH$} | {:>7} | W{}",
        rank,
        truncate_chars(&planet.name, NAME_WIDTH),
        truncate_chars(&planet.coordinates, COORD_WIDTH),
        group_thousands(planet.score),
        planet.period_number
    )
}

fn code_block(lang: &str, lines: &[String]) -> String {
    format!("```{lang}\n{}\n```", lines.join("\n"))
}

/// Lines of one code-block table. Only `rows` are ever trimmed; `header` and
/// `closing` frame whatever rows remain.
struct CodeTable<'a> {
    lang: &'a str,
    header: &'a [String],
    rows: &'a [String],
    closing: &'a [String],
}

impl CodeTable<'_> {
    fn block(&self, keep: usize) -> String {
        let lines = self
            .header
            .iter()
            .chain(self.rows[..keep].iter())
            .chain(self.closing.iter())
            .cloned()
            .collect::<Vec<_>>();
        code_block(self.lang, &lines)
    }
}

/// Joins `prefix`, the table's code block and `suffix`, dropping data rows
/// from the bottom until the result fits `limit`.
fn fit_code_table(prefix: &str, table: &CodeTable<'_>, suffix: &str, limit: usize) -> String {
    let mut keep = table.rows.len();
    loop {
        let text = format!("{prefix}{}{suffix}", table.block(keep));
        if char_len(&text) <= limit || keep == 0 {
            return text;
        }
        keep -= 1;
    }
}

fn render_table(snapshot: &Snapshot, stats: &SnapshotStatistics, options: &RenderOptions) -> WebhookMessage {
    let rows = snapshot
        .ordered(options.order)
        .iter()
        .take(options.table_rows)
        .enumerate()
        .map(|(idx, planet)| table_row(idx + 1, planet))
        .collect::<Vec<_>>();
    let prefix = format!("{TITLE}\n\n{}\n\n**Top planets:**\n", statistics_block(stats));
    let suffix = format!("\n\n{}", last_updated_footer(stats));
    let header = table_header();
    let table = CodeTable {
        lang: "",
        header: &header,
        rows: &rows,
        closing: &[],
    };
    let content = fit_code_table(&prefix, &table, &suffix, options.content_limit);
    base_message(options, Some(content))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreTier {
    High,
    Medium,
    Low,
}

impl ScoreTier {
    pub fn of(score: u64) -> Self {
        if score >= 500 {
            ScoreTier::High
        } else if score >= 200 {
            ScoreTier::Medium
        } else {
            ScoreTier::Low
        }
    }

    fn ansi_color(self) -> &'static str {
        match self {
            ScoreTier::High => "\u{1b}[1;32m",
            ScoreTier::Medium => "\u{1b}[1;33m",
            ScoreTier::Low => "\u{1b}[1;31m",
        }
    }

    pub fn css_class(self) -> &'static str {
        match self {
            ScoreTier::High => "score-high",
            ScoreTier::Medium => "score-medium",
            ScoreTier::Low => "score-low",
        }
    }
}

const ANSI_RESET: &str = "\u{1b}[0m";

fn render_website(snapshot: &Snapshot, stats: &SnapshotStatistics, options: &RenderOptions) -> WebhookMessage {
    let rule = |left: &str, mid: &str, right: &str| {
        format!(
            "{left}{}{mid}{}{mid}{}{mid}{}{mid}{}{right}",
            "─".repeat(6),
            "─".repeat(NAME_WIDTH + 2),
            "─".repeat(COORD_WIDTH + 2),
            "─".repeat(9),
            "─".repeat(6)
        )
    };
    let header = vec![
        rule("┌", "┬", "┐"),
        format!(
            "│ {:>4} │ {:<NAME_WIDTH$} │ {:<COORD_WIDTH$} │ {:>7} │ {:>4} │",
            "#", "Name", "Coordinates", "Score", "Week"
        ),
        rule("├", "┼", "┤"),
    ];
    let rows = snapshot
        .ordered(options.order)
        .iter()
        .take(options.table_rows)
        .enumerate()
        .map(|(idx, planet)| {
            format!(
                "│ {:>4} │ {:<NAME_WIDTH$} │ {:<COORD_WIDTH$} │ {}{:>7}{ANSI_RESET} │ {:>4} │",
                idx + 1,
                truncate_chars(&planet.name, NAME_WIDTH),
                truncate_chars(&planet.coordinates, COORD_WIDTH),
                ScoreTier::of(planet.score).ansi_color(),
                group_thousands(planet.score),
                format!("W{}", planet.period_number)
            )
        })
        .collect::<Vec<_>>();
    let closing = [rule("└", "┴", "┘")];

    let prefix = format!("{TITLE}\n{}\n", statistics_block(stats));
    let suffix = format!("\n{}", last_updated_footer(stats));
    let table = CodeTable {
        lang: "ansi",
        header: &header,
        rows: &rows,
        closing: &closing,
    };
    let content = fit_code_table(&prefix, &table, &suffix, options.content_limit);
    base_message(options, Some(content))
}

/// Splits `items` into consecutive pages of at most `page_size` entries.
pub fn paginate<T: Clone>(items: &[T], page_size: usize) -> Vec<Vec<T>> {
    items.chunks(page_size.max(1)).map(<[T]>::to_vec).collect()
}

/// Splits `rows` into pages of at most `page_size` rows whose code block
/// stays within `budget` characters. A row is never dropped: one that cannot
/// fit next to others opens a page of its own.
fn split_rows_to_fit(rows: &[String], page_size: usize, budget: usize) -> Vec<Vec<String>> {
    let header = table_header();
    let mut pages = Vec::new();
    for chunk in paginate(rows, page_size) {
        let mut current: Vec<String> = Vec::new();
        for row in chunk {
            current.push(row);
            let block = CodeTable {
                lang: "",
                header: &header,
                rows: &current,
                closing: &[],
            }
            .block(current.len());
            if current.len() > 1 && char_len(&block) > budget {
                let overflow = current.pop().into_iter().collect::<Vec<_>>();
                pages.push(std::mem::replace(&mut current, overflow));
            }
        }
        if !current.is_empty() {
            pages.push(current);
        }
    }
    pages
}

fn render_paginated(
    snapshot: &Snapshot,
    stats: &SnapshotStatistics,
    options: &RenderOptions,
) -> Vec<WebhookMessage> {
    let ordered = snapshot.ordered(options.order);
    if ordered.is_empty() {
        let content = format!(
            "{TITLE}\n\nNo planets recorded yet.\n\n{}",
            last_updated_footer(stats)
        );
        return vec![base_message(options, Some(content))];
    }

    let rows = ordered
        .iter()
        .enumerate()
        .map(|(idx, planet)| table_row(idx + 1, planet))
        .collect::<Vec<_>>();
    let stats_line = format!(
        "📊 {} planets • week {}\n",
        stats.total_entities,
        stats.latest_period_or_zero()
    );
    let footer = format!("\n{}", last_updated_footer(stats));
    // Budget against the widest possible page label and both optional parts.
    let widest_label = format!("{TITLE} (page {n}/{n})\n", n = rows.len());
    let budget = options
        .content_limit
        .saturating_sub(char_len(&widest_label) + char_len(&stats_line) + char_len(&footer));
    let pages = split_rows_to_fit(&rows, options.page_size.max(1), budget);

    let header = table_header();
    let total_pages = pages.len();
    pages
        .iter()
        .enumerate()
        .map(|(page_idx, lines)| {
            let mut prefix = format!("{TITLE} (page {}/{})\n", page_idx + 1, total_pages);
            if page_idx == 0 {
                prefix.push_str(&stats_line);
            }
            let suffix = if page_idx + 1 == total_pages {
                footer.as_str()
            } else {
                ""
            };
            let table = CodeTable {
                lang: "",
                header: &header,
                rows: lines,
                closing: &[],
            };
            let content = format!("{prefix}{}{suffix}", table.block(lines.len()));
            base_message(options, Some(content))
        })
        .collect()
}

/// Packs lines into as few messages as possible under `limit`. The header
/// opens the first message and the footer closes the last one.
fn pack_lines(header: &str, lines: &[String], footer: &str, limit: usize) -> Vec<String> {
    let mut messages = Vec::new();
    let mut current = header.to_string();
    for line in lines {
        let line = truncate_chars(line, limit);
        if !current.is_empty() && char_len(&current) + 1 + char_len(&line) > limit {
            messages.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(&line);
    }
    if !current.is_empty() && char_len(&current) + 2 + char_len(footer) > limit {
        messages.push(std::mem::take(&mut current));
    }
    if !current.is_empty() {
        current.push_str("\n\n");
    }
    current.push_str(footer);
    messages.push(current);
    messages
}

fn render_minimal(
    snapshot: &Snapshot,
    stats: &SnapshotStatistics,
    options: &RenderOptions,
) -> Vec<WebhookMessage> {
    let header = format!(
        "🌌 **Proxima** • {} planets • week {}\n",
        stats.total_entities,
        stats.latest_period_or_zero()
    );
    let lines = snapshot
        .ordered(options.order)
        .iter()
        .map(|p| format!("{} : {} : {}", p.name, group_thousands(p.score), p.coordinates))
        .collect::<Vec<_>>();
    pack_lines(&header, &lines, &last_updated_footer(stats), options.content_limit)
        .into_iter()
        .map(|content| base_message(options, Some(content)))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};
    use proxima_core::{normalize, RawPlanet, Snapshot, SnapshotStatistics};

    pub fn snapshot_of(count: usize) -> (Snapshot, SnapshotStatistics) {
        let observations = (0..count)
            .map(|i| {
                normalize(&RawPlanet {
                    name: format!("Proxima {}-{}", 10 + i / 10, i % 10 + 1),
                    coordinates: format!("{}:{}:{}", 100 + i, 200 + i, i % 9),
                    score: 2000u64.saturating_sub(i as u64 * 10),
                    delete_on: "2025-09-17T16:06:58.000000Z".to_string(),
                })
            })
            .collect::<Vec<_>>();
        let latest_period = observations.iter().map(|o| o.period_number).max();
        let stats = SnapshotStatistics {
            total_entities: count as u64,
            latest_period,
            last_capture_time: Utc.with_ymd_and_hms(2025, 9, 10, 18, 45, 0).single(),
        };
        (Snapshot::new(observations), stats)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::snapshot_of;
    use super::*;

    fn ranked_rows(content: &str) -> usize {
        content
            .lines()
            .filter(|l| l.contains(" | ") && l.trim_start().starts_with(|c: char| c.is_ascii_digit()))
            .count()
    }

    fn contents(rendering: &Rendering) -> Vec<String> {
        rendering
            .pages
            .iter()
            .map(|p| p.content().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn style_names_round_trip_through_config_strings() {
        assert_eq!(
            parse_styles("minimal, csv ,embed").expect("styles"),
            vec![
                RenderStyle::Minimal,
                RenderStyle::Export(ExportFormat::Csv),
                RenderStyle::Embed
            ]
        );
        assert_eq!("spreadsheet".parse::<RenderStyle>(), Ok(RenderStyle::Export(ExportFormat::Csv)));
        assert_eq!(RenderStyle::Paginated.to_string(), "paginated");
        assert_eq!(
            parse_styles("minimal,fax"),
            Err(UnknownStyle("fax".to_string()))
        );
    }

    #[test]
    fn thousands_are_grouped() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }

    #[test]
    fn paginated_splits_37_entities_into_15_15_7() {
        let (snapshot, stats) = snapshot_of(37);
        let rendering = render(RenderStyle::Paginated, &snapshot, &stats, &RenderOptions::default())
            .expect("render");
        assert_eq!(rendering.pages.len(), 3);

        let pages = contents(&rendering);
        let row_counts = pages
            .iter()
            .map(|c| ranked_rows(c))
            .collect::<Vec<_>>();
        assert_eq!(row_counts, vec![15, 15, 7]);

        assert!(!pages[0].contains("Last updated"));
        assert!(!pages[1].contains("Last updated"));
        assert!(pages[2].contains("Last updated"));
        assert!(pages[0].contains("page 1/3"));
        assert!(pages[2].contains("  37 | "));
        assert!(pages.iter().all(|c| c.chars().count() <= CONTENT_LIMIT));
    }

    #[test]
    fn paginated_empty_snapshot_yields_single_footer_page() {
        let (snapshot, stats) = snapshot_of(0);
        let rendering = render(RenderStyle::Paginated, &snapshot, &stats, &RenderOptions::default())
            .expect("render");
        assert_eq!(rendering.pages.len(), 1);
        assert!(contents(&rendering)[0].contains("Last updated"));
    }

    #[test]
    fn table_shows_top_rows_within_content_limit() {
        let (snapshot, stats) = snapshot_of(40);
        let rendering =
            render(RenderStyle::Table, &snapshot, &stats, &RenderOptions::default()).expect("render");
        let content = &contents(&rendering)[0];
        assert_eq!(ranked_rows(content), 15);
        assert!(content.contains("2,000"));
        assert!(content.contains("Total planets: **40**"));
        assert!(content.chars().count() <= CONTENT_LIMIT);
    }

    #[test]
    fn table_drops_rows_to_respect_a_small_limit() {
        let (snapshot, stats) = snapshot_of(15);
        let options = RenderOptions {
            content_limit: 700,
            ..Default::default()
        };
        let rendering = render(RenderStyle::Table, &snapshot, &stats, &options).expect("render");
        let content = &contents(&rendering)[0];
        assert!(content.chars().count() <= 700);
        let rows = ranked_rows(content);
        assert!(rows > 0 && rows < 15);
        assert!(content.ends_with(&last_updated_footer(&stats)));
    }

    #[test]
    fn website_table_colors_scores_by_tier() {
        let (snapshot, stats) = snapshot_of(3);
        let rendering =
            render(RenderStyle::Website, &snapshot, &stats, &RenderOptions::default()).expect("render");
        let content = &contents(&rendering)[0];
        assert!(content.starts_with(TITLE));
        assert!(content.contains("```ansi"));
        assert!(content.contains("\u{1b}[1;32m"));
        assert_eq!(ScoreTier::of(500), ScoreTier::High);
        assert_eq!(ScoreTier::of(499), ScoreTier::Medium);
        assert_eq!(ScoreTier::of(199), ScoreTier::Low);
    }

    #[test]
    fn embed_is_bounded_leaderboard() {
        let (snapshot, stats) = snapshot_of(30);
        let options = RenderOptions {
            top_n: 50,
            ..Default::default()
        };
        let rendering = render(RenderStyle::Embed, &snapshot, &stats, &options).expect("render");
        let message = rendering.pages[0].message();
        assert!(message.content.is_none());
        let embed = &message.embeds[0];
        assert_eq!(embed.fields.len(), EMBED_FIELD_LIMIT);
        assert!(embed.fields[0].name.starts_with("🥇"));
        assert!(embed.fields[3].name.starts_with("4."));
        assert_eq!(embed.color, EMBED_COLOR);
        assert_eq!(embed.timestamp.as_deref(), Some("2025-09-10T18:45:00+00:00"));

        let json = serde_json::to_value(message).expect("json");
        assert!(json.get("content").is_none());
        assert_eq!(json["username"], "Proxima Bot");
    }

    #[test]
    fn embed_fields_are_capped_at_webhook_lengths() {
        let (mut snapshot, stats) = snapshot_of(2);
        snapshot.observations[0].name = "X".repeat(400);
        snapshot.observations[0].coordinates = "9".repeat(1500);
        let rendering =
            render(RenderStyle::Embed, &snapshot, &stats, &RenderOptions::default()).expect("render");
        let field = &rendering.pages[0].message().embeds[0].fields[0];
        assert_eq!(field.name.chars().count(), EMBED_FIELD_NAME_LIMIT);
        assert!(field.name.starts_with("🥇 XXX"));
        assert_eq!(field.value.chars().count(), EMBED_FIELD_VALUE_LIMIT);
    }

    #[test]
    fn paginated_large_page_size_spills_onto_extra_pages() {
        let (snapshot, stats) = snapshot_of(60);
        let options = RenderOptions {
            page_size: 60,
            ..Default::default()
        };
        let rendering = render(RenderStyle::Paginated, &snapshot, &stats, &options).expect("render");
        let pages = contents(&rendering);
        assert!(pages.len() > 1);

        let ranks = pages
            .iter()
            .flat_map(|c| {
                c.lines()
                    .filter(|l| l.contains(" | ") && l.trim_start().starts_with(|c: char| c.is_ascii_digit()))
                    .map(|l| l.split('|').next().unwrap_or_default().trim().parse::<usize>().expect("rank"))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        assert_eq!(ranks, (1..=60).collect::<Vec<_>>());

        let total = pages.len();
        for (idx, page) in pages.iter().enumerate() {
            assert!(page.chars().count() <= CONTENT_LIMIT, "page {} too long", idx + 1);
            assert!(page.contains(&format!("(page {}/{total})", idx + 1)));
            assert_eq!(page.contains("Last updated"), idx + 1 == total);
        }
    }

    #[test]
    fn website_table_keeps_closing_border_when_trimmed() {
        let (snapshot, stats) = snapshot_of(15);
        let options = RenderOptions {
            content_limit: 900,
            ..Default::default()
        };
        let rendering = render(RenderStyle::Website, &snapshot, &stats, &options).expect("render");
        let content = &contents(&rendering)[0];
        assert!(content.chars().count() <= 900);

        let lines = content.lines().collect::<Vec<_>>();
        let close = lines.iter().rposition(|l| *l == "```").expect("code block end");
        assert!(lines[close - 1].starts_with('└'));
        let data_rows = lines.iter().filter(|l| l.starts_with("│ ") && !l.contains("Name")).count();
        assert!(data_rows > 0 && data_rows < 15);
        assert!(content.ends_with(&last_updated_footer(&stats)));
    }

    #[test]
    fn minimal_lists_every_planet_and_splits_by_limit() {
        let (snapshot, stats) = snapshot_of(120);
        let rendering =
            render(RenderStyle::Minimal, &snapshot, &stats, &RenderOptions::default()).expect("render");
        let pages = contents(&rendering);
        assert!(pages.len() > 1);
        assert!(pages.iter().all(|c| c.chars().count() <= CONTENT_LIMIT));
        let listed = pages
            .iter()
            .flat_map(|c| c.lines())
            .filter(|l| l.starts_with("Proxima "))
            .count();
        assert_eq!(listed, 120);
        assert!(pages.last().unwrap().contains("Last updated"));
        assert!(!pages[0].contains("Last updated"));
        assert!(pages[0].contains("Proxima 10-1 : 2,000 : 100:200:0"));
    }

    #[test]
    fn export_style_attaches_file_with_summary() {
        let (snapshot, stats) = snapshot_of(4);
        let rendering = render(
            RenderStyle::Export(ExportFormat::Csv),
            &snapshot,
            &stats,
            &RenderOptions::default(),
        )
        .expect("render");
        match &rendering.pages[0] {
            Payload::File { message, attachment } => {
                assert!(message.content.as_deref().unwrap_or_default().contains("4 planets"));
                assert_eq!(attachment.file_name, "proxima_data_20250910_184500.csv");
                assert_eq!(attachment.content_type, "text/csv");
            }
            other => panic!("expected file payload, got {other:?}"),
        }
    }
}
