//! Environment-driven configuration, validated once at startup.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;
use proxima_adapters::DEFAULT_API_URL;
use proxima_core::{ScheduleError, ScheduleWindow};
use proxima_notify::{parse_styles, RenderStyle, UnknownStyle};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://proxima.db";
pub const DEFAULT_NOTIFY_STYLES: &str = "minimal,csv";
/// Rows per paginated message; more than this cannot share one 2000-character message.
pub const MAX_PAGE_SIZE: u64 = 25;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("{var}: {source}")]
    Style {
        var: String,
        #[source]
        source: UnknownStyle,
    },
    #[error("reading sinks file {path}: {source}")]
    SinksFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing sinks file {path}: {source}")]
    SinksYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// One webhook endpoint and the renderings it receives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SinkConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub styles: Vec<RenderStyle>,
    #[serde(default)]
    pub success_status: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct SinksFile {
    #[serde(default)]
    sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone)]
pub struct ProximaConfig {
    pub api_url: String,
    pub database_url: String,
    pub output_dir: PathBuf,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub schedule: ScheduleWindow,
    pub sinks: Vec<SinkConfig>,
    pub page_size: usize,
    pub page_delay: Duration,
    pub environment: String,
    pub web_port: u16,
}

impl Default for ProximaConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            output_dir: PathBuf::from("."),
            poll_interval: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(30),
            http_timeout: Duration::from_secs(15),
            user_agent: default_user_agent(),
            schedule: ScheduleWindow::default(),
            sinks: Vec::new(),
            page_size: 15,
            page_delay: Duration::from_millis(1000),
            environment: "development".to_string(),
            web_port: 8000,
        }
    }
}

fn default_user_agent() -> String {
    format!("proxima-tracker/{}", env!("CARGO_PKG_VERSION"))
}

impl ProximaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup; empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let poll_interval = Duration::from_secs(parse_positive(
            "PROXIMA_POLL_INTERVAL_SECS",
            get("PROXIMA_POLL_INTERVAL_SECS"),
            defaults.poll_interval.as_secs(),
        )?);
        let retry_backoff = Duration::from_secs(parse_positive(
            "PROXIMA_RETRY_BACKOFF_SECS",
            get("PROXIMA_RETRY_BACKOFF_SECS"),
            defaults.retry_backoff.as_secs(),
        )?);
        let http_timeout = Duration::from_secs(parse_positive(
            "PROXIMA_HTTP_TIMEOUT_SECS",
            get("PROXIMA_HTTP_TIMEOUT_SECS"),
            defaults.http_timeout.as_secs(),
        )?);
        let page_size = parse_positive("PROXIMA_PAGE_SIZE", get("PROXIMA_PAGE_SIZE"), 15)?;
        if page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid {
                var: "PROXIMA_PAGE_SIZE",
                value: page_size.to_string(),
                reason: format!("at most {MAX_PAGE_SIZE} rows fit one message"),
            });
        }
        let page_size = page_size as usize;
        let page_delay = Duration::from_millis(parse_number(
            "PROXIMA_PAGE_DELAY_MS",
            get("PROXIMA_PAGE_DELAY_MS"),
            1000,
        )?);
        let web_port = parse_number("PROXIMA_WEB_PORT", get("PROXIMA_WEB_PORT"), defaults.web_port)?;

        let weekday = match get("PROXIMA_SCHEDULE_WEEKDAY") {
            Some(value) => parse_weekday(&value)?,
            None => defaults.schedule.weekday(),
        };
        let start_hour = parse_number(
            "PROXIMA_SCHEDULE_START_HOUR",
            get("PROXIMA_SCHEDULE_START_HOUR"),
            defaults.schedule.start_hour(),
        )?;
        let end_hour = parse_number(
            "PROXIMA_SCHEDULE_END_HOUR",
            get("PROXIMA_SCHEDULE_END_HOUR"),
            defaults.schedule.end_hour(),
        )?;
        let schedule = ScheduleWindow::new(weekday, start_hour, end_hour)?;

        let default_styles = parse_styles(
            get("PROXIMA_NOTIFY_STYLES")
                .as_deref()
                .unwrap_or(DEFAULT_NOTIFY_STYLES),
        )
        .map_err(|source| ConfigError::Style {
            var: "PROXIMA_NOTIFY_STYLES".to_string(),
            source,
        })?;

        let mut sinks = Vec::new();
        if let Some(path) = get("PROXIMA_SINKS_FILE") {
            sinks.extend(load_sinks_file(Path::new(&path))?);
        }
        let env_urls = get("PROXIMA_WEBHOOK_URLS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for (idx, url) in env_urls.into_iter().enumerate() {
            sinks.push(SinkConfig {
                name: format!("webhook-{}", idx + 1),
                url,
                styles: Vec::new(),
                success_status: None,
            });
        }
        if let Some(url) = get("DISCORD_WEBHOOK_URL") {
            sinks.push(SinkConfig {
                name: "discord".to_string(),
                url,
                styles: Vec::new(),
                success_status: None,
            });
        }
        let sinks = finalize_sinks(sinks, &default_styles)?;

        Ok(Self {
            api_url: get("PROXIMA_API_URL").unwrap_or(defaults.api_url),
            database_url: get("PROXIMA_DATABASE_URL").unwrap_or(defaults.database_url),
            output_dir: get("PROXIMA_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            poll_interval,
            retry_backoff,
            http_timeout,
            user_agent: get("PROXIMA_USER_AGENT").unwrap_or(defaults.user_agent),
            schedule,
            sinks,
            page_size,
            page_delay,
            environment: get("PROXIMA_ENVIRONMENT").unwrap_or(defaults.environment),
            web_port,
        })
    }

    pub fn notifications_enabled(&self) -> bool {
        !self.sinks.is_empty()
    }
}

/// Drops repeated URLs, fills empty style lists with the defaults and checks
/// that every URL is an http(s) endpoint.
fn finalize_sinks(
    sinks: Vec<SinkConfig>,
    default_styles: &[RenderStyle],
) -> Result<Vec<SinkConfig>, ConfigError> {
    let mut out: Vec<SinkConfig> = Vec::with_capacity(sinks.len());
    for mut sink in sinks {
        if !(sink.url.starts_with("https://") || sink.url.starts_with("http://")) {
            return Err(ConfigError::Invalid {
                var: "sink url",
                value: sink.url,
                reason: format!("sink {} must use http or https", sink.name),
            });
        }
        if out.iter().any(|s| s.url == sink.url) {
            continue;
        }
        if sink.styles.is_empty() {
            sink.styles = default_styles.to_vec();
        }
        out.push(sink);
    }
    Ok(out)
}

fn load_sinks_file(path: &Path) -> Result<Vec<SinkConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::SinksFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_sinks_yaml(&raw).map_err(|source| ConfigError::SinksYaml {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_sinks_yaml(raw: &str) -> Result<Vec<SinkConfig>, serde_yaml::Error> {
    let file: SinksFile = serde_yaml::from_str(raw)?;
    Ok(file.sinks)
}

/// Accepts weekday names (`wed`, `Wednesday`) or `0..=6` counted from Monday.
pub fn parse_weekday(value: &str) -> Result<Weekday, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        var: "PROXIMA_SCHEDULE_WEEKDAY",
        value: value.to_string(),
        reason: reason.to_string(),
    };
    if let Ok(index) = value.parse::<u8>() {
        return Weekday::try_from(index).map_err(|_| invalid("expected 0 (Monday) to 6 (Sunday)"));
    }
    Weekday::from_str(value).map_err(|_| invalid("expected a weekday name"))
}

fn parse_number<T: FromStr>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            var,
            value: raw,
            reason: "expected a non-negative integer".to_string(),
        }),
    }
}

fn parse_positive(var: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let parsed = parse_number(var, value, default)?;
    if parsed == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: parsed.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}
