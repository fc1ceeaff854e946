//! Planet source contracts: the live upstream API and a JSON fixture source.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use proxima_core::RawPlanet;
use proxima_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "proxima-adapters";

pub const DEFAULT_API_URL: &str = "https://beta2.game.spacenations.eu/api/proxima";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SourceError::Fetch(err) => err.status_code(),
            SourceError::Fixture { .. } => None,
        }
    }
}

/// Where a cycle gets its complete planet list from. Implementations return
/// the whole list or an error, never a partial list.
#[async_trait]
pub trait PlanetSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Human-readable location of the source, used in logs.
    fn location(&self) -> String;

    async fn fetch_planets(&self, ctx: &FetchContext) -> Result<Vec<RawPlanet>, SourceError>;
}

/// Structural decode of an upstream body: a JSON array of planet objects.
pub fn decode_planets(origin: &str, body: &[u8]) -> Result<Vec<RawPlanet>, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Parse {
        url: origin.to_string(),
        source,
    })
}

#[derive(Debug, Clone)]
pub struct ApiPlanetSource {
    url: String,
    http: HttpFetcher,
}

impl ApiPlanetSource {
    pub fn new(url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PlanetSource for ApiPlanetSource {
    fn source_id(&self) -> &str {
        "proxima-api"
    }

    fn location(&self) -> String {
        self.url.clone()
    }

    async fn fetch_planets(&self, ctx: &FetchContext) -> Result<Vec<RawPlanet>, SourceError> {
        let resp = self.http.fetch_bytes(ctx.run_id, &self.url).await?;
        let planets = decode_planets(&resp.final_url, &resp.body)?;
        info!(run_id = %ctx.run_id, url = %resp.final_url, planets = planets.len(), "fetched planet list");
        Ok(planets)
    }
}

/// Reads the upstream JSON shape from a local file.
#[derive(Debug, Clone)]
pub struct FixturePlanetSource {
    path: PathBuf,
}

impl FixturePlanetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PlanetSource for FixturePlanetSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch_planets(&self, ctx: &FetchContext) -> Result<Vec<RawPlanet>, SourceError> {
        let body = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        let planets = decode_planets(&self.location(), &body)?;
        info!(run_id = %ctx.run_id, path = %self.path.display(), planets = planets.len(), "loaded planet fixture");
        Ok(planets)
    }
}
