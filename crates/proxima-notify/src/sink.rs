//! Webhook delivery of rendered snapshots.

use std::time::Duration;

use proxima_core::{Snapshot, SnapshotStatistics};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{render, Payload, RenderOptions, RenderStyle};

/// Status the webhook answers with when it accepted a message.
pub const DEFAULT_SUCCESS_STATUS: u16 = 204;
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("sending to sink {sink}: {source}")]
    Transport {
        sink: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("sink {sink} rejected message with status {status}: {body}")]
    Rejected { sink: String, status: u16, body: String },
    #[error("encoding payload for sink {sink}: {source}")]
    Encode {
        sink: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn build_client(timeout: Duration, user_agent: Option<&str>) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(ua) = user_agent {
        builder = builder.user_agent(ua.to_string());
    }
    builder.build()
}

#[derive(Debug, Clone)]
pub struct WebhookSink {
    name: String,
    url: String,
    client: Client,
    success_status: u16,
}

impl WebhookSink {
    pub fn new(name: impl Into<String>, url: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
            success_status: DEFAULT_SUCCESS_STATUS,
        }
    }

    pub fn with_success_status(mut self, status: u16) -> Self {
        self.success_status = status;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, payload: &Payload) -> Result<(), DeliveryError> {
        let request = match payload {
            Payload::Message(message) => self.client.post(&self.url).json(message),
            Payload::File {
                message,
                attachment,
            } => {
                let payload_json = serde_json::to_string(message).map_err(|source| DeliveryError::Encode {
                    sink: self.name.clone(),
                    source,
                })?;
                let part = Part::bytes(attachment.bytes.clone())
                    .file_name(attachment.file_name.clone())
                    .mime_str(attachment.content_type)
                    .map_err(|source| self.transport(source))?;
                let form = Form::new().text("payload_json", payload_json).part("file", part);
                self.client.post(&self.url).multipart(form)
            }
        };

        let response = request.send().await.map_err(|source| self.transport(source))?;
        let status = response.status();
        if status == StatusCode::from_u16(self.success_status).unwrap_or(StatusCode::NO_CONTENT) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            sink: self.name.clone(),
            status: status.as_u16(),
            body,
        })
    }

    fn transport(&self, source: reqwest::Error) -> DeliveryError {
        DeliveryError::Transport {
            sink: self.name.clone(),
            source,
        }
    }
}

/// A sink and the renderings it receives, in order.
#[derive(Debug, Clone)]
pub struct SinkTarget {
    pub sink: WebhookSink,
    pub styles: Vec<RenderStyle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub sink: String,
    pub style: RenderStyle,
    pub pages_sent: usize,
    pub pages_total: usize,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(&self) -> bool {
        self.error.is_none() && self.pages_sent == self.pages_total
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    pub outcomes: Vec<DeliveryOutcome>,
}

impl NotifyReport {
    pub fn all_delivered(&self) -> bool {
        self.outcomes.iter().all(DeliveryOutcome::delivered)
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.delivered()).count()
    }
}

/// Renders a snapshot per configured style and delivers it to each sink.
/// Failures are reported per sink and style; they never abort other targets.
#[derive(Debug, Clone)]
pub struct Notifier {
    targets: Vec<SinkTarget>,
    options: RenderOptions,
    page_delay: Duration,
}

impl Notifier {
    pub fn new(targets: Vec<SinkTarget>, options: RenderOptions) -> Self {
        Self {
            targets,
            options,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn targets(&self) -> &[SinkTarget] {
        &self.targets
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub async fn notify(&self, snapshot: &Snapshot, stats: &SnapshotStatistics) -> NotifyReport {
        self.notify_with(snapshot, stats, None).await
    }

    /// Like [`Notifier::notify`], restricted to `only` when given.
    pub async fn notify_with(
        &self,
        snapshot: &Snapshot,
        stats: &SnapshotStatistics,
        only: Option<RenderStyle>,
    ) -> NotifyReport {
        let mut report = NotifyReport::default();
        for target in &self.targets {
            let styles = match only {
                Some(style) => vec![style],
                None => target.styles.clone(),
            };
            for style in styles {
                let outcome = self.deliver(target, style, snapshot, stats).await;
                match &outcome.error {
                    None => info!(
                        sink = %outcome.sink,
                        %style,
                        pages = outcome.pages_sent,
                        "snapshot delivered"
                    ),
                    Some(err) => warn!(
                        sink = %outcome.sink,
                        %style,
                        pages_sent = outcome.pages_sent,
                        pages_total = outcome.pages_total,
                        error = %err,
                        "snapshot delivery failed"
                    ),
                }
                report.outcomes.push(outcome);
            }
        }
        report
    }

    async fn deliver(
        &self,
        target: &SinkTarget,
        style: RenderStyle,
        snapshot: &Snapshot,
        stats: &SnapshotStatistics,
    ) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome {
            sink: target.sink.name().to_string(),
            style,
            pages_sent: 0,
            pages_total: 0,
            error: None,
        };
        let rendering = match render(style, snapshot, stats, &self.options) {
            Ok(rendering) => rendering,
            Err(err) => {
                outcome.error = Some(err.to_string());
                return outcome;
            }
        };
        outcome.pages_total = rendering.pages.len();

        for (idx, page) in rendering.pages.iter().enumerate() {
            if idx > 0 && !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }
            if let Err(err) = target.sink.send(page).await {
                outcome.error = Some(err.to_string());
                break;
            }
            outcome.pages_sent += 1;
        }
        outcome
    }
}
