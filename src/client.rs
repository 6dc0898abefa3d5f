//! Sweep Client
//! Mission: Consume the progress stream, fall back only when it pays off
//!
//! The stream is the primary path. If it breaks before any source reported
//! `found`, one synchronous full sweep is requested instead. If something was
//! already found, the partial result stands and no second sweep is started.
//! A stream that goes quiet for longer than the transport's idle timeout
//! counts as broken.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::SweepError;
use crate::models::{FetchEvent, PropertyData, SourceStatus, SweepReport, ValuationEstimate};

pub type EventStream = BoxStream<'static, Result<FetchEvent, SweepError>>;

/// Longest silence tolerated between two stream events. Sources resolve one
/// at a time, so this has to outlast the server's slowest browser fetch.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Caller-side view of the two sweep endpoints
#[async_trait]
pub trait SweepTransport: Send + Sync {
    async fn open_stream(&self, address: &str) -> Result<EventStream, SweepError>;

    async fn full_sweep(&self, address: &str) -> Result<SweepReport, SweepError>;

    fn idle_timeout(&self) -> Duration {
        DEFAULT_IDLE_TIMEOUT
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// Stream ran to the sentinel.
    Completed {
        results: Vec<ValuationEstimate>,
        property_data: Option<PropertyData>,
    },
    /// Stream broke after something was found; what arrived is kept.
    Partial {
        results: Vec<ValuationEstimate>,
        property_data: Option<PropertyData>,
        error: SweepError,
    },
    /// Stream broke early; the full-sweep endpoint answered instead.
    Fallback(SweepReport),
}

impl SweepOutcome {
    pub fn estimates(&self) -> &[ValuationEstimate] {
        match self {
            SweepOutcome::Completed { results, .. } | SweepOutcome::Partial { results, .. } => results,
            SweepOutcome::Fallback(report) => &report.results,
        }
    }

    pub fn property_data(&self) -> Option<&PropertyData> {
        match self {
            SweepOutcome::Completed { property_data, .. } | SweepOutcome::Partial { property_data, .. } => {
                property_data.as_ref()
            }
            SweepOutcome::Fallback(report) => report.property_data.as_ref(),
        }
    }
}

#[derive(Default)]
struct Progress {
    found_any: bool,
    results: Vec<ValuationEstimate>,
    property_data: Option<PropertyData>,
}

impl Progress {
    fn observe(&mut self, event: &FetchEvent) {
        if event.status != SourceStatus::Found {
            return;
        }
        self.found_any = true;
        if let Some(estimate) = event.estimate {
            self.results.push(ValuationEstimate::new(
                event.source.clone(),
                estimate,
                event.low,
                event.high,
                event.url.clone(),
            ));
        }
        if self.property_data.is_none() {
            self.property_data = event.property_data.clone();
        }
    }
}

/// Runs one sweep over `transport`, handing every non-sentinel event to
/// `on_event` as it arrives. The full-sweep endpoint is called at most once.
pub async fn sweep_with_fallback<F>(
    transport: &dyn SweepTransport,
    address: &str,
    mut on_event: F,
) -> Result<SweepOutcome, SweepError>
where
    F: FnMut(&FetchEvent) + Send,
{
    let mut progress = Progress::default();
    let idle = transport.idle_timeout();

    let failure = match transport.open_stream(address).await {
        Err(e @ SweepError::InvalidAddress(_)) => return Err(e),
        Err(e) => e,
        Ok(mut events) => loop {
            let Ok(next) = timeout(idle, events.next()).await else {
                break SweepError::Transport(format!("stream stalled for {:?}", idle));
            };
            match next {
                Some(Ok(event)) if event.is_complete() => {
                    return Ok(SweepOutcome::Completed {
                        results: progress.results,
                        property_data: progress.property_data,
                    });
                }
                Some(Ok(event)) => {
                    progress.observe(&event);
                    on_event(&event);
                }
                Some(Err(e)) => break e,
                None => break SweepError::Transport("stream ended before completion".into()),
            }
        },
    };

    if progress.found_any {
        warn!(address, "Stream broke after partial results, keeping them: {}", failure);
        return Ok(SweepOutcome::Partial {
            results: progress.results,
            property_data: progress.property_data,
            error: failure,
        });
    }

    warn!(address, "Stream failed before any result, falling back to full sweep: {}", failure);
    match transport.full_sweep(address).await {
        Ok(report) => {
            info!(address, results = report.results.len(), "Fallback sweep succeeded");
            Ok(SweepOutcome::Fallback(report))
        }
        Err(e @ SweepError::InvalidAddress(_)) => Err(e),
        Err(e) => Err(SweepError::FallbackFailed(e.to_string())),
    }
}

/// Splits a chunked byte stream into NDJSON events. Blank lines are skipped;
/// a final line without a trailing newline still counts.
pub fn ndjson_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    struct LineState<S> {
        inner: std::pin::Pin<Box<S>>,
        buf: Vec<u8>,
        finished: bool,
    }

    let state = LineState {
        inner: Box::pin(bytes),
        buf: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                if is_blank(&line) {
                    continue;
                }
                return Some((parse_line(&line), st));
            }

            if st.finished {
                if is_blank(&st.buf) {
                    return None;
                }
                let line = std::mem::take(&mut st.buf);
                return Some((parse_line(&line), st));
            }

            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    st.finished = true;
                    st.buf.clear();
                    return Some((Err(SweepError::Transport(e.to_string())), st));
                }
                None => st.finished = true,
            }
        }
    })
    .boxed()
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn parse_line(line: &[u8]) -> Result<FetchEvent, SweepError> {
    serde_json::from_slice(line).map_err(|e| SweepError::Transport(format!("malformed event: {}", e)))
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Talks to a running `valuebot` server.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    sweep_timeout: Duration,
    idle_timeout: Duration,
}

impl HttpTransport {
    /// `sweep_timeout` bounds the fallback request only; the stream stays
    /// open while events keep arriving within the idle timeout.
    pub fn new(base_url: impl Into<String>, sweep_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sweep_timeout,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

async fn rejection(response: reqwest::Response) -> SweepError {
    let status = response.status();
    let message = response
        .json::<ErrorBody>()
        .await
        .map(|b| b.error)
        .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));

    if status == StatusCode::BAD_REQUEST {
        SweepError::InvalidAddress(message)
    } else {
        SweepError::Transport(message)
    }
}

#[async_trait]
impl SweepTransport for HttpTransport {
    async fn open_stream(&self, address: &str) -> Result<EventStream, SweepError> {
        let response = self
            .client
            .get(format!("{}/api/valuations/stream", self.base_url))
            .query(&[("address", address)])
            .send()
            .await
            .map_err(|e| SweepError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        debug!(address, "Event stream opened");
        Ok(ndjson_events(response.bytes_stream()))
    }

    async fn full_sweep(&self, address: &str) -> Result<SweepReport, SweepError> {
        let response = self
            .client
            .post(format!("{}/api/valuations", self.base_url))
            .timeout(self.sweep_timeout)
            .json(&json!({ "address": address }))
            .send()
            .await
            .map_err(|e| SweepError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        response
            .json::<SweepReport>()
            .await
            .map_err(|e| SweepError::Transport(format!("unreadable sweep report: {}", e)))
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
