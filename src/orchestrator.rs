//! Fetch Orchestrator
//! Mission: Run every source for one address and narrate it live
//!
//! Sweep order:
//! 1. `checking` for every registered source, immediately.
//! 2. API sources, concurrently; each terminal event goes out as it lands.
//! 3. Browser sources, strictly one after another.
//! 4. The completion sentinel.
//!
//! Each source moves `checking -> found | not_found | error` exactly once.

use anyhow::{bail, Result};
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::SweepError;
use crate::fetchers::{FetchFailure, FetchOutcome, SourceFetcher};
use crate::models::{FetchEvent, PropertyData, SourceStatus, SweepReport, ValuationEstimate};
use crate::sources::{FetcherKind, SourceRegistry};

/// Receives progress events. Emission never blocks and never fails the
/// sweep; a gone receiver just drops events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FetchEvent);
}

impl EventSink for mpsc::UnboundedSender<FetchEvent> {
    fn emit(&self, event: FetchEvent) {
        let _ = self.send(event);
    }
}

/// Discards everything (synchronous full sweeps).
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: FetchEvent) {}
}

/// Rejects blank or punctuation-only input before any fetch starts.
pub fn validate_address(raw: &str) -> Result<String, SweepError> {
    let address = raw.trim();
    if address.is_empty() {
        return Err(SweepError::InvalidAddress("address is empty".into()));
    }
    if !address.chars().any(|c| c.is_alphanumeric()) {
        return Err(SweepError::InvalidAddress(format!("'{}' is not an address", address)));
    }
    Ok(address.to_string())
}

/// Per-sweep status board enforcing the one-terminal-event rule
struct SweepTracker {
    states: HashMap<String, SourceStatus>,
}

impl SweepTracker {
    fn new<'a>(ids: impl Iterator<Item = &'a str>) -> Self {
        Self {
            states: ids.map(|id| (id.to_string(), SourceStatus::Checking)).collect(),
        }
    }

    /// Returns the event if `source` was still checking, `None` otherwise.
    fn resolve(&mut self, event: FetchEvent) -> Option<FetchEvent> {
        match self.states.get_mut(&event.source) {
            Some(state) if !state.is_terminal() && event.status.is_terminal() => {
                *state = event.status;
                Some(event)
            }
            _ => None,
        }
    }

    fn unresolved(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Budgets {
    pub api: Duration,
    pub browser: Duration,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            api: Duration::from_secs(20),
            browser: Duration::from_secs(240),
        }
    }
}

pub struct Orchestrator {
    registry: Arc<SourceRegistry>,
    fetchers: HashMap<String, Arc<dyn SourceFetcher>>,
    budgets: Budgets,
}

impl Orchestrator {
    /// Every registered source needs a fetcher; fetchers for unregistered
    /// (e.g. disabled) sources are ignored.
    pub fn new(
        registry: Arc<SourceRegistry>,
        fetchers: Vec<Arc<dyn SourceFetcher>>,
        budgets: Budgets,
    ) -> Result<Self> {
        let mut by_id: HashMap<String, Arc<dyn SourceFetcher>> = HashMap::new();
        for fetcher in fetchers {
            let id = fetcher.source_id().to_string();
            if registry.get(&id).is_none() {
                debug!(source = %id, "Fetcher has no registered source, skipping");
                continue;
            }
            by_id.insert(id, fetcher);
        }

        for source in registry.iter() {
            if !by_id.contains_key(&source.id) {
                bail!("No fetcher for registered source '{}'", source.id);
            }
        }

        Ok(Self {
            registry,
            fetchers: by_id,
            budgets,
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Runs one full sweep. Only an invalid address fails; every per-source
    /// problem ends up as that source's `error` event.
    pub async fn sweep(&self, raw_address: &str, sink: &dyn EventSink) -> Result<SweepReport, SweepError> {
        let address = validate_address(raw_address)?;
        let started = Instant::now();
        info!(address = %address, sources = self.registry.len(), "🚀 Sweep started");

        let mut tracker = SweepTracker::new(self.registry.iter().map(|s| s.id.as_str()));
        let mut collected = Collected::default();

        for source in self.registry.iter() {
            sink.emit(FetchEvent::checking(&source.id));
        }

        let mut api_calls: FuturesUnordered<_> = self
            .fetchers_of(FetcherKind::Api)
            .map(|fetcher| {
                let address = address.clone();
                async move {
                    let outcome = run_bounded(fetcher.as_ref(), &address, self.budgets.api).await;
                    (fetcher.source_id().to_string(), outcome)
                }
            })
            .collect();

        while let Some((id, outcome)) = api_calls.next().await {
            self.settle(&id, outcome, &mut tracker, &mut collected, sink);
        }

        for fetcher in self.fetchers_of(FetcherKind::Browser) {
            let outcome = run_bounded(fetcher.as_ref(), &address, self.budgets.browser).await;
            self.settle(fetcher.source_id(), outcome, &mut tracker, &mut collected, sink);
        }

        for id in tracker.unresolved() {
            warn!(source = %id, "Source never resolved");
            if let Some(event) = tracker.resolve(FetchEvent::error(&id, "no result")) {
                sink.emit(event);
            }
        }

        sink.emit(FetchEvent::complete());
        info!(
            address = %address,
            found = collected.estimates.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "🏁 Sweep complete"
        );

        Ok(SweepReport {
            address,
            results: collected.estimates,
            property_data: collected.property_data,
            fetched_at: Utc::now(),
        })
    }

    /// Registry order, filtered by execution class.
    fn fetchers_of(&self, kind: FetcherKind) -> impl Iterator<Item = Arc<dyn SourceFetcher>> + '_ {
        self.registry
            .iter()
            .filter(move |s| s.kind == kind)
            .filter_map(|s| self.fetchers.get(&s.id).cloned())
    }

    fn settle(
        &self,
        id: &str,
        outcome: FetchOutcome,
        tracker: &mut SweepTracker,
        collected: &mut Collected,
        sink: &dyn EventSink,
    ) {
        let display_name = self
            .registry
            .get(id)
            .map(|s| s.display_name.clone())
            .unwrap_or_else(|| id.to_string());

        let event = match outcome {
            FetchOutcome::Found(valuation) => {
                let mut event = FetchEvent {
                    status: SourceStatus::Found,
                    url: valuation.url.clone(),
                    property_data: valuation.property_data.clone().filter(|p| !p.is_empty()),
                    ..FetchEvent::checking(id)
                };
                if let Some(value) = valuation.estimate {
                    let estimate =
                        ValuationEstimate::new(display_name, value, valuation.low, valuation.high, valuation.url);
                    event.estimate = Some(estimate.estimate);
                    event.low = Some(estimate.low);
                    event.high = Some(estimate.high);
                    collected.estimates.push(estimate);
                }
                if collected.property_data.is_none() {
                    collected.property_data = event.property_data.clone();
                }
                event
            }
            FetchOutcome::NotFound => FetchEvent::not_found(id),
            FetchOutcome::Failed(failure) => {
                warn!(source = %id, "Source failed: {}", failure);
                FetchEvent::error(id, failure.to_string())
            }
        };

        debug!(source = %id, status = event.status.as_str(), "Source resolved");
        if let Some(event) = tracker.resolve(event) {
            sink.emit(event);
        }
    }
}

#[derive(Default)]
struct Collected {
    estimates: Vec<ValuationEstimate>,
    /// First non-empty attributes seen in resolution order
    property_data: Option<PropertyData>,
}

async fn run_bounded(fetcher: &dyn SourceFetcher, address: &str, budget: Duration) -> FetchOutcome {
    match timeout(budget, fetcher.fetch(address)).await {
        Ok(outcome) => outcome,
        Err(_) => FetchOutcome::Failed(FetchFailure::Timeout(budget)),
    }
}
