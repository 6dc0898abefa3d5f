//! Valuation Service
//! Mission: Wire sources, fetchers, orchestrator and history into one handle
//!
//! Shared by the HTTP layer and integration tests. A streamed sweep runs in
//! its own task so it finishes (and lands in history) even when the client
//! disconnects halfway.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SweepError;
use crate::fetchers::{
    BrowserFetcher, BrowserLauncher, CaptchaSolver, ChromiumLauncher, PollPolicy, RentcastFetcher, SiteProfile,
    SourceFetcher, TwoCaptchaService,
};
use crate::history::HistoryStore;
use crate::models::{FetchEvent, SweepReport};
use crate::orchestrator::{validate_address, Budgets, NullSink, Orchestrator};
use crate::sources::SourceRegistry;

/// Slack on top of a fetcher's own worst case before the orchestrator cuts it off.
const BUDGET_SLACK: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ValuationService {
    orchestrator: Arc<Orchestrator>,
    history: Arc<HistoryStore>,
}

impl ValuationService {
    pub fn new(orchestrator: Orchestrator, history: HistoryStore) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            history: Arc::new(history),
        }
    }

    /// Production wiring: RentCast over HTTP, the scraped sites through
    /// Chromium, 2Captcha when a key is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Arc::new(SourceRegistry::from_config(config));

        let solver = config.captcha_api_key.clone().map(|key| {
            let service = Arc::new(TwoCaptchaService::new(key, config.captcha_api_base.clone()));
            CaptchaSolver::new(
                service,
                PollPolicy {
                    interval: config.captcha_poll_interval,
                    max_attempts: config.captcha_max_attempts,
                    ..PollPolicy::default()
                },
            )
        });
        if solver.is_none() {
            warn!("CAPTCHA_API_KEY not set, challenged pages will be reported as blocked");
        }

        let launcher: Arc<dyn BrowserLauncher> =
            Arc::new(ChromiumLauncher::new(config.chrome_bin.clone(), config.browser_headless));

        let mut fetchers: Vec<Arc<dyn SourceFetcher>> = vec![Arc::new(RentcastFetcher::new(
            config.rentcast_api_key.clone(),
            config.rentcast_api_base.clone(),
            config.api_timeout,
        ))];

        let mut browser_budget = Duration::ZERO;
        for profile in SiteProfile::all()? {
            let fetcher = BrowserFetcher::new(profile, launcher.clone(), solver.clone(), config.page_timeout);
            browser_budget = browser_budget.max(fetcher.budget());
            fetchers.push(Arc::new(fetcher));
        }

        let budgets = Budgets {
            api: config.api_timeout + BUDGET_SLACK,
            browser: browser_budget + BUDGET_SLACK,
        };

        let orchestrator = Orchestrator::new(registry.clone(), fetchers, budgets)?;
        let history = HistoryStore::open(&config.database_path)?;

        info!(
            "📡 Valuation service ready: {} sources, captcha solving {}",
            registry.len(),
            if config.captcha_api_key.is_some() { "on" } else { "off" }
        );

        Ok(Self::new(orchestrator, history))
    }

    pub fn registry(&self) -> &SourceRegistry {
        self.orchestrator.registry()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Validates, then starts a sweep in the background. Events arrive on the
    /// returned receiver, ending with the completion sentinel.
    pub fn start_stream(&self, raw_address: &str) -> Result<mpsc::UnboundedReceiver<FetchEvent>, SweepError> {
        let address = validate_address(raw_address)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let orchestrator = self.orchestrator.clone();
        let history = self.history.clone();
        tokio::spawn(async move {
            match orchestrator.sweep(&address, &tx).await {
                Ok(report) => record(&history, report),
                Err(e) => warn!(address = %address, "Streamed sweep aborted: {}", e),
            }
        });

        Ok(rx)
    }

    /// Synchronous whole sweep for clients whose stream broke.
    pub async fn full_sweep(&self, raw_address: &str) -> Result<SweepReport, SweepError> {
        let report = self.orchestrator.sweep(raw_address, &NullSink).await?;
        record(&self.history, report.clone());
        Ok(report)
    }
}

fn record(history: &HistoryStore, report: SweepReport) {
    if let Err(e) = history.add_entry(&report.address, report.results, report.property_data) {
        warn!(address = %report.address, "Failed to record history: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchers::{FetchOutcome, SourceValuation};
    use crate::sources::{FetcherKind, Source};
    use async_trait::async_trait;

    struct Fixed(&'static str, FetchOutcome);

    #[async_trait]
    impl SourceFetcher for Fixed {
        fn source_id(&self) -> &str {
            self.0
        }

        async fn fetch(&self, _address: &str) -> FetchOutcome {
            self.1.clone()
        }
    }

    fn service(outcome: FetchOutcome) -> ValuationService {
        let registry = Arc::new(
            SourceRegistry::new(vec![Source::new("rentcast", "RentCast", FetcherKind::Api, &[])]).unwrap(),
        );
        let orchestrator =
            Orchestrator::new(registry, vec![Arc::new(Fixed("rentcast", outcome))], Budgets::default()).unwrap();
        ValuationService::new(orchestrator, HistoryStore::open_in_memory().unwrap())
    }

    fn found(value: f64) -> FetchOutcome {
        FetchOutcome::Found(SourceValuation {
            estimate: Some(value),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_stream_records_history_after_sentinel() {
        let service = service(found(275_000.0));
        let mut rx = service.start_stream("9 Elm St").unwrap();
        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        assert!(last.unwrap().is_complete());

        // history write follows the final send in the same task
        for _ in 0..50 {
            if !service.history().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let entries = service.history().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].median_estimate, 275_000.0);
    }

    #[tokio::test]
    async fn test_invalid_address_rejected_before_stream() {
        let service = service(found(1.0));
        assert!(matches!(service.start_stream("   "), Err(SweepError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_full_sweep_without_estimates_leaves_history_alone() {
        let service = service(FetchOutcome::NotFound);
        let report = service.full_sweep("9 Elm St").await.unwrap();
        assert!(report.results.is_empty());
        assert!(service.history().is_empty());
    }
}
