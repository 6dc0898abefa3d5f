//! Browser-Automation Fetcher
//! Mission: Pull a number out of a hostile, JavaScript-rendered page
//!
//! One fresh session per fetch: load the landing page, clear a challenge if
//! one shows up, then run the site profile's extraction. The browser itself
//! sits behind [`BrowserLauncher`] so the flow can be exercised without
//! Chromium.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::captcha::{detect_challenge, CaptchaError, CaptchaSolver, Challenge};
use super::site_profiles::SiteProfile;
use super::{FetchFailure, FetchOutcome, SourceFetcher, SourceValuation};

/// What a loaded page looks like to extraction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageSnapshot {
    /// Final URL after redirects
    pub url: String,
    pub html: String,
    /// Rendered `innerText` of the body
    pub text: String,
}

#[async_trait]
pub trait BrowserSession: Send {
    async fn open(&mut self, url: &str) -> Result<PageSnapshot>;

    /// Injects a solved token into the challenge form and resubmits.
    async fn submit_captcha_token(&mut self, challenge: &Challenge, token: &str) -> Result<PageSnapshot>;

    async fn close(&mut self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>>;
}

pub struct BrowserFetcher {
    profile: SiteProfile,
    launcher: Arc<dyn BrowserLauncher>,
    solver: Option<CaptchaSolver>,
    page_timeout: Duration,
}

impl BrowserFetcher {
    pub fn new(
        profile: SiteProfile,
        launcher: Arc<dyn BrowserLauncher>,
        solver: Option<CaptchaSolver>,
        page_timeout: Duration,
    ) -> Self {
        Self {
            profile,
            launcher,
            solver,
            page_timeout,
        }
    }

    /// Bound on the page work of one fetch: two page loads plus a full solve.
    fn drive_budget(&self) -> Duration {
        let solve = self.solver.as_ref().map(|s| s.policy().budget()).unwrap_or_default();
        self.page_timeout * 2 + solve
    }

    /// Worst-case wall time of one fetch: launch, page work and close, each
    /// bounded on its own.
    pub fn budget(&self) -> Duration {
        self.page_timeout * 2 + self.drive_budget()
    }

    async fn run(&self, address: &str) -> FetchOutcome {
        let mut session = match timeout(self.page_timeout, self.launcher.new_session()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(source = self.profile.source_id, "Browser launch failed: {:#}", e);
                return FetchOutcome::Failed(FetchFailure::Navigation(format!("browser launch failed: {}", e)));
            }
            Err(_) => {
                warn!(source = self.profile.source_id, "Browser launch timed out");
                return FetchOutcome::Failed(FetchFailure::Timeout(self.page_timeout));
            }
        };

        let budget = self.drive_budget();
        let outcome = match timeout(budget, self.drive(session.as_mut(), address)).await {
            Ok(outcome) => outcome,
            Err(_) => FetchOutcome::Failed(FetchFailure::Timeout(budget)),
        };

        if timeout(self.page_timeout, session.close()).await.is_err() {
            warn!(source = self.profile.source_id, "Browser close timed out, dropping session");
        }
        outcome
    }

    async fn load(&self, step: impl std::future::Future<Output = Result<PageSnapshot>>) -> Result<PageSnapshot, FetchFailure> {
        match timeout(self.page_timeout, step).await {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(e)) => Err(FetchFailure::Navigation(e.to_string())),
            Err(_) => Err(FetchFailure::Timeout(self.page_timeout)),
        }
    }

    async fn drive(&self, session: &mut dyn BrowserSession, address: &str) -> FetchOutcome {
        let url = self.profile.search_url(address);
        debug!(source = self.profile.source_id, %url, "Loading page");

        let mut page = match self.load(session.open(&url)).await {
            Ok(page) => page,
            Err(failure) => return FetchOutcome::Failed(failure),
        };

        if let Some(challenge) = detect_challenge(&page.html) {
            page = match self.clear_challenge(session, challenge, &page).await {
                Ok(page) => page,
                Err(failure) => return FetchOutcome::Failed(failure),
            };
        }

        if let Some(valuation) = self.profile.extract(&page) {
            info!(source = self.profile.source_id, estimate = ?valuation.estimate, "🔎 Estimate extracted");
            return FetchOutcome::Found(valuation);
        }

        if self.profile.is_property_page(&page.url) {
            debug!(source = self.profile.source_id, url = %page.url, "Property page without a readable estimate");
            return FetchOutcome::Found(SourceValuation::url_only(page.url));
        }

        FetchOutcome::NotFound
    }

    async fn clear_challenge(
        &self,
        session: &mut dyn BrowserSession,
        challenge: Challenge,
        page: &PageSnapshot,
    ) -> Result<PageSnapshot, FetchFailure> {
        if let Challenge::Blocked(reason) = &challenge {
            return Err(FetchFailure::Blocked(reason.clone()));
        }
        let Some(solver) = &self.solver else {
            return Err(FetchFailure::Blocked("captcha challenge and no solver configured".into()));
        };

        warn!(source = self.profile.source_id, "🧩 Challenge detected, requesting solve");
        let token = solver.solve(&challenge, &page.url).await.map_err(|e| match e {
            CaptchaError::TimedOut { attempts } => FetchFailure::CaptchaTimeout(attempts),
            other => FetchFailure::Captcha(other.to_string()),
        })?;

        let resolved = self.load(session.submit_captcha_token(&challenge, &token)).await?;
        if detect_challenge(&resolved.html).is_some() {
            return Err(FetchFailure::Blocked("challenge persisted after solve".into()));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl SourceFetcher for BrowserFetcher {
    fn source_id(&self) -> &str {
        self.profile.source_id
    }

    async fn fetch(&self, address: &str) -> FetchOutcome {
        let started = Instant::now();
        let outcome = self.run(address).await;
        debug!(
            source = self.profile.source_id,
            latency_ms = started.elapsed().as_millis() as u64,
            success = outcome.is_success(),
            "Browser fetch finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchers::captcha::{CaptchaService, PollPolicy, PollStatus};
    use parking_lot::Mutex;

    const CHALLENGE_HTML: &str =
        r#"<form><div class="g-recaptcha" data-sitekey="6LfABCDEFGHIJKLMNOPQRSTUVWXYZ012"></div></form>"#;

    /// Serves canned pages: `pages[0]` for open, `pages[1]` after a token.
    struct ScriptedLauncher {
        pages: Vec<PageSnapshot>,
        open_delay: Duration,
        closed: Arc<Mutex<u32>>,
    }

    struct ScriptedSession {
        pages: Vec<PageSnapshot>,
        open_delay: Duration,
        closed: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl BrowserSession for ScriptedSession {
        async fn open(&mut self, _url: &str) -> Result<PageSnapshot> {
            tokio::time::sleep(self.open_delay).await;
            Ok(self.pages[0].clone())
        }

        async fn submit_captcha_token(&mut self, _: &Challenge, _: &str) -> Result<PageSnapshot> {
            Ok(self.pages.get(1).cloned().unwrap_or_default())
        }

        async fn close(&mut self) {
            *self.closed.lock() += 1;
        }
    }

    #[async_trait]
    impl BrowserLauncher for ScriptedLauncher {
        async fn new_session(&self) -> Result<Box<dyn BrowserSession>> {
            Ok(Box::new(ScriptedSession {
                pages: self.pages.clone(),
                open_delay: self.open_delay,
                closed: self.closed.clone(),
            }))
        }
    }

    struct InstantSolver;

    #[async_trait]
    impl CaptchaService for InstantSolver {
        async fn submit(&self, _: &Challenge, _: &str) -> Result<String, CaptchaError> {
            Ok("t".into())
        }
        async fn poll(&self, _: &str) -> Result<PollStatus, CaptchaError> {
            Ok(PollStatus::Ready("token".into()))
        }
    }

    struct NeverSolver;

    #[async_trait]
    impl CaptchaService for NeverSolver {
        async fn submit(&self, _: &Challenge, _: &str) -> Result<String, CaptchaError> {
            Ok("t".into())
        }
        async fn poll(&self, _: &str) -> Result<PollStatus, CaptchaError> {
            Ok(PollStatus::Pending)
        }
    }

    /// Each poll takes longer than the poll interval and never succeeds.
    struct SlowPolling;

    #[async_trait]
    impl CaptchaService for SlowPolling {
        async fn submit(&self, _: &Challenge, _: &str) -> Result<String, CaptchaError> {
            Ok("t".into())
        }
        async fn poll(&self, _: &str) -> Result<PollStatus, CaptchaError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(PollStatus::Pending)
        }
    }

    /// Launch never completes.
    struct StuckLauncher;

    #[async_trait]
    impl BrowserLauncher for StuckLauncher {
        async fn new_session(&self) -> Result<Box<dyn BrowserSession>> {
            std::future::pending().await
        }
    }

    fn snapshot(url: &str, html: &str, text: &str) -> PageSnapshot {
        PageSnapshot {
            url: url.into(),
            html: html.into(),
            text: text.into(),
        }
    }

    fn fetcher(pages: Vec<PageSnapshot>, solver: Option<Arc<dyn CaptchaService>>) -> (BrowserFetcher, Arc<Mutex<u32>>) {
        let closed = Arc::new(Mutex::new(0));
        let launcher = Arc::new(ScriptedLauncher {
            pages,
            open_delay: Duration::ZERO,
            closed: closed.clone(),
        });
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 3,
            ..PollPolicy::default()
        };
        let solver = solver.map(|s| CaptchaSolver::new(s, policy));
        let fetcher = BrowserFetcher::new(
            SiteProfile::zillow().unwrap(),
            launcher,
            solver,
            Duration::from_secs(5),
        );
        (fetcher, closed)
    }

    #[tokio::test]
    async fn test_extracts_estimate_and_closes_session() {
        let (fetcher, closed) = fetcher(
            vec![snapshot(
                "https://www.zillow.com/homedetails/1/2_zpid/",
                r#"{"zestimate":350000}"#,
                "",
            )],
            None,
        );
        let FetchOutcome::Found(v) = fetcher.fetch("123 Main St").await else {
            panic!("expected found");
        };
        assert_eq!(v.estimate, Some(350_000.0));
        assert_eq!(*closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_url_only_success_on_property_page() {
        let url = "https://www.zillow.com/homedetails/1-A-St/2_zpid/";
        let (fetcher, _) = fetcher(vec![snapshot(url, "<html></html>", "Off market")], None);
        assert_eq!(
            fetcher.fetch("1 A St").await,
            FetchOutcome::Found(SourceValuation::url_only(url))
        );
    }

    #[tokio::test]
    async fn test_search_page_without_value_is_not_found() {
        let (fetcher, _) = fetcher(
            vec![snapshot("https://www.zillow.com/homes/1-A-St_rb/", "<html></html>", "No results")],
            None,
        );
        assert_eq!(fetcher.fetch("1 A St").await, FetchOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_challenge_solved_then_extracted() {
        let (fetcher, _) = fetcher(
            vec![
                snapshot("https://www.zillow.com/captcha", CHALLENGE_HTML, ""),
                snapshot("https://www.zillow.com/homedetails/1/2_zpid/", "", "Zestimate®: $412,000"),
            ],
            Some(Arc::new(InstantSolver)),
        );
        let FetchOutcome::Found(v) = fetcher.fetch("1 A St").await else {
            panic!("expected found");
        };
        assert_eq!(v.estimate, Some(412_000.0));
    }

    #[tokio::test]
    async fn test_solver_timeout_is_distinct() {
        let (fetcher, closed) = fetcher(
            vec![snapshot("https://www.zillow.com/captcha", CHALLENGE_HTML, "")],
            Some(Arc::new(NeverSolver)),
        );
        assert_eq!(
            fetcher.fetch("1 A St").await,
            FetchOutcome::Failed(FetchFailure::CaptchaTimeout(3))
        );
        assert_eq!(*closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_challenge_without_solver_is_blocked() {
        let (fetcher, _) = fetcher(vec![snapshot("https://www.zillow.com/captcha", CHALLENGE_HTML, "")], None);
        assert!(matches!(
            fetcher.fetch("1 A St").await,
            FetchOutcome::Failed(FetchFailure::Blocked(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_page_times_out_and_still_closes() {
        let closed = Arc::new(Mutex::new(0));
        let launcher = Arc::new(ScriptedLauncher {
            pages: vec![PageSnapshot::default()],
            open_delay: Duration::from_millis(200),
            closed: closed.clone(),
        });
        let fetcher = BrowserFetcher::new(SiteProfile::zillow().unwrap(), launcher, None, Duration::from_millis(20));
        assert_eq!(
            fetcher.fetch("1 A St").await,
            FetchOutcome::Failed(FetchFailure::Timeout(Duration::from_millis(20)))
        );
        assert_eq!(*closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_slow_solver_polls_end_in_captcha_timeout() {
        let closed = Arc::new(Mutex::new(0));
        let launcher = Arc::new(ScriptedLauncher {
            pages: vec![snapshot("https://www.zillow.com/captcha", CHALLENGE_HTML, "")],
            open_delay: Duration::ZERO,
            closed: closed.clone(),
        });
        let policy = PollPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 5,
            ..PollPolicy::default()
        };
        let solver = CaptchaSolver::new(Arc::new(SlowPolling), policy);
        let fetcher = BrowserFetcher::new(
            SiteProfile::zillow().unwrap(),
            launcher,
            Some(solver),
            Duration::from_millis(50),
        );

        // five polls at 10ms + 20ms each overrun the bare interval budget
        assert_eq!(
            fetcher.fetch("1 A St").await,
            FetchOutcome::Failed(FetchFailure::CaptchaTimeout(5))
        );
        assert_eq!(*closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_stuck_launch_is_bounded() {
        let fetcher = BrowserFetcher::new(
            SiteProfile::zillow().unwrap(),
            Arc::new(StuckLauncher),
            None,
            Duration::from_millis(20),
        );
        assert_eq!(
            fetcher.fetch("1 A St").await,
            FetchOutcome::Failed(FetchFailure::Timeout(Duration::from_millis(20)))
        );
    }

    #[test]
    fn test_budget_covers_launch_and_close() {
        let (fetcher, _) = fetcher(vec![], Some(Arc::new(NeverSolver)));
        let solve = PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 3,
            ..PollPolicy::default()
        }
        .budget();
        assert_eq!(fetcher.budget(), Duration::from_secs(5) * 4 + solve);
    }
}
