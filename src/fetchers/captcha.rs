//! CAPTCHA Challenge Handling
//! Mission: Get past a challenge page or give up on schedule
//!
//! Detection is a pure scan of page HTML. Solving is a submit followed by a
//! fixed-interval poll with a hard attempt cap, so a slow solver ends in a
//! distinct [`CaptchaError::TimedOut`] instead of an endless wait. Every
//! service call is bounded too; a poll that hangs counts as a pending one.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// What stands between the browser and the page content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Recaptcha { site_key: String },
    Hcaptcha { site_key: String },
    /// A wall no token can open (press-and-hold, hard deny)
    Blocked(String),
}

impl Challenge {
    pub fn is_solvable(&self) -> bool {
        !matches!(self, Challenge::Blocked(_))
    }
}

fn site_key_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"data-sitekey\s*=\s*["']([A-Za-z0-9_\-]{20,})["']"#).ok())
        .as_ref()
}

/// Looks for a challenge on a loaded page.
pub fn detect_challenge(html: &str) -> Option<Challenge> {
    let lower = html.to_lowercase();

    if let Some(caps) = site_key_pattern().and_then(|re| re.captures(html)) {
        let site_key = caps[1].to_string();
        return Some(if lower.contains("h-captcha") || lower.contains("hcaptcha.com") {
            Challenge::Hcaptcha { site_key }
        } else {
            Challenge::Recaptcha { site_key }
        });
    }

    if lower.contains("px-captcha") || lower.contains("press &amp; hold") || lower.contains("press & hold") {
        return Some(Challenge::Blocked("press-and-hold challenge".into()));
    }
    if lower.contains("access to this page has been denied") || lower.contains("request unsuccessful. incapsula") {
        return Some(Challenge::Blocked("access denied page".into()));
    }
    if lower.contains("cf-chl-") || lower.contains("checking your browser before accessing") {
        return Some(Challenge::Blocked("interstitial browser check".into()));
    }

    None
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CaptchaError {
    #[error("solution not ready after {attempts} polls")]
    TimedOut { attempts: u32 },
    #[error("solver rejected the task: {0}")]
    Rejected(String),
    #[error("solver unreachable: {0}")]
    Transport(String),
    #[error("challenge cannot be solved with a token")]
    Unsolvable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Ready(String),
}

/// One solving service round trip, split so the poll loop can be driven by a
/// stub in tests.
#[async_trait]
pub trait CaptchaService: Send + Sync {
    /// Returns the service's task id.
    async fn submit(&self, challenge: &Challenge, page_url: &str) -> Result<String, CaptchaError>;

    async fn poll(&self, task_id: &str) -> Result<PollStatus, CaptchaError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Bound on a single submit or poll round trip
    pub call_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 24,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl PollPolicy {
    /// Upper bound on a whole solve: every wait plus every service call
    /// (one submit, `max_attempts` polls) running to its timeout.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts + self.call_timeout * (self.max_attempts + 1)
    }
}

#[derive(Clone)]
pub struct CaptchaSolver {
    service: Arc<dyn CaptchaService>,
    policy: PollPolicy,
}

impl CaptchaSolver {
    pub fn new(service: Arc<dyn CaptchaService>, policy: PollPolicy) -> Self {
        Self { service, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub async fn solve(&self, challenge: &Challenge, page_url: &str) -> Result<String, CaptchaError> {
        if !challenge.is_solvable() {
            return Err(CaptchaError::Unsolvable);
        }

        let call_timeout = self.policy.call_timeout;
        let task_id = timeout(call_timeout, self.service.submit(challenge, page_url))
            .await
            .map_err(|_| CaptchaError::Transport(format!("submit timed out after {:?}", call_timeout)))??;
        debug!(task_id = %task_id, "Captcha task submitted");

        for attempt in 1..=self.policy.max_attempts {
            sleep(self.policy.interval).await;
            match timeout(call_timeout, self.service.poll(&task_id)).await {
                Ok(Ok(PollStatus::Ready(token))) => {
                    info!(attempt, "🔓 Captcha solved");
                    return Ok(token);
                }
                Ok(Ok(PollStatus::Pending)) => debug!(attempt, "Captcha not ready"),
                Ok(Err(e)) => return Err(e),
                Err(_) => warn!(attempt, "Captcha poll timed out"),
            }
        }

        warn!(attempts = self.policy.max_attempts, "Captcha solve timed out");
        Err(CaptchaError::TimedOut {
            attempts: self.policy.max_attempts,
        })
    }
}

/// 2Captcha-compatible HTTP API (`in.php` submit, `res.php` poll)
pub struct TwoCaptchaService {
    client: Client,
    api_key: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ServiceReply {
    status: i32,
    request: String,
}

impl TwoCaptchaService {
    pub fn new(api_key: String, api_base: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<ServiceReply, CaptchaError> {
        let response = request
            .send()
            .await
            .map_err(|e| CaptchaError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CaptchaError::Transport(format!("HTTP {}", response.status().as_u16())));
        }
        response
            .json::<ServiceReply>()
            .await
            .map_err(|e| CaptchaError::Transport(format!("unreadable reply: {}", e)))
    }
}

#[async_trait]
impl CaptchaService for TwoCaptchaService {
    async fn submit(&self, challenge: &Challenge, page_url: &str) -> Result<String, CaptchaError> {
        let (method, key_field, site_key) = match challenge {
            Challenge::Recaptcha { site_key } => ("userrecaptcha", "googlekey", site_key),
            Challenge::Hcaptcha { site_key } => ("hcaptcha", "sitekey", site_key),
            Challenge::Blocked(_) => return Err(CaptchaError::Unsolvable),
        };

        let form = [
            ("key", self.api_key.as_str()),
            ("method", method),
            (key_field, site_key.as_str()),
            ("pageurl", page_url),
            ("json", "1"),
        ];
        let reply = self
            .call(self.client.post(format!("{}/in.php", self.api_base)).form(&form))
            .await?;

        if reply.status == 1 {
            Ok(reply.request)
        } else {
            Err(CaptchaError::Rejected(reply.request))
        }
    }

    async fn poll(&self, task_id: &str) -> Result<PollStatus, CaptchaError> {
        let query = [
            ("key", self.api_key.as_str()),
            ("action", "get"),
            ("id", task_id),
            ("json", "1"),
        ];
        let reply = self
            .call(self.client.get(format!("{}/res.php", self.api_base)).query(&query))
            .await?;

        if reply.status == 1 {
            Ok(PollStatus::Ready(reply.request))
        } else if matches!(reply.request.as_str(), "CAPCHA_NOT_READY" | "CAPTCHA_NOT_READY") {
            Ok(PollStatus::Pending)
        } else {
            Err(CaptchaError::Rejected(reply.request))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Ready after `ready_after` polls; never ready when `None`.
    struct StubService {
        ready_after: Option<u32>,
        polls: AtomicU32,
    }

    #[async_trait]
    impl CaptchaService for StubService {
        async fn submit(&self, _: &Challenge, _: &str) -> Result<String, CaptchaError> {
            Ok("task-1".into())
        }

        async fn poll(&self, _: &str) -> Result<PollStatus, CaptchaError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.ready_after {
                Some(k) if n >= k => Ok(PollStatus::Ready("token-abc".into())),
                _ => Ok(PollStatus::Pending),
            }
        }
    }

    fn solver(ready_after: Option<u32>) -> (CaptchaSolver, Arc<StubService>) {
        let stub = Arc::new(StubService {
            ready_after,
            polls: AtomicU32::new(0),
        });
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 5,
            ..PollPolicy::default()
        };
        (CaptchaSolver::new(stub.clone(), policy), stub)
    }

    /// Every call outlives any sane per-call timeout.
    struct HangingService {
        hang_submit: bool,
        polls: AtomicU32,
    }

    #[async_trait]
    impl CaptchaService for HangingService {
        async fn submit(&self, _: &Challenge, _: &str) -> Result<String, CaptchaError> {
            if self.hang_submit {
                sleep(Duration::from_secs(5)).await;
            }
            Ok("task-1".into())
        }

        async fn poll(&self, _: &str) -> Result<PollStatus, CaptchaError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_secs(5)).await;
            Ok(PollStatus::Ready("too-late".into()))
        }
    }

    fn hanging(hang_submit: bool) -> (CaptchaSolver, Arc<HangingService>) {
        let stub = Arc::new(HangingService {
            hang_submit,
            polls: AtomicU32::new(0),
        });
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 3,
            call_timeout: Duration::from_millis(10),
        };
        (CaptchaSolver::new(stub.clone(), policy), stub)
    }

    fn recaptcha() -> Challenge {
        Challenge::Recaptcha {
            site_key: "6LcAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into(),
        }
    }

    #[tokio::test]
    async fn test_solves_within_budget() {
        let (solver, stub) = solver(Some(3));
        let token = solver.solve(&recaptcha(), "https://example.com").await.unwrap();
        assert_eq!(token, "token-abc");
        assert_eq!(stub.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_loop_is_bounded() {
        let (solver, stub) = solver(None);
        let err = solver.solve(&recaptcha(), "https://example.com").await.unwrap_err();
        assert_eq!(err, CaptchaError::TimedOut { attempts: 5 });
        assert_eq!(stub.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_hung_polls_count_as_attempts() {
        let (solver, stub) = hanging(false);
        let started = std::time::Instant::now();
        let err = solver.solve(&recaptcha(), "https://example.com").await.unwrap_err();
        assert_eq!(err, CaptchaError::TimedOut { attempts: 3 });
        assert_eq!(stub.polls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < solver.policy().budget() + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_hung_submit_is_a_transport_error() {
        let (solver, stub) = hanging(true);
        let err = solver.solve(&recaptcha(), "https://example.com").await.unwrap_err();
        assert!(matches!(err, CaptchaError::Transport(_)));
        assert_eq!(stub.polls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_budget_covers_calls_and_waits() {
        let policy = PollPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 5,
            call_timeout: Duration::from_millis(50),
        };
        assert_eq!(policy.budget(), Duration::from_millis(10 * 5 + 50 * 6));
    }

    #[tokio::test]
    async fn test_blocked_pages_are_not_submitted() {
        let (solver, stub) = solver(Some(1));
        let err = solver
            .solve(&Challenge::Blocked("press-and-hold challenge".into()), "https://example.com")
            .await
            .unwrap_err();
        assert_eq!(err, CaptchaError::Unsolvable);
        assert_eq!(stub.polls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_detects_challenges() {
        let recaptcha_page =
            r#"<div class="g-recaptcha" data-sitekey="6LfABCDEFGHIJKLMNOPQRSTUVWXYZ012"></div>"#;
        assert_eq!(
            detect_challenge(recaptcha_page),
            Some(Challenge::Recaptcha {
                site_key: "6LfABCDEFGHIJKLMNOPQRSTUVWXYZ012".into()
            })
        );

        let hcaptcha_page = r#"<script src="https://hcaptcha.com/1/api.js"></script>
            <div class="h-captcha" data-sitekey='10000000-ffff-ffff-ffff-000000000001'></div>"#;
        assert!(matches!(detect_challenge(hcaptcha_page), Some(Challenge::Hcaptcha { .. })));

        let px_page = r#"<div id="px-captcha"></div><p>Press &amp; Hold to confirm you are a human</p>"#;
        assert!(matches!(detect_challenge(px_page), Some(Challenge::Blocked(_))));

        assert_eq!(detect_challenge("<html><body>Zestimate $350,000</body></html>"), None);
    }
}
