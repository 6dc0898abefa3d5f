//! Chromium Launcher
//! Mission: A fresh, stealthy headless browser per scrape
//!
//! Each session owns its own browser process; dropping or closing it tears
//! the process down. Stealth is applied before the first navigation: spoofed
//! desktop user agent and an init script masking the usual automation tells.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::browser::{BrowserLauncher, BrowserSession, PageSnapshot};
use super::captcha::Challenge;

pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const STEALTH_JS: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'platform', { get: () => 'Win32' });
window.chrome = window.chrome || { runtime: {} };
const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
if (originalQuery) {
    window.navigator.permissions.query = (parameters) =>
        parameters.name === 'notifications'
            ? Promise.resolve({ state: Notification.permission })
            : originalQuery(parameters);
}
"#;

const BODY_TEXT_JS: &str = "document.body ? document.body.innerText : ''";

/// Time given to client-side rendering after load before the page is read.
const SETTLE_DELAY: Duration = Duration::from_millis(1500);

pub struct ChromiumLauncher {
    chrome_bin: Option<PathBuf>,
    headless: bool,
    user_agent: String,
}

impl ChromiumLauncher {
    pub fn new(chrome_bin: Option<PathBuf>, headless: bool) -> Self {
        Self {
            chrome_bin,
            headless,
            user_agent: DESKTOP_USER_AGENT.to_string(),
        }
    }

    fn config(&self) -> Result<BrowserConfig> {
        let mut args = vec![
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            "--disable-infobars".to_string(),
            "--disable-extensions".to_string(),
            "--window-size=1366,900".to_string(),
            "--lang=en-US".to_string(),
        ];
        if std::env::var("CI").is_ok() || std::env::var("NO_SANDBOX").is_ok() {
            args.push("--no-sandbox".to_string());
        }

        let mut builder = BrowserConfig::builder();
        if let Some(bin) = &self.chrome_bin {
            builder = builder.chrome_executable(bin);
        }
        if !self.headless {
            builder = builder.with_head();
        }
        builder
            .args(args)
            .build()
            .map_err(|e| anyhow!("Invalid browser config: {}", e))
    }

    async fn prepare_page(&self, browser: &Browser) -> Result<Page> {
        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open page")?;
        page.execute(SetUserAgentOverrideParams::new(self.user_agent.clone()))
            .await
            .context("Failed to override user agent")?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_JS))
            .await
            .context("Failed to install stealth script")?;
        Ok(page)
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>> {
        let (browser, mut handler) = Browser::launch(self.config()?)
            .await
            .context("Failed to launch Chromium")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            debug!("Chromium event loop exited");
        });

        let page = match self.prepare_page(&browser).await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(e);
            }
        };

        Ok(Box::new(ChromiumSession {
            browser,
            page,
            handler_task,
        }))
    }
}

struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
}

/// A session dropped without `close` (its fetch was cancelled) still stops
/// the event loop; dropping `Browser` kills the child process.
impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

impl ChromiumSession {
    async fn snapshot(&self) -> Result<PageSnapshot> {
        tokio::time::sleep(SETTLE_DELAY).await;

        let url = self.page.url().await?.unwrap_or_default();
        let html = self.page.content().await.context("Failed to read page HTML")?;
        let text = self
            .page
            .evaluate(BODY_TEXT_JS)
            .await
            .context("Failed to read page text")?
            .into_value::<String>()
            .unwrap_or_default();

        Ok(PageSnapshot { url, html, text })
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn open(&mut self, url: &str) -> Result<PageSnapshot> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Failed to navigate to {}", url))?
            .wait_for_navigation()
            .await
            .with_context(|| format!("Navigation to {} did not settle", url))?;
        self.snapshot().await
    }

    async fn submit_captcha_token(&mut self, _challenge: &Challenge, token: &str) -> Result<PageSnapshot> {
        let token_json = serde_json::to_string(token)?;
        let script = format!(
            r#"(() => {{
                const token = {token_json};
                for (const name of ['g-recaptcha-response', 'h-captcha-response']) {{
                    document.querySelectorAll(`[name="${{name}}"], #${{name}}`).forEach((el) => {{
                        el.style.display = 'block';
                        el.value = token;
                        el.innerHTML = token;
                    }});
                }}
                const form = document.querySelector('form');
                if (form) {{ form.submit(); return true; }}
                return false;
            }})()"#
        );

        let submitted = self
            .page
            .evaluate(script)
            .await
            .context("Failed to inject captcha token")?
            .into_value::<bool>()
            .unwrap_or(false);

        if submitted {
            self.page
                .wait_for_navigation()
                .await
                .context("Resubmitted challenge did not navigate")?;
        } else {
            self.page.reload().await.context("Failed to reload after token injection")?;
        }
        self.snapshot().await
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Chromium close failed: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}
