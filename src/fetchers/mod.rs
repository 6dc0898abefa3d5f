//! Source Fetchers
//! Mission: Every source answers the same question the same way
//!
//! A fetcher turns an address into a [`FetchOutcome`] and never lets an error
//! escape: timeouts, bad payloads and anti-bot walls all come back as values.

pub mod browser;
pub mod captcha;
pub mod chromium;
pub mod rentcast;
pub mod site_profiles;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::models::PropertyData;

pub use browser::{BrowserFetcher, BrowserLauncher, BrowserSession, PageSnapshot};
pub use captcha::{CaptchaError, CaptchaService, CaptchaSolver, PollPolicy, TwoCaptchaService};
pub use chromium::ChromiumLauncher;
pub use rentcast::RentcastFetcher;
pub use site_profiles::SiteProfile;

/// What a source had to say about an address. A url-only value (no estimate)
/// means the property page exists but carried no parsable number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceValuation {
    pub estimate: Option<f64>,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub url: Option<String>,
    pub property_data: Option<PropertyData>,
}

impl SourceValuation {
    pub fn url_only(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(SourceValuation),
    NotFound,
    Failed(FetchFailure),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Found(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream error: {0}")]
    Http(String),
    #[error("unreadable response: {0}")]
    Parse(String),
    #[error("blocked by anti-bot challenge: {0}")]
    Blocked(String),
    #[error("captcha solve timed out after {0} polls")]
    CaptchaTimeout(u32),
    #[error("captcha solve failed: {0}")]
    Captcha(String),
    #[error("page load failed: {0}")]
    Navigation(String),
    #[error("not configured: {0}")]
    NotConfigured(&'static str),
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Registry id of the source this fetcher serves
    fn source_id(&self) -> &str;

    async fn fetch(&self, address: &str) -> FetchOutcome;
}
