//! Application configuration
//! Mission: Everything tunable comes from the environment, with sane defaults

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RENTCAST_API_BASE: &str = "https://api.rentcast.io/v1";
pub const DEFAULT_CAPTCHA_API_BASE: &str = "https://2captcha.com";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub rentcast_api_key: Option<String>,
    pub rentcast_api_base: String,
    pub captcha_api_key: Option<String>,
    pub captcha_api_base: String,
    pub captcha_poll_interval: Duration,
    pub captcha_max_attempts: u32,
    pub api_timeout: Duration,
    pub page_timeout: Duration,
    pub browser_headless: bool,
    pub chrome_bin: Option<PathBuf>,
    pub disabled_sources: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database_path: "valuebot_history.db".to_string(),
            rentcast_api_key: None,
            rentcast_api_base: DEFAULT_RENTCAST_API_BASE.to_string(),
            captcha_api_key: None,
            captcha_api_base: DEFAULT_CAPTCHA_API_BASE.to_string(),
            captcha_poll_interval: Duration::from_secs(5),
            captcha_max_attempts: 24,
            api_timeout: Duration::from_secs(15),
            page_timeout: Duration::from_secs(45),
            browser_headless: true,
            chrome_bin: None,
            disabled_sources: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        load_env();
        let defaults = Self::default();

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);

        let database_path = env::var("DATABASE_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.database_path);

        let disabled_sources = env::var("DISABLED_SOURCES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            port,
            database_path,
            rentcast_api_key: non_empty_var("RENTCAST_API_KEY"),
            rentcast_api_base: non_empty_var("RENTCAST_API_BASE")
                .unwrap_or(defaults.rentcast_api_base),
            captcha_api_key: non_empty_var("CAPTCHA_API_KEY")
                .or_else(|| non_empty_var("TWOCAPTCHA_API_KEY")),
            captcha_api_base: non_empty_var("CAPTCHA_API_BASE")
                .unwrap_or(defaults.captcha_api_base),
            captcha_poll_interval: secs_var("CAPTCHA_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.captcha_poll_interval),
            captcha_max_attempts: env::var("CAPTCHA_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|&v| v > 0)
                .unwrap_or(defaults.captcha_max_attempts),
            api_timeout: secs_var("API_TIMEOUT_SECS").unwrap_or(defaults.api_timeout),
            page_timeout: secs_var("PAGE_TIMEOUT_SECS").unwrap_or(defaults.page_timeout),
            browser_headless: env::var("BROWSER_HEADLESS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.browser_headless),
            chrome_bin: non_empty_var("CHROME_BIN").map(PathBuf::from),
            disabled_sources,
        })
    }

    pub fn source_enabled(&self, id: &str) -> bool {
        !self.disabled_sources.iter().any(|s| s == id)
    }
}

pub fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "on" | "ON")
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn secs_var(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .map(Duration::from_secs)
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate dir for runs
    // launched with --manifest-path from elsewhere.
    let _ = dotenv::dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        assert!(parse_flag("1"));
        assert!(parse_flag("on"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("yes"));
    }

    #[test]
    fn test_disabled_sources() {
        let config = Config {
            disabled_sources: vec!["redfin".to_string()],
            ..Config::default()
        };
        assert!(!config.source_enabled("redfin"));
        assert!(config.source_enabled("zillow"));
    }
}
