//! Scraped Site Profiles
//! Mission: Describe each valuation site as data, not code
//!
//! A profile knows how to build the landing URL for an address, which
//! patterns pull an estimate out of embedded page state or rendered text, and
//! what a resolved property page URL looks like.

use anyhow::{Context, Result};
use regex::Regex;

use super::browser::PageSnapshot;
use super::SourceValuation;

/// Bounds that separate a home value from stray dollar figures on the page
/// (monthly payments, tax amounts).
const MIN_PLAUSIBLE_VALUE: f64 = 10_000.0;
const MAX_PLAUSIBLE_VALUE: f64 = 100_000_000.0;

const AMOUNT: &str = r"\$\s*([\d,]+(?:\.\d+)?)([KkMm])?\b";

#[derive(Debug, Clone)]
pub struct SiteProfile {
    pub source_id: &'static str,
    pub display_name: &'static str,
    /// `{slug}` becomes `123-Main-St-Tampa-FL-33601`, `{query}` the
    /// url-encoded address.
    url_template: &'static str,
    state_patterns: Vec<Regex>,
    text_patterns: Vec<Regex>,
    property_page: Regex,
}

impl SiteProfile {
    fn build(
        source_id: &'static str,
        display_name: &'static str,
        url_template: &'static str,
        state_keys: &[&str],
        text_labels: &[&str],
        property_page: &str,
    ) -> Result<Self> {
        let state_patterns = state_keys
            .iter()
            .map(|key| {
                Regex::new(&format!(
                    r#"(?:"|&quot;){}(?:"|&quot;)\s*:\s*(\d+(?:\.\d+)?)"#,
                    regex::escape(key)
                ))
            })
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Invalid state pattern for {}", source_id))?;

        let text_patterns = text_labels
            .iter()
            .map(|label| Regex::new(&format!(r"(?i){}[^$]{{0,80}}{}", label, AMOUNT)))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Invalid text pattern for {}", source_id))?;

        Ok(Self {
            source_id,
            display_name,
            url_template,
            state_patterns,
            text_patterns,
            property_page: Regex::new(property_page)
                .with_context(|| format!("Invalid property page pattern for {}", source_id))?,
        })
    }

    pub fn zillow() -> Result<Self> {
        Self::build(
            "zillow",
            "Zillow",
            "https://www.zillow.com/homes/{slug}_rb/",
            &["zestimate"],
            &[r"zestimate\s*(?:®|\(r\))?"],
            r"zillow\.com/homedetails/",
        )
    }

    pub fn redfin() -> Result<Self> {
        Self::build(
            "redfin",
            "Redfin",
            "https://www.redfin.com/search?q={query}",
            &["predictedValue", "avmValue"],
            &[r"redfin\s+estimate"],
            r"redfin\.com/[A-Z]{2}/[^/]+/[^/]+/home/\d+",
        )
    }

    pub fn realtor() -> Result<Self> {
        Self::build(
            "realtor",
            "Realtor.com",
            "https://www.realtor.com/realestateandhomes-search/{slug}",
            &["estimate", "best_estimate"],
            &[r"real\s*estimate", r"estimated\s+home\s+value"],
            r"realtor\.com/realestateandhomes-detail/",
        )
    }

    pub fn all() -> Result<Vec<Self>> {
        Ok(vec![Self::zillow()?, Self::redfin()?, Self::realtor()?])
    }

    pub fn search_url(&self, address: &str) -> String {
        self.url_template
            .replace("{slug}", &address_slug(address))
            .replace("{query}", &urlencoding::encode(address.trim()))
    }

    pub fn is_property_page(&self, url: &str) -> bool {
        self.property_page.is_match(url)
    }

    /// Embedded page-state JSON first (exact), rendered text second.
    pub fn extract(&self, page: &PageSnapshot) -> Option<SourceValuation> {
        let from_state = self.state_patterns.iter().find_map(|re| {
            re.captures_iter(&page.html)
                .filter_map(|c| parse_amount(c.get(1)?.as_str(), None))
                .find(|v| is_plausible(*v))
        });

        let estimate = from_state.or_else(|| {
            self.text_patterns.iter().find_map(|re| {
                re.captures_iter(&page.text)
                    .filter_map(|c| parse_amount(c.get(1)?.as_str(), c.get(2).map(|m| m.as_str())))
                    .find(|v| is_plausible(*v))
            })
        })?;

        Some(SourceValuation {
            estimate: Some(estimate.round()),
            url: Some(page.url.clone()).filter(|u| !u.is_empty()),
            ..Default::default()
        })
    }
}

/// `123 Main St, Tampa, FL 33601` -> `123-Main-St-Tampa-FL-33601`
pub fn address_slug(address: &str) -> String {
    address
        .split(|c: char| !c.is_alphanumeric() && c != '#')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Parses `350,000`, `1.2` + `M`, `815` + `k`.
pub fn parse_amount(digits: &str, suffix: Option<&str>) -> Option<f64> {
    let base: f64 = digits.replace(',', "").parse().ok()?;
    let multiplier = match suffix.map(|s| s.to_ascii_lowercase()) {
        Some(s) if s == "k" => 1_000.0,
        Some(s) if s == "m" => 1_000_000.0,
        _ => 1.0,
    };
    Some(base * multiplier)
}

fn is_plausible(value: f64) -> bool {
    value.is_finite() && (MIN_PLAUSIBLE_VALUE..=MAX_PLAUSIBLE_VALUE).contains(&value)
}
