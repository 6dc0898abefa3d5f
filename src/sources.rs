//! Source Registry
//! Mission: One catalog of valuation sources and one way to recognise them
//!
//! Upstream labels drift in casing and spacing ("Zillow Zestimate",
//! "zillow", "Realtor.com RealEstimate"), so every call site resolves labels
//! through [`SourceRegistry::match_label`] instead of comparing strings inline.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::models::COMPLETE_SENTINEL;

/// How a source is fetched, which decides its execution policy
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FetcherKind {
    /// Structured HTTP API. Fast, may run concurrently.
    Api,
    /// Headless browser session. Heavy, strictly one at a time.
    Browser,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub display_name: String,
    #[serde(skip)]
    pub aliases: Vec<String>,
    pub kind: FetcherKind,
}

impl Source {
    pub fn new(id: &str, display_name: &str, kind: FetcherKind, aliases: &[&str]) -> Self {
        Self {
            id: id.to_lowercase(),
            display_name: display_name.to_string(),
            aliases: aliases.iter().map(|a| a.to_lowercase()).collect(),
            kind,
        }
    }

    /// `label` is lowercased and trimmed, `first_token` is its first word.
    fn matches(&self, label: &str, first_token: &str) -> bool {
        let name = self.display_name.to_lowercase();
        let name_hit = !first_token.is_empty()
            && (name.contains(first_token) || self.aliases.iter().any(|a| a.contains(first_token)));

        name_hit || label.contains(&self.id) || self.aliases.iter().any(|a| label.contains(a.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Source>) -> Result<Self> {
        for (i, source) in sources.iter().enumerate() {
            if source.id.is_empty() || source.id == COMPLETE_SENTINEL {
                bail!("Invalid source id '{}'", source.id);
            }
            if sources[..i].iter().any(|s| s.id == source.id) {
                bail!("Duplicate source id '{}'", source.id);
            }
        }
        Ok(Self { sources })
    }

    /// The built-in catalog: one structured API plus three scraped sites.
    pub fn standard() -> Self {
        Self {
            sources: vec![
                Source::new("rentcast", "RentCast", FetcherKind::Api, &["rentcast avm", "rent cast"]),
                Source::new("zillow", "Zillow", FetcherKind::Browser, &["zestimate"]),
                Source::new("redfin", "Redfin", FetcherKind::Browser, &["redfin estimate"]),
                Source::new("realtor", "Realtor.com", FetcherKind::Browser, &["realestimate"]),
            ],
        }
    }

    /// Standard catalog minus anything switched off in configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::standard();
        registry.sources.retain(|s| config.source_enabled(&s.id));
        registry
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Resolves a free-form label to exactly one source. A display name
    /// containing the label's first token, or a label containing the source id
    /// (or an alias), counts as a hit. Zero or several hits give `None`.
    pub fn match_label(&self, raw: &str) -> Option<&Source> {
        let label = raw.trim().to_lowercase();
        if label.is_empty() {
            return None;
        }

        let first_token = label
            .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
            .find(|t| !t.is_empty())
            .unwrap_or_default();

        let mut hits = self.sources.iter().filter(|s| s.matches(&label, first_token));
        match (hits.next(), hits.next()) {
            (Some(source), None) => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(label: &str) -> Option<String> {
        SourceRegistry::standard()
            .match_label(label)
            .map(|s| s.id.clone())
    }

    #[test]
    fn test_matches_display_names_in_any_casing() {
        assert_eq!(matched("Zillow"), Some("zillow".into()));
        assert_eq!(matched("  REDFIN  "), Some("redfin".into()));
        assert_eq!(matched("Realtor.com"), Some("realtor".into()));
        assert_eq!(matched("RentCast AVM"), Some("rentcast".into()));
    }

    #[test]
    fn test_matches_by_embedded_id_or_alias() {
        assert_eq!(matched("via zillow"), Some("zillow".into()));
        assert_eq!(matched("Zestimate"), Some("zillow".into()));
        assert_eq!(matched("the realestimate"), Some("realtor".into()));
    }

    #[test]
    fn test_unknown_empty_and_ambiguous_labels() {
        assert_eq!(matched(""), None);
        assert_eq!(matched("   "), None);
        assert_eq!(matched("Chase Home Value"), None);
        assert_eq!(matched("zillow vs redfin"), None);
    }

    #[test]
    fn test_registry_rejects_reserved_and_duplicate_ids() {
        let sentinel = Source::new(COMPLETE_SENTINEL, "Done", FetcherKind::Api, &[]);
        assert!(SourceRegistry::new(vec![sentinel]).is_err());

        let a = Source::new("zillow", "Zillow", FetcherKind::Browser, &[]);
        assert!(SourceRegistry::new(vec![a.clone(), a]).is_err());
    }

    #[test]
    fn test_disabled_sources_are_dropped() {
        let config = Config {
            disabled_sources: vec!["realtor".into()],
            ..Config::default()
        };
        let registry = SourceRegistry::from_config(&config);
        assert_eq!(registry.len(), 3);
        assert!(registry.get("realtor").is_none());
    }
}
