//! Valuation data model
//! Mission: One vocabulary for sources, events, estimates and history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved `source` value of the final stream message. No registered source
/// may use it.
pub const COMPLETE_SENTINEL: &str = "__complete__";

/// Range spread applied when a source reports a point estimate only.
pub const DEFAULT_RANGE_SPREAD: f64 = 0.05;

/// Per-source status within one sweep
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Checking,
    Found,
    NotFound,
    Error,
}

impl SourceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SourceStatus::Checking => "checking",
            SourceStatus::Found => "found",
            SourceStatus::NotFound => "not_found",
            SourceStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SourceStatus::Checking)
    }
}

/// Subject-property attributes. Every field is optional since sources
/// disagree on what they publish.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PropertyData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baths: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_built: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lot_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sale_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sale_price: Option<f64>,
}

impl PropertyData {
    pub fn is_empty(&self) -> bool {
        self.sqft.is_none()
            && self.beds.is_none()
            && self.baths.is_none()
            && self.year_built.is_none()
            && self.lot_size.is_none()
            && self.property_type.is_none()
            && self.last_sale_date.is_none()
            && self.last_sale_price.is_none()
    }
}

/// One progress message on the stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FetchEvent {
    pub source: String,
    pub status: SourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_data: Option<PropertyData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchEvent {
    fn bare(source: &str, status: SourceStatus) -> Self {
        Self {
            source: source.to_string(),
            status,
            estimate: None,
            low: None,
            high: None,
            url: None,
            property_data: None,
            error: None,
        }
    }

    pub fn checking(source: &str) -> Self {
        Self::bare(source, SourceStatus::Checking)
    }

    pub fn not_found(source: &str) -> Self {
        Self::bare(source, SourceStatus::NotFound)
    }

    pub fn error(source: &str, reason: impl Into<String>) -> Self {
        let mut event = Self::bare(source, SourceStatus::Error);
        event.error = Some(reason.into());
        event
    }

    /// Stream terminator. Carries the checking status only because every
    /// message needs one; readers key off `source`.
    pub fn complete() -> Self {
        Self::bare(COMPLETE_SENTINEL, SourceStatus::Checking)
    }

    pub fn is_complete(&self) -> bool {
        self.source == COMPLETE_SENTINEL
    }
}

/// A normalized estimate from one source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValuationEstimate {
    /// Display name of the source that produced it
    pub source: String,
    pub estimate: f64,
    pub low: f64,
    pub high: f64,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ValuationEstimate {
    /// Builds an estimate, filling a missing range with ±5% and widening a
    /// reported range that does not contain the point estimate.
    pub fn new(
        source: impl Into<String>,
        estimate: f64,
        low: Option<f64>,
        high: Option<f64>,
        url: Option<String>,
    ) -> Self {
        let low = low
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or_else(|| (estimate * (1.0 - DEFAULT_RANGE_SPREAD)).round());
        let high = high
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or_else(|| (estimate * (1.0 + DEFAULT_RANGE_SPREAD)).round());

        Self {
            source: source.into(),
            estimate,
            low: low.min(estimate),
            high: high.max(estimate),
            last_updated: Utc::now(),
            url,
        }
    }
}

/// One remembered sweep
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub address: String,
    pub timestamp: DateTime<Utc>,
    pub estimates: Vec<ValuationEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_data: Option<PropertyData>,
    pub median_estimate: f64,
}

/// Aggregate of one complete sweep. Also the body of the fallback endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub address: String,
    pub results: Vec<ValuationEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_data: Option<PropertyData>,
    pub fetched_at: DateTime<Utc>,
}

impl SweepReport {
    pub fn estimate_values(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.estimate).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_range_defaults_to_five_percent() {
        let est = ValuationEstimate::new("RentCast", 350_000.0, None, None, None);
        assert_eq!(est.low, 332_500.0);
        assert_eq!(est.high, 367_500.0);
    }

    #[test]
    fn test_range_always_contains_estimate() {
        let est = ValuationEstimate::new("Zillow", 300_000.0, Some(310_000.0), Some(290_000.0), None);
        assert!(est.low <= est.estimate && est.estimate <= est.high);
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(FetchEvent::error("zillow", "timed out")).unwrap();
        assert_eq!(json["source"], "zillow");
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "timed out");
        assert!(json.get("estimate").is_none());

        let done: FetchEvent = serde_json::from_str(r#"{"source":"__complete__","status":"checking"}"#).unwrap();
        assert!(done.is_complete());
    }

    #[test]
    fn test_property_data_uses_camel_case() {
        let data = PropertyData {
            year_built: Some(1994),
            last_sale_price: Some(210_000.0),
            ..Default::default()
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["yearBuilt"], 1994);
        assert_eq!(json["lastSalePrice"], 210_000.0);
        assert!(!data.is_empty());
        assert!(PropertyData::default().is_empty());
    }
}
