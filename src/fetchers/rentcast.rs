//! RentCast AVM Integration
//! Mission: Structured value + range + subject property in one HTTP call

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{FetchFailure, FetchOutcome, SourceFetcher, SourceValuation};
use crate::models::PropertyData;

pub const SOURCE_ID: &str = "rentcast";

pub struct RentcastFetcher {
    client: Client,
    api_key: Option<String>,
    api_base: String,
    request_timeout: Duration,
}

impl RentcastFetcher {
    pub fn new(api_key: Option<String>, api_base: impl Into<String>, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent("ValueBot/1.0 (Valuation Engine)")
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    async fn request(&self, api_key: &str, address: &str) -> FetchOutcome {
        let url = format!("{}/avm/value", self.api_base);
        let request = self
            .client
            .get(&url)
            .header("X-Api-Key", api_key)
            .header("Accept", "application/json")
            .query(&[("address", address)]);

        let response = match timeout(self.request_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return FetchOutcome::Failed(FetchFailure::Timeout(self.request_timeout))
            }
            Ok(Err(e)) => return FetchOutcome::Failed(FetchFailure::Http(e.to_string())),
            Err(_) => {
                return FetchOutcome::Failed(FetchFailure::Timeout(self.request_timeout))
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(address, "RentCast has no valuation for address");
            return FetchOutcome::NotFound;
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, "RentCast API error: {}", text);
            return FetchOutcome::Failed(FetchFailure::Http(format!("HTTP {}", status.as_u16())));
        }

        match response.text().await {
            Ok(body) => parse_avm_response(&body),
            Err(e) => FetchOutcome::Failed(FetchFailure::Http(e.to_string())),
        }
    }
}

#[async_trait]
impl SourceFetcher for RentcastFetcher {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch(&self, address: &str) -> FetchOutcome {
        let Some(api_key) = self.api_key.as_deref() else {
            return FetchOutcome::Failed(FetchFailure::NotConfigured("RENTCAST_API_KEY"));
        };

        let outcome = self.request(api_key, address).await;
        if let FetchOutcome::Found(v) = &outcome {
            info!(address, estimate = ?v.estimate, "🏠 RentCast valuation received");
        }
        outcome
    }
}

// API Response Types
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvmResponse {
    price: Option<f64>,
    price_range_low: Option<f64>,
    price_range_high: Option<f64>,
    subject_property: Option<SubjectProperty>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectProperty {
    square_footage: Option<f64>,
    bedrooms: Option<f64>,
    bathrooms: Option<f64>,
    year_built: Option<i32>,
    lot_size: Option<f64>,
    property_type: Option<String>,
    last_sale_date: Option<String>,
    last_sale_price: Option<f64>,
}

impl From<SubjectProperty> for PropertyData {
    fn from(p: SubjectProperty) -> Self {
        PropertyData {
            sqft: p.square_footage,
            beds: p.bedrooms,
            baths: p.bathrooms,
            year_built: p.year_built,
            lot_size: p.lot_size,
            property_type: p.property_type,
            last_sale_date: p.last_sale_date,
            last_sale_price: p.last_sale_price,
        }
    }
}

/// Maps an AVM body to an outcome. A missing or non-positive price is
/// `NotFound`; a body that is not the expected JSON is a parse failure.
pub fn parse_avm_response(body: &str) -> FetchOutcome {
    let parsed: AvmResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => return FetchOutcome::Failed(FetchFailure::Parse(e.to_string())),
    };

    let Some(price) = parsed.price.filter(|p| p.is_finite() && *p > 0.0) else {
        return FetchOutcome::NotFound;
    };

    FetchOutcome::Found(SourceValuation {
        estimate: Some(price.round()),
        low: parsed.price_range_low.map(f64::round),
        high: parsed.price_range_high.map(f64::round),
        url: None,
        property_data: parsed
            .subject_property
            .map(PropertyData::from)
            .filter(|p| !p.is_empty()),
    })
}
