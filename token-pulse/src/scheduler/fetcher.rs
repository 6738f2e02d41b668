//! External price API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ErrorKind, FetchError};

/// One trading pair returned for a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPair {
    pub pair_address: String,
    #[serde(default)]
    pub dex_id: String,
    #[serde(default)]
    pub base_symbol: String,
    #[serde(default)]
    pub quote_symbol: String,
    #[serde(default)]
    pub price_usd: Option<f64>,
    #[serde(default)]
    pub liquidity_usd: Option<f64>,
    #[serde(default)]
    pub volume_24h: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PairsResponse {
    #[serde(default)]
    pairs: Option<Vec<MarketPair>>,
}

/// Source of market data for a token key.
///
/// Failures are typed: [`FetchError::is_retryable`] separates transient
/// failures from ones that must not be retried. A missing token is not an
/// error and yields an empty list.
#[async_trait]
pub trait PriceFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Vec<MarketPair>, FetchError>;
}

/// HTTP implementation of [`PriceFetcher`] using `GET {base_url}/tokens/{key}`.
pub struct HttpPriceFetcher {
    client: Client,
    base_url: String,
}

impl HttpPriceFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("token-pulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl PriceFetcher for HttpPriceFetcher {
    async fn fetch(&self, key: &str) -> Result<Vec<MarketPair>, FetchError> {
        let url = format!("{}/tokens/{}", self.base_url, key);
        debug!(url = %url, "Fetching token pairs");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(key, &e))?;

        let status = response.status().as_u16();
        if status == 404 {
            return Ok(Vec::new());
        }

        let body = response
            .text()
            .await
            .map_err(|e| transport_error(key, &e))?;

        if let Some(err) = FetchError::from_status(key, status, &body) {
            return Err(err);
        }

        parse_pairs(key, &body)
    }
}

/// Parse a pairs payload. `{"pairs": null}` is an empty result.
pub fn parse_pairs(key: &str, body: &str) -> Result<Vec<MarketPair>, FetchError> {
    serde_json::from_str::<PairsResponse>(body)
        .map(|r| r.pairs.unwrap_or_default())
        .map_err(|e| FetchError::new(ErrorKind::MalformedResponse, key, e.to_string()))
}

fn transport_error(key: &str, err: &reqwest::Error) -> FetchError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() || err.is_request() {
        ErrorKind::Connection
    } else if err.is_decode() || err.is_body() {
        ErrorKind::MalformedResponse
    } else {
        ErrorKind::Unknown
    };
    FetchError::new(kind, key, err.to_string())
}
