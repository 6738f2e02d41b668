//! Token storage seen by the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::fetcher::MarketPair;
use crate::Result;

/// Polling group a token belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TokenGroup {
    /// Recently active tokens, polled often.
    Hot,
    Cold,
}

/// Repository and scoring layer.
///
/// `apply` is always called sequentially, one token at a time, after a
/// successful fetch.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Token keys in polling order.
    async fn tokens_for_group(&self, group: TokenGroup) -> Result<Vec<String>>;

    /// Store fetched pairs. Returns `true` if the stored state changed.
    async fn apply(&self, key: &str, pairs: &[MarketPair]) -> Result<bool>;
}

/// Stored view of one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub key: String,
    pub group: TokenGroup,
    pub pairs: Vec<MarketPair>,
    /// Price of the most liquid pair.
    pub price_usd: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updates: u64,
}

/// In-process repository, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryTokenRepository {
    tokens: DashMap<String, TokenRecord>,
}

impl InMemoryTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens<'a>(group: TokenGroup, keys: impl IntoIterator<Item = &'a str>) -> Self {
        let repo = Self::new();
        for key in keys {
            repo.insert(key, group);
        }
        repo
    }

    pub fn insert(&self, key: &str, group: TokenGroup) {
        self.tokens.insert(
            key.to_string(),
            TokenRecord {
                key: key.to_string(),
                group,
                pairs: Vec::new(),
                price_usd: None,
                updated_at: None,
                updates: 0,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<TokenRecord> {
        self.tokens.get(key).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenRepository for InMemoryTokenRepository {
    async fn tokens_for_group(&self, group: TokenGroup) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .tokens
            .iter()
            .filter(|r| r.group == group)
            .map(|r| r.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn apply(&self, key: &str, pairs: &[MarketPair]) -> Result<bool> {
        let Some(mut record) = self.tokens.get_mut(key) else {
            return Ok(false);
        };

        let price = best_price(pairs);
        let changed = record.price_usd != price || record.pairs.as_slice() != pairs;
        record.pairs = pairs.to_vec();
        record.price_usd = price;
        record.updated_at = Some(Utc::now());
        record.updates += 1;
        Ok(changed)
    }
}

/// Price of the pair with the highest liquidity.
pub fn best_price(pairs: &[MarketPair]) -> Option<f64> {
    pairs
        .iter()
        .filter(|p| p.price_usd.is_some())
        .max_by(|a, b| {
            a.liquidity_usd
                .unwrap_or(0.0)
                .total_cmp(&b.liquidity_usd.unwrap_or(0.0))
        })
        .and_then(|p| p.price_usd)
}
