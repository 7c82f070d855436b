pub mod client;
pub mod normalize;
pub mod probability;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use client::PolymarketClient;
pub use probability::{derive_probability, price_to_probability};

/// Canonical market record produced by every schema strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMarket {
    pub id: String,
    pub question: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    /// `active AND NOT closed AND NOT archived`
    pub active: bool,
    pub volume_24h: f64,
    pub prices: PriceData,
    /// Identifier the price-history endpoint keys on, when the record carries one.
    pub history_token: Option<String>,
}

impl NormalizedMarket {
    /// Key for `fetch_price_history`: the outcome token if known, else the market id.
    pub fn history_key(&self) -> &str {
        self.history_token.as_deref().unwrap_or(&self.id)
    }
}

/// Raw price inputs, in the order the probability policy consults them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceData {
    /// Labelled per-outcome prices.
    pub tokens: Vec<OutcomePrice>,
    /// Declared outcome-price list without usable labels.
    pub outcome_prices: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomePrice {
    pub outcome: String,
    pub price: f64,
    pub token_id: Option<String>,
}

/// One historical sample as returned upstream; `price` is not yet a probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

#[derive(Debug, Default, Clone)]
pub struct FetchStats {
    pub api_total: usize,
    /// Records no schema strategy could normalize.
    pub unparseable: usize,
    pub by_gamma: usize,
    pub by_clob: usize,
}

#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Active markets, not guaranteed unique by id.
    async fn fetch_active_markets(&self) -> Result<(Vec<NormalizedMarket>, FetchStats)>;

    /// Historical prices in `[from, to]`, ascending by timestamp.
    async fn fetch_price_history(
        &self,
        history_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawPricePoint>>;
}
