use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{Config, HISTORY_FIDELITY_MINUTES};
use crate::error::{AppError, Result};

use super::normalize::{normalize, parse_end_date};
use super::{FetchStats, MarketSource, NormalizedMarket, RawPricePoint};

/// Gamma caps a single `/markets` page at this many records.
const GAMMA_PAGE_SIZE: usize = 500;

/// Pages fetched beyond what `market_limit` needs, to absorb unparseable records.
const EXTRA_PAGES: usize = 2;

/// HTTP client for the Gamma market list and the CLOB price history.
pub struct PolymarketClient {
    http: reqwest::Client,
    gamma_api_url: String,
    clob_api_url: String,
    market_limit: usize,
}

impl PolymarketClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            gamma_api_url: cfg.gamma_api_url.trim_end_matches('/').to_string(),
            clob_api_url: cfg.clob_api_url.trim_end_matches('/').to_string(),
            market_limit: cfg.market_limit,
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self.http.get(url).query(query).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream { status, body });
        }

        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl MarketSource for PolymarketClient {
    /// Highest 24h-volume markets first, paged until `market_limit` is reached.
    async fn fetch_active_markets(&self) -> Result<(Vec<NormalizedMarket>, FetchStats)> {
        let url = format!("{}/markets", self.gamma_api_url);
        let page_size = self.market_limit.clamp(1, GAMMA_PAGE_SIZE);

        let mut markets = Vec::new();
        let mut stats = FetchStats::default();
        let mut offset = 0usize;
        let max_pages = self.market_limit.div_ceil(page_size) + EXTRA_PAGES;
        let mut pages = 0usize;

        'outer: loop {
            if pages == max_pages {
                warn!(pages, kept = markets.len(), "Market list page cap reached, stopping");
                break;
            }
            pages += 1;

            let query = [
                ("active", "true".to_string()),
                ("closed", "false".to_string()),
                ("archived", "false".to_string()),
                ("limit", page_size.to_string()),
                ("offset", offset.to_string()),
                ("order", "volume24hr".to_string()),
                ("ascending", "false".to_string()),
            ];
            let resp = self.get_json(&url, &query).await?;

            let items = match resp {
                Value::Array(items) => items,
                // Some deployments wrap the list.
                Value::Object(mut obj) => match obj.remove("data") {
                    Some(Value::Array(items)) => items,
                    _ => {
                        return Err(AppError::Malformed(
                            "/markets response was not a list".to_string(),
                        ))
                    }
                },
                _ => {
                    return Err(AppError::Malformed(
                        "/markets response was not a list".to_string(),
                    ))
                }
            };

            if items.is_empty() {
                break;
            }
            stats.api_total += items.len();

            for item in &items {
                match normalize(item) {
                    Some((schema, market)) => {
                        match schema {
                            "gamma" => stats.by_gamma += 1,
                            _ => stats.by_clob += 1,
                        }
                        markets.push(market);
                        if markets.len() >= self.market_limit {
                            break 'outer;
                        }
                    }
                    None => {
                        stats.unparseable += 1;
                        debug!("Skipping market record no schema recognized");
                    }
                }
            }

            if items.len() < page_size {
                break;
            }
            offset += page_size;
        }

        Ok((markets, stats))
    }

    async fn fetch_price_history(
        &self,
        history_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawPricePoint>> {
        let url = format!("{}/prices-history", self.clob_api_url);
        let query = [
            ("market", history_key.to_string()),
            ("startTs", from.timestamp().to_string()),
            ("endTs", to.timestamp().to_string()),
            ("fidelity", HISTORY_FIDELITY_MINUTES.to_string()),
        ];
        let resp = self.get_json(&url, &query).await?;
        let points = parse_history(&resp)?;
        if points.is_empty() {
            warn!(history_key, "Price history came back empty");
        }
        Ok(points)
    }
}

/// Accepts `{"history": [{"t", "p"}]}` or a bare array, with `timestamp`/`price`
/// as alternate keys. Unusable points are dropped; output is ascending by time.
pub fn parse_history(v: &Value) -> Result<Vec<RawPricePoint>> {
    let items = match v {
        Value::Array(a) => a,
        Value::Object(o) => match o.get("history") {
            Some(Value::Array(a)) => a,
            _ => {
                return Err(AppError::Malformed(
                    "price history has no history list".to_string(),
                ))
            }
        },
        _ => return Err(AppError::Malformed("price history was not JSON object".to_string())),
    };

    let mut points: Vec<RawPricePoint> = items
        .iter()
        .filter_map(|p| {
            let timestamp = p.get("t").or_else(|| p.get("timestamp")).and_then(parse_timestamp)?;
            let price = p
                .get("p")
                .or_else(|| p.get("price"))
                .and_then(|x| x.as_f64().or_else(|| x.as_str()?.trim().parse().ok()))
                .filter(|x: &f64| x.is_finite())?;
            Some(RawPricePoint { timestamp, price })
        })
        .collect();

    points.sort_by_key(|p| p.timestamp);
    Ok(points)
}

/// Unix seconds, Unix milliseconds (values past ~2001-09 in ms), or RFC 3339 text.
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if raw > 1_000_000_000_000 {
                DateTime::from_timestamp_millis(raw)
            } else {
                DateTime::from_timestamp(raw, 0)
            }
        }
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(raw) => parse_timestamp(&Value::from(raw)),
            Err(_) => parse_end_date(s),
        },
        _ => None,
    }
}
