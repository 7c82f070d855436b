//! Upstream market records come in more than one shape. Each shape has a named
//! strategy; `normalize` tries them in order and the first success wins.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use super::{NormalizedMarket, OutcomePrice, PriceData};

pub trait SchemaStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the record is not this shape or is structurally unusable.
    fn parse(&self, v: &Value) -> Option<NormalizedMarket>;
}

/// camelCase Gamma `/markets` record. `outcomes`, `outcomePrices` and
/// `clobTokenIds` arrive as JSON-encoded strings or as real arrays.
pub struct GammaSchema;

/// snake_case CLOB / legacy record with a `tokens` array.
pub struct ClobSchema;

pub static STRATEGIES: &[&dyn SchemaStrategy] = &[&GammaSchema, &ClobSchema];

/// Run the strategies in order. Returns the winning strategy name with the record.
pub fn normalize(v: &Value) -> Option<(&'static str, NormalizedMarket)> {
    STRATEGIES
        .iter()
        .find_map(|s| s.parse(v).map(|m| (s.name(), m)))
}

const GAMMA_MARKERS: &[&str] = &[
    "conditionId",
    "outcomePrices",
    "clobTokenIds",
    "volume24hr",
    "endDate",
    "endDateIso",
];

const CLOB_MARKERS: &[&str] = &[
    "condition_id",
    "tokens",
    "outcome_prices",
    "volume_24hr",
    "end_date_iso",
    "market_slug",
];

impl SchemaStrategy for GammaSchema {
    fn name(&self) -> &'static str {
        "gamma"
    }

    fn parse(&self, v: &Value) -> Option<NormalizedMarket> {
        if !has_any(v, GAMMA_MARKERS) {
            return None;
        }
        let id = id_field(v, &["conditionId", "id"])?;
        let question = str_field(v, &["question"])?;

        let outcomes = string_list(v, "outcomes");
        let declared = f64_list(v, "outcomePrices");
        let token_ids = string_list(v, "clobTokenIds");

        // Labels and prices line up only when both lists have the same length.
        let (tokens, outcome_prices) = if !outcomes.is_empty() && outcomes.len() == declared.len() {
            let tokens = outcomes
                .iter()
                .zip(declared.iter())
                .enumerate()
                .map(|(i, (outcome, &price))| OutcomePrice {
                    outcome: outcome.clone(),
                    price,
                    token_id: token_ids.get(i).cloned(),
                })
                .collect();
            (tokens, Vec::new())
        } else {
            (Vec::new(), declared)
        };

        let history_token = history_token(&tokens).or_else(|| token_ids.first().cloned());

        let category = str_field(v, &["category"]).or_else(|| {
            v.get("events")
                .and_then(|e| e.as_array())
                .and_then(|a| a.first())
                .and_then(|e| e.get("category"))
                .and_then(|c| c.as_str())
                .map(|s| s.to_string())
        });

        Some(NormalizedMarket {
            id,
            question,
            description: str_field(v, &["description"]),
            category,
            end_date: str_field(v, &["endDate", "endDateIso"]).and_then(|s| parse_end_date(&s)),
            active: composite_active(v),
            volume_24h: f64_field(v, &["volume24hr", "volume24hrClob"]).unwrap_or(0.0),
            prices: PriceData { tokens, outcome_prices },
            history_token,
        })
    }
}

impl SchemaStrategy for ClobSchema {
    fn name(&self) -> &'static str {
        "clob"
    }

    fn parse(&self, v: &Value) -> Option<NormalizedMarket> {
        if !has_any(v, CLOB_MARKERS) {
            return None;
        }
        let id = id_field(v, &["condition_id", "id"])?;
        let question = str_field(v, &["question"])?;

        let tokens: Vec<OutcomePrice> = v
            .get("tokens")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| {
                        Some(OutcomePrice {
                            outcome: str_field(t, &["outcome"]).unwrap_or_default(),
                            price: f64_field(t, &["price"])?,
                            token_id: id_field(t, &["token_id"]),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(NormalizedMarket {
            id,
            question,
            description: str_field(v, &["description"]),
            category: str_field(v, &["category"]),
            end_date: str_field(v, &["end_date_iso", "end_date"]).and_then(|s| parse_end_date(&s)),
            active: composite_active(v),
            volume_24h: f64_field(v, &["volume_24hr", "volume"]).unwrap_or(0.0),
            history_token: history_token(&tokens),
            prices: PriceData { tokens, outcome_prices: f64_list(v, "outcome_prices") },
        })
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn has_any(v: &Value, keys: &[&str]) -> bool {
    v.as_object()
        .is_some_and(|o| keys.iter().any(|k| o.contains_key(*k)))
}

/// Yes-labelled token id, else the first token id.
fn history_token(tokens: &[OutcomePrice]) -> Option<String> {
    tokens
        .iter()
        .find(|t| t.outcome.trim().eq_ignore_ascii_case("yes"))
        .and_then(|t| t.token_id.clone())
        .or_else(|| tokens.iter().find_map(|t| t.token_id.clone()))
}

/// Missing flags read as active=true, closed=false, archived=false.
fn composite_active(v: &Value) -> bool {
    let flag = |key: &str, default: bool| v.get(key).and_then(|b| b.as_bool()).unwrap_or(default);
    flag("active", true) && !flag("closed", false) && !flag("archived", false)
}

/// Identifiers show up as strings or bare numbers.
fn id_field(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match v.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn str_field(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(|s| s.as_str()).map(|s| s.to_string()))
}

/// Numbers or numeric strings.
fn f64_field(v: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| as_f64(v.get(*k)?))
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
        .filter(|x| x.is_finite())
}

/// A list field given either as a JSON array or as a string containing one.
fn list_field(v: &Value, key: &str) -> Vec<Value> {
    match v.get(key) {
        Some(Value::Array(a)) => a.clone(),
        Some(Value::String(s)) => serde_json::from_str::<Vec<Value>>(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn string_list(v: &Value, key: &str) -> Vec<String> {
    list_field(v, key)
        .iter()
        .filter_map(|x| match x {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

fn f64_list(v: &Value, key: &str) -> Vec<f64> {
    list_field(v, key).iter().filter_map(as_f64).collect()
}

/// RFC 3339 timestamps or bare `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_end_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
