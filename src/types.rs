use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// Stored market metadata. Created on first sighting, overwritten on every
/// later one, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub active: bool,
    /// 24h volume at last poll.
    pub volume: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Price history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricePoint {
    pub id: i64,
    pub market_id: String,
    pub probability: f64,
    pub volume: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// A point about to be appended; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPricePoint {
    pub probability: f64,
    pub volume: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Significance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    Minor,
    Moderate,
    Major,
}

impl Significance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Significance::Minor => "minor",
            Significance::Moderate => "moderate",
            Significance::Major => "major",
        }
    }
}

impl std::fmt::Display for Significance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Significance {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minor" => Ok(Significance::Minor),
            "moderate" => Ok(Significance::Moderate),
            "major" => Ok(Significance::Major),
            other => Err(AppError::BadRequest(format!("unknown significance {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Movements
// ---------------------------------------------------------------------------

/// A detected, classified and deduplicated probability move. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Movement {
    pub id: i64,
    pub market_id: String,
    pub start_price: f64,
    pub end_price: f64,
    /// Signed percentage change from `start_price` to `end_price`.
    pub change_percent: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub significance: Significance,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMovement {
    pub market_id: String,
    pub start_price: f64,
    pub end_price: f64,
    pub change_percent: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub significance: Significance,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Query surface shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MovementWithMarket {
    #[serde(flatten)]
    pub movement: Movement,
    pub market: Market,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketDetails {
    #[serde(flatten)]
    pub market: Market,
    /// Newest first.
    pub price_history: Vec<PricePoint>,
    /// Newest first.
    pub movements: Vec<Movement>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSummary {
    pub markets: i64,
    pub price_points: i64,
    pub movements: i64,
    pub movements_24h: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn significance_parses_case_insensitively() {
        assert_eq!("MAJOR".parse::<Significance>().unwrap(), Significance::Major);
        assert_eq!(" moderate ".parse::<Significance>().unwrap(), Significance::Moderate);
        assert!("huge".parse::<Significance>().is_err());
    }

    #[test]
    fn significance_serializes_lowercase() {
        let json = serde_json::to_string(&Significance::Minor).unwrap();
        assert_eq!(json, "\"minor\"");
    }
}
