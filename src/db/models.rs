//! Row types for the tables in `migrations/`. Timestamps are epoch millis.

use chrono::{DateTime, Utc};

use crate::types::{Market, Movement, PricePoint, Significance};

#[derive(Debug, sqlx::FromRow)]
pub struct MarketRow {
    pub id: String,
    pub question: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub end_date: Option<i64>,
    pub active: bool,
    pub volume: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct PricePointRow {
    pub id: i64,
    pub market_id: String,
    pub probability: f64,
    pub volume: Option<f64>,
    pub timestamp: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct MovementRow {
    pub id: i64,
    pub market_id: String,
    pub start_price: f64,
    pub end_price: f64,
    pub change_percent: f64,
    pub start_time: i64,
    pub end_time: i64,
    pub significance: String,
    pub created_at: i64,
}

/// `movements JOIN markets`, market columns prefixed with `m_`.
#[derive(Debug, sqlx::FromRow)]
pub struct MovementWithMarketRow {
    #[sqlx(flatten)]
    pub movement: MovementRow,
    pub m_question: String,
    pub m_description: Option<String>,
    pub m_category: Option<String>,
    pub m_end_date: Option<i64>,
    pub m_active: bool,
    pub m_volume: f64,
    pub m_created_at: i64,
    pub m_updated_at: i64,
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl From<MarketRow> for Market {
    fn from(r: MarketRow) -> Self {
        Market {
            id: r.id,
            question: r.question,
            description: r.description,
            category: r.category,
            end_date: r.end_date.map(from_millis),
            active: r.active,
            volume: r.volume,
            created_at: from_millis(r.created_at),
            updated_at: from_millis(r.updated_at),
        }
    }
}

impl From<PricePointRow> for PricePoint {
    fn from(r: PricePointRow) -> Self {
        PricePoint {
            id: r.id,
            market_id: r.market_id,
            probability: r.probability,
            volume: r.volume,
            timestamp: from_millis(r.timestamp),
        }
    }
}

impl TryFrom<MovementRow> for Movement {
    type Error = crate::error::AppError;

    fn try_from(r: MovementRow) -> Result<Self, Self::Error> {
        Ok(Movement {
            id: r.id,
            market_id: r.market_id,
            start_price: r.start_price,
            end_price: r.end_price,
            change_percent: r.change_percent,
            start_time: from_millis(r.start_time),
            end_time: from_millis(r.end_time),
            significance: r.significance.parse::<Significance>()?,
            created_at: from_millis(r.created_at),
        })
    }
}

impl MovementWithMarketRow {
    pub fn market(&self) -> Market {
        Market {
            id: self.movement.market_id.clone(),
            question: self.m_question.clone(),
            description: self.m_description.clone(),
            category: self.m_category.clone(),
            end_date: self.m_end_date.map(from_millis),
            active: self.m_active,
            volume: self.m_volume,
            created_at: from_millis(self.m_created_at),
            updated_at: from_millis(self.m_updated_at),
        }
    }
}
