use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::config::{BASELINE_WINDOW_HOURS, DEDUP_WINDOW_MINUTES};
use crate::db::Store;
use crate::error::Result;
use crate::types::{Movement, NewMovement, PricePoint, Significance};

use super::classifier::{change_percent, classify};

/// Which window produced the baseline point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineTier {
    /// Earliest point in the last 24 hours.
    Day,
    /// Earliest point inside the configured lookback.
    Lookback,
    /// Earliest point ever stored.
    Earliest,
}

/// Outcome of one detection run.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Market has no stored points.
    NoBaseline,
    BelowThreshold { change_percent: f64 },
    /// Same (market, significance) already recorded inside the dedup window.
    Suppressed { significance: Significance, change_percent: f64 },
    Recorded(Movement),
}

pub struct MovementDetector {
    store: Arc<dyn Store>,
    threshold: f64,
    lookback: Duration,
}

impl MovementDetector {
    pub fn new(store: Arc<dyn Store>, threshold: f64, lookback_minutes: i64) -> Self {
        Self {
            store,
            threshold,
            lookback: Duration::minutes(lookback_minutes),
        }
    }

    /// First match wins: last 24h, then the lookback window, then anything.
    pub async fn select_baseline(
        &self,
        market_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(PricePoint, BaselineTier)>> {
        let day_start = now - Duration::hours(BASELINE_WINDOW_HOURS);
        if let Some(p) = self.store.earliest_point_since(market_id, Some(day_start)).await? {
            return Ok(Some((p, BaselineTier::Day)));
        }
        if let Some(p) = self.store.earliest_point_since(market_id, Some(now - self.lookback)).await? {
            return Ok(Some((p, BaselineTier::Lookback)));
        }
        Ok(self
            .store
            .earliest_point_since(market_id, None)
            .await?
            .map(|p| (p, BaselineTier::Earliest)))
    }

    pub async fn detect(
        &self,
        market_id: &str,
        current: f64,
        now: DateTime<Utc>,
    ) -> Result<Detection> {
        let Some((baseline, tier)) = self.select_baseline(market_id, now).await? else {
            return Ok(Detection::NoBaseline);
        };

        let change = change_percent(baseline.probability, current);
        let Some(significance) = classify(change.abs(), self.threshold) else {
            return Ok(Detection::BelowThreshold { change_percent: change });
        };

        let since = now - Duration::minutes(DEDUP_WINDOW_MINUTES);
        if self
            .store
            .recent_movement(market_id, significance, since)
            .await?
            .is_some()
        {
            return Ok(Detection::Suppressed { significance, change_percent: change });
        }

        let movement = self
            .store
            .insert_movement(&NewMovement {
                market_id: market_id.to_string(),
                start_price: baseline.probability,
                end_price: current,
                change_percent: change,
                start_time: baseline.timestamp,
                end_time: now,
                significance,
                created_at: now,
            })
            .await?;

        info!(
            market_id,
            %significance,
            change_percent = change,
            baseline_tier = ?tier,
            "MOVEMENT | {significance} | {change:+.2}% | {:.4} -> {:.4}",
            baseline.probability,
            current,
        );

        Ok(Detection::Recorded(movement))
    }
}
