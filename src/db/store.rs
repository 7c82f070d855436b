use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::config::{DETAIL_HISTORY_LIMIT, DETAIL_MOVEMENT_LIMIT};
use crate::db::models::{MarketRow, MovementRow, MovementWithMarketRow, PricePointRow};
use crate::db::retry::with_retry;
use crate::error::Result;
use crate::source::NormalizedMarket;
use crate::types::{
    MarketDetails, Movement, MovementWithMarket, NewMovement, NewPricePoint, PricePoint,
    Significance, StoreSummary,
};

/// Everything the collector, detector and query surface need from persistence.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create the market, or overwrite its mutable fields and bump `updated_at`.
    async fn upsert_market(&self, market: &NormalizedMarket, now: DateTime<Utc>) -> Result<()>;

    async fn count_price_points(&self, market_id: &str) -> Result<i64>;

    /// Bulk append inside one transaction. Returns the number of rows written.
    async fn insert_price_points(&self, market_id: &str, points: &[NewPricePoint]) -> Result<usize>;

    async fn append_price_point(&self, market_id: &str, point: &NewPricePoint) -> Result<PricePoint>;

    /// Earliest point at or after `since`; with `None`, the earliest point ever.
    async fn earliest_point_since(
        &self,
        market_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<PricePoint>>;

    /// Any movement for (market, significance) created at or after `since`.
    async fn recent_movement(
        &self,
        market_id: &str,
        significance: Significance,
        since: DateTime<Utc>,
    ) -> Result<Option<Movement>>;

    async fn insert_movement(&self, movement: &NewMovement) -> Result<Movement>;

    /// Newest first, each with its market embedded.
    async fn recent_movements(
        &self,
        limit: i64,
        significance: Option<Significance>,
    ) -> Result<Vec<MovementWithMarket>>;

    /// Market with its newest points and movements, or `None` if unknown.
    async fn market_details(&self, market_id: &str) -> Result<Option<MarketDetails>>;

    async fn summary(&self, now: DateTime<Utc>) -> Result<StoreSummary>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    retry_attempts: u32,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and apply migrations.
    pub async fn connect(db_path: &str, retry_attempts: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready at {db_path}");
        Ok(Self { pool, retry_attempts })
    }

    /// Private in-memory database on a single connection.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, retry_attempts: 1 })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn recent_points(&self, market_id: &str, limit: i64) -> Result<Vec<PricePoint>> {
        let rows = sqlx::query_as::<_, PricePointRow>(
            r#"
            SELECT id, market_id, probability, volume, timestamp
            FROM price_history
            WHERE market_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(market_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PricePoint::from).collect())
    }

    async fn recent_market_movements(&self, market_id: &str, limit: i64) -> Result<Vec<Movement>> {
        let rows = sqlx::query_as::<_, MovementRow>(
            r#"
            SELECT id, market_id, start_price, end_price, change_percent,
                   start_time, end_time, significance, created_at
            FROM movements
            WHERE market_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(market_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Movement::try_from).collect()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_market(&self, market: &NormalizedMarket, now: DateTime<Utc>) -> Result<()> {
        let now_ms = now.timestamp_millis();
        let end_date = market.end_date.map(|d| d.timestamp_millis());

        sqlx::query(
            r#"
            INSERT INTO markets (id, question, description, category, end_date, active, volume, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                question = excluded.question,
                description = excluded.description,
                category = excluded.category,
                end_date = excluded.end_date,
                active = excluded.active,
                volume = excluded.volume,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&market.id)
        .bind(&market.question)
        .bind(&market.description)
        .bind(&market.category)
        .bind(end_date)
        .bind(market.active)
        .bind(market.volume_24h)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_price_points(&self, market_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM price_history WHERE market_id = ?")
            .bind(market_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn insert_price_points(&self, market_id: &str, points: &[NewPricePoint]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for p in points {
            sqlx::query(
                "INSERT INTO price_history (market_id, probability, volume, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(market_id)
            .bind(p.probability)
            .bind(p.volume)
            .bind(p.timestamp.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(points.len())
    }

    async fn append_price_point(&self, market_id: &str, point: &NewPricePoint) -> Result<PricePoint> {
        let ts = point.timestamp.timestamp_millis();
        let id = with_retry("append_price_point", self.retry_attempts, move || async move {
            let res = sqlx::query(
                "INSERT INTO price_history (market_id, probability, volume, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(market_id)
            .bind(point.probability)
            .bind(point.volume)
            .bind(ts)
            .execute(&self.pool)
            .await?;
            Ok(res.last_insert_rowid())
        })
        .await?;

        Ok(PricePoint {
            id,
            market_id: market_id.to_string(),
            probability: point.probability,
            volume: point.volume,
            timestamp: point.timestamp,
        })
    }

    async fn earliest_point_since(
        &self,
        market_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<PricePoint>> {
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(i64::MIN);
        let row = sqlx::query_as::<_, PricePointRow>(
            r#"
            SELECT id, market_id, probability, volume, timestamp
            FROM price_history
            WHERE market_id = ? AND timestamp >= ?
            ORDER BY timestamp ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(market_id)
        .bind(since_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(PricePoint::from))
    }

    async fn recent_movement(
        &self,
        market_id: &str,
        significance: Significance,
        since: DateTime<Utc>,
    ) -> Result<Option<Movement>> {
        let row = sqlx::query_as::<_, MovementRow>(
            r#"
            SELECT id, market_id, start_price, end_price, change_percent,
                   start_time, end_time, significance, created_at
            FROM movements
            WHERE market_id = ? AND significance = ? AND created_at >= ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(market_id)
        .bind(significance.as_str())
        .bind(since.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Movement::try_from).transpose()
    }

    async fn insert_movement(&self, m: &NewMovement) -> Result<Movement> {
        let id = with_retry("insert_movement", self.retry_attempts, move || async move {
            let res = sqlx::query(
                r#"
                INSERT INTO movements (
                    market_id, start_price, end_price, change_percent,
                    start_time, end_time, significance, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&m.market_id)
            .bind(m.start_price)
            .bind(m.end_price)
            .bind(m.change_percent)
            .bind(m.start_time.timestamp_millis())
            .bind(m.end_time.timestamp_millis())
            .bind(m.significance.as_str())
            .bind(m.created_at.timestamp_millis())
            .execute(&self.pool)
            .await?;
            Ok(res.last_insert_rowid())
        })
        .await?;

        Ok(Movement {
            id,
            market_id: m.market_id.clone(),
            start_price: m.start_price,
            end_price: m.end_price,
            change_percent: m.change_percent,
            start_time: m.start_time,
            end_time: m.end_time,
            significance: m.significance,
            created_at: m.created_at,
        })
    }

    async fn recent_movements(
        &self,
        limit: i64,
        significance: Option<Significance>,
    ) -> Result<Vec<MovementWithMarket>> {
        let rows = sqlx::query_as::<_, MovementWithMarketRow>(
            r#"
            SELECT mv.id, mv.market_id, mv.start_price, mv.end_price, mv.change_percent,
                   mv.start_time, mv.end_time, mv.significance, mv.created_at,
                   m.question AS m_question, m.description AS m_description,
                   m.category AS m_category, m.end_date AS m_end_date,
                   m.active AS m_active, m.volume AS m_volume,
                   m.created_at AS m_created_at, m.updated_at AS m_updated_at
            FROM movements mv
            JOIN markets m ON m.id = mv.market_id
            WHERE (?1 IS NULL OR mv.significance = ?1)
            ORDER BY mv.created_at DESC, mv.id DESC
            LIMIT ?2
            "#,
        )
        .bind(significance.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let market = row.market();
                let movement = Movement::try_from(row.movement)?;
                Ok(MovementWithMarket { movement, market })
            })
            .collect()
    }

    async fn market_details(&self, market_id: &str) -> Result<Option<MarketDetails>> {
        let row = sqlx::query_as::<_, MarketRow>(
            r#"
            SELECT id, question, description, category, end_date, active, volume, created_at, updated_at
            FROM markets
            WHERE id = ?
            "#,
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let price_history = self.recent_points(market_id, DETAIL_HISTORY_LIMIT).await?;
        let movements = self.recent_market_movements(market_id, DETAIL_MOVEMENT_LIMIT).await?;

        Ok(Some(MarketDetails {
            market: row.into(),
            price_history,
            movements,
        }))
    }

    async fn summary(&self, now: DateTime<Utc>) -> Result<StoreSummary> {
        let markets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM markets")
            .fetch_one(&self.pool)
            .await?;
        let price_points: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM price_history")
            .fetch_one(&self.pool)
            .await?;
        let movements: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM movements")
            .fetch_one(&self.pool)
            .await?;
        let since = (now - Duration::hours(24)).timestamp_millis();
        let movements_24h: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM movements WHERE created_at >= ?")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreSummary { markets, price_points, movements, movements_24h })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::PriceData;

    pub(crate) fn market(id: &str) -> NormalizedMarket {
        NormalizedMarket {
            id: id.to_string(),
            question: format!("Question for {id}?"),
            description: None,
            category: Some("Crypto".to_string()),
            end_date: None,
            active: true,
            volume_24h: 1000.0,
            prices: PriceData::default(),
            history_token: None,
        }
    }

    pub(crate) fn point(probability: f64, timestamp: DateTime<Utc>) -> NewPricePoint {
        NewPricePoint { probability, volume: None, timestamp }
    }

    fn movement(market_id: &str, significance: Significance, created_at: DateTime<Utc>) -> NewMovement {
        NewMovement {
            market_id: market_id.to_string(),
            start_price: 0.4,
            end_price: 0.6,
            change_percent: 50.0,
            start_time: created_at - Duration::hours(1),
            end_time: created_at,
            significance,
            created_at,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn upsert_overwrites_but_keeps_created_at() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut m = market("m1");
        store.upsert_market(&m, t0()).await.unwrap();

        m.question = "Renamed?".to_string();
        m.active = false;
        store.upsert_market(&m, t0() + Duration::minutes(5)).await.unwrap();

        let details = store.market_details("m1").await.unwrap().unwrap();
        assert_eq!(details.market.question, "Renamed?");
        assert!(!details.market.active);
        assert_eq!(details.market.created_at, t0());
        assert_eq!(details.market.updated_at, t0() + Duration::minutes(5));
    }

    #[tokio::test]
    async fn earliest_point_orders_by_time_then_insertion() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_market(&market("m1"), t0()).await.unwrap();

        store
            .insert_price_points(
                "m1",
                &[
                    point(0.30, t0() - Duration::hours(2)),
                    point(0.31, t0() - Duration::hours(2)),
                    point(0.50, t0()),
                ],
            )
            .await
            .unwrap();

        let earliest = store.earliest_point_since("m1", None).await.unwrap().unwrap();
        assert_eq!(earliest.probability, 0.30, "ties resolve to the first inserted");

        let since = store
            .earliest_point_since("m1", Some(t0() - Duration::hours(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(since.probability, 0.50);

        assert!(store
            .earliest_point_since("m1", Some(t0() + Duration::minutes(1)))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.count_price_points("m1").await.unwrap(), 3);
        assert_eq!(store.count_price_points("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn points_require_an_existing_market() {
        let store = SqliteStore::in_memory().await.unwrap();
        let err = store.append_price_point("ghost", &point(0.5, t0())).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn recent_movement_respects_window_and_tier() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_market(&market("m1"), t0()).await.unwrap();
        store
            .insert_movement(&movement("m1", Significance::Major, t0()))
            .await
            .unwrap();

        let since = t0() - Duration::minutes(30);
        assert!(store
            .recent_movement("m1", Significance::Major, since)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .recent_movement("m1", Significance::Minor, since)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .recent_movement("m1", Significance::Major, t0() + Duration::seconds(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn recent_movements_newest_first_with_market() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_market(&market("m1"), t0()).await.unwrap();
        store.upsert_market(&market("m2"), t0()).await.unwrap();
        store
            .insert_movement(&movement("m1", Significance::Minor, t0()))
            .await
            .unwrap();
        store
            .insert_movement(&movement("m2", Significance::Major, t0() + Duration::minutes(1)))
            .await
            .unwrap();
        store
            .insert_movement(&movement("m1", Significance::Major, t0() + Duration::minutes(2)))
            .await
            .unwrap();

        let all = store.recent_movements(10, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].movement.market_id, "m1");
        assert_eq!(all[0].movement.significance, Significance::Major);
        assert_eq!(all[0].market.question, "Question for m1?");
        assert_eq!(all[1].movement.market_id, "m2");

        let majors = store.recent_movements(10, Some(Significance::Major)).await.unwrap();
        assert_eq!(majors.len(), 2);
        assert!(majors.iter().all(|m| m.movement.significance == Significance::Major));

        let limited = store.recent_movements(1, None).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn market_details_caps_and_orders_children() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_market(&market("m1"), t0()).await.unwrap();

        let points: Vec<NewPricePoint> = (0..1005)
            .map(|i| point(0.5, t0() + Duration::seconds(i)))
            .collect();
        store.insert_price_points("m1", &points).await.unwrap();
        for i in 0..12 {
            store
                .insert_movement(&movement("m1", Significance::Minor, t0() + Duration::minutes(i)))
                .await
                .unwrap();
        }

        let details = store.market_details("m1").await.unwrap().unwrap();
        assert_eq!(details.price_history.len(), 1000);
        assert_eq!(details.price_history[0].timestamp, t0() + Duration::seconds(1004));
        assert_eq!(details.movements.len(), 10);
        assert_eq!(details.movements[0].created_at, t0() + Duration::minutes(11));

        assert!(store.market_details("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summary_counts_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_market(&market("m1"), t0()).await.unwrap();
        store.append_price_point("m1", &point(0.5, t0())).await.unwrap();
        store
            .insert_movement(&movement("m1", Significance::Minor, t0() - Duration::hours(30)))
            .await
            .unwrap();
        store
            .insert_movement(&movement("m1", Significance::Major, t0()))
            .await
            .unwrap();

        let s = store.summary(t0()).await.unwrap();
        assert_eq!(s.markets, 1);
        assert_eq!(s.price_points, 1);
        assert_eq!(s.movements, 2);
        assert_eq!(s.movements_24h, 1);
    }
}
