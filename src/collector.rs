use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::health::CollectorStats;
use crate::clock::Clock;
use crate::config::SEED_WINDOW_HOURS;
use crate::db::Store;
use crate::detector::{Detection, MovementDetector};
use crate::error::Result;
use crate::source::{derive_probability, price_to_probability, MarketSource, NormalizedMarket};
use crate::types::NewPricePoint;

/// What the seed step did for one market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /// Market already had stored points; nothing fetched.
    AlreadySeeded,
    Seeded(usize),
    /// Source answered with no usable points.
    NoHistory,
    /// Fetch or insert failed; logged and swallowed.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub markets_fetched: usize,
    pub duplicates_skipped: usize,
    pub unparseable: usize,
    pub markets_processed: usize,
    pub markets_failed: usize,
    pub markets_seeded: usize,
    pub points_seeded: usize,
    /// Probabilities that fell back to the neutral default.
    pub degraded_probabilities: usize,
    pub movements_recorded: usize,
    pub movements_suppressed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Market list fetch failed; nothing was written.
    SourceUnavailable,
    /// Another cycle was still in flight.
    Skipped,
}

/// Result of processing one market inside a cycle.
#[derive(Debug)]
struct MarketOutcome {
    seed: SeedOutcome,
    degraded: bool,
    detection: Detection,
}

/// Runs single polling cycles. Shared between the schedule and tests.
pub struct CycleRunner {
    source: Arc<dyn MarketSource>,
    store: Arc<dyn Store>,
    detector: MovementDetector,
    clock: Arc<dyn Clock>,
    stats: Arc<CollectorStats>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag however the cycle ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CycleRunner {
    pub fn new(
        source: Arc<dyn MarketSource>,
        store: Arc<dyn Store>,
        detector: MovementDetector,
        clock: Arc<dyn Clock>,
        stats: Arc<CollectorStats>,
    ) -> Self {
        Self {
            source,
            store,
            detector,
            clock,
            stats,
            in_flight: AtomicBool::new(false),
        }
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            warn!("Previous collection cycle still running, skipping this tick");
            self.stats.record_skipped();
            return CycleOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        let now = self.clock.now();

        let (markets, fetch_stats) = match self.source.fetch_active_markets().await {
            Ok(r) => r,
            Err(e) => {
                error!("Market fetch failed, cycle aborted: {e}");
                self.stats.record_source_unavailable();
                return CycleOutcome::SourceUnavailable;
            }
        };

        debug!(
            api_total = fetch_stats.api_total,
            gamma = fetch_stats.by_gamma,
            clob = fetch_stats.by_clob,
            unparseable = fetch_stats.unparseable,
            "Market list fetched"
        );

        let mut report = CycleReport {
            markets_fetched: markets.len(),
            unparseable: fetch_stats.unparseable,
            ..Default::default()
        };

        let mut seen: HashSet<&str> = HashSet::with_capacity(markets.len());
        for market in &markets {
            if !seen.insert(market.id.as_str()) {
                report.duplicates_skipped += 1;
                continue;
            }

            match self.process_market(market, now).await {
                Ok(outcome) => {
                    report.markets_processed += 1;
                    if let SeedOutcome::Seeded(n) = outcome.seed {
                        report.markets_seeded += 1;
                        report.points_seeded += n;
                    }
                    if outcome.degraded {
                        report.degraded_probabilities += 1;
                    }
                    match outcome.detection {
                        Detection::Recorded(_) => report.movements_recorded += 1,
                        Detection::Suppressed { significance, change_percent } => {
                            report.movements_suppressed += 1;
                            debug!(
                                market_id = %market.id,
                                %significance,
                                change_percent,
                                "Movement suppressed, {significance} already recorded within the hour"
                            );
                        }
                        Detection::BelowThreshold { change_percent } => {
                            debug!(market_id = %market.id, change_percent, "Change below threshold");
                        }
                        Detection::NoBaseline => {}
                    }
                }
                Err(e) => {
                    report.markets_failed += 1;
                    warn!(market_id = %market.id, "Market processing failed: {e}");
                }
            }
        }

        info!(
            fetched = report.markets_fetched,
            processed = report.markets_processed,
            failed = report.markets_failed,
            seeded = report.markets_seeded,
            recorded = report.movements_recorded,
            suppressed = report.movements_suppressed,
            "Collection cycle complete: {} markets, {} movements recorded, {} suppressed, {} failed",
            report.markets_processed,
            report.movements_recorded,
            report.movements_suppressed,
            report.markets_failed,
        );
        if report.unparseable > 0 || report.duplicates_skipped > 0 || report.degraded_probabilities > 0 {
            info!(
                "[FILTER] unparseable={} duplicates={} degraded_probability={}",
                report.unparseable, report.duplicates_skipped, report.degraded_probabilities,
            );
        }

        self.stats.record_cycle(&report, now);
        CycleOutcome::Completed(report)
    }

    async fn process_market(&self, market: &NormalizedMarket, now: DateTime<Utc>) -> Result<MarketOutcome> {
        self.store.upsert_market(market, now).await?;

        let seed = self.seed(market, now).await?;

        let derived = derive_probability(&market.prices);
        if derived.source.is_degraded() {
            warn!(market_id = %market.id, "No usable price data, using neutral probability");
        } else {
            debug!(market_id = %market.id, probability = derived.value, source = %derived.source, "Probability derived");
        }

        self.store
            .append_price_point(
                &market.id,
                &NewPricePoint {
                    probability: derived.value,
                    volume: Some(market.volume_24h),
                    timestamp: now,
                },
            )
            .await?;

        let detection = self.detector.detect(&market.id, derived.value, now).await?;

        Ok(MarketOutcome {
            seed,
            degraded: derived.source.is_degraded(),
            detection,
        })
    }

    /// Backfill the last day of history for a market with no stored points.
    async fn seed(&self, market: &NormalizedMarket, now: DateTime<Utc>) -> Result<SeedOutcome> {
        if self.store.count_price_points(&market.id).await? > 0 {
            return Ok(SeedOutcome::AlreadySeeded);
        }

        let from = now - chrono::Duration::hours(SEED_WINDOW_HOURS);
        let raw = match self.source.fetch_price_history(market.history_key(), from, now).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(market_id = %market.id, "History seed fetch failed: {e}");
                return Ok(SeedOutcome::Failed);
            }
        };

        let mut points: Vec<NewPricePoint> = raw
            .into_iter()
            .filter_map(|p| {
                Some(NewPricePoint {
                    probability: price_to_probability(p.price)?,
                    volume: None,
                    timestamp: p.timestamp,
                })
            })
            .collect();
        if points.is_empty() {
            return Ok(SeedOutcome::NoHistory);
        }
        points.sort_by_key(|p| p.timestamp);

        match self.store.insert_price_points(&market.id, &points).await {
            Ok(n) => {
                info!(market_id = %market.id, points = n, "Seeded price history");
                Ok(SeedOutcome::Seeded(n))
            }
            Err(e) => {
                warn!(market_id = %market.id, "History seed insert failed: {e}");
                Ok(SeedOutcome::Failed)
            }
        }
    }
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct LoopState {
    running: Option<RunningLoop>,
    /// Loop task told to stop whose last cycle may still be in flight.
    draining: Option<JoinHandle<()>>,
}

/// Stopped / Running state machine around the polling schedule.
pub struct Collector {
    runner: Arc<CycleRunner>,
    poll_interval: Duration,
    state: Mutex<LoopState>,
}

impl Collector {
    pub fn new(runner: CycleRunner, poll_interval: Duration) -> Self {
        Self {
            runner: Arc::new(runner),
            poll_interval,
            state: Mutex::new(LoopState::default()),
        }
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.runner.stats)
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running.is_some()
    }

    /// Spawn the schedule; the first cycle runs immediately, after any cycle
    /// left over from a previous stop has finished. Returns false if already running.
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.running.is_some() {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = Arc::clone(&self.runner);
        let period = self.poll_interval;
        let previous = state.draining.take();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    error!("Previous collector task ended abnormally: {e}");
                }
            }
            run_loop(runner, period, stop_rx).await
        });

        state.running = Some(RunningLoop { stop_tx, handle });
        self.runner.stats.set_running(true);
        info!(interval_secs = period.as_secs(), "Collector started");
        true
    }

    /// Cancel future ticks. An in-flight cycle finishes on its own.
    /// Returns false if already stopped.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.take() else {
            return false;
        };
        let _ = running.stop_tx.send(true);
        // Any older draining task is awaited by this one before it exits.
        state.draining = Some(running.handle);
        self.runner.stats.set_running(false);
        info!("Collector stopped");
        true
    }

    /// Stop and wait for every loop task to exit.
    pub async fn shutdown(&self) {
        let (running, draining) = {
            let mut state = self.state.lock().await;
            (state.running.take(), state.draining.take())
        };
        if let Some(running) = running {
            let _ = running.stop_tx.send(true);
            self.runner.stats.set_running(false);
            if let Err(e) = running.handle.await {
                error!("Collector task ended abnormally: {e}");
            }
            info!("Collector shut down");
        }
        if let Some(draining) = draining {
            if let Err(e) = draining.await {
                error!("Collector task ended abnormally: {e}");
            }
        }
    }
}

async fn run_loop(runner: Arc<CycleRunner>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }
        if *stop_rx.borrow() {
            break;
        }
        runner.run_cycle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::db::{SqliteStore, Store};
    use crate::error::AppError;
    use crate::source::{FetchStats, OutcomePrice, PriceData, RawPricePoint};
    use crate::types::Significance;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::Mutex as StdMutex;

    /// Scripted upstream.
    #[derive(Default)]
    struct FakeSource {
        markets: StdMutex<Vec<NormalizedMarket>>,
        history: StdMutex<HashMap<String, Vec<RawPricePoint>>>,
        failing_history: StdMutex<HashSet<String>>,
        list_down: AtomicBool,
        history_calls: AtomicUsize,
        list_delay_ms: AtomicU64,
    }

    impl FakeSource {
        fn set_markets(&self, markets: Vec<NormalizedMarket>) {
            *self.markets.lock().unwrap() = markets;
        }
    }

    #[async_trait]
    impl MarketSource for FakeSource {
        async fn fetch_active_markets(&self) -> Result<(Vec<NormalizedMarket>, FetchStats)> {
            let delay = self.list_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.list_down.load(Ordering::SeqCst) {
                return Err(AppError::Upstream { status: 503, body: "down".to_string() });
            }
            let markets = self.markets.lock().unwrap().clone();
            let stats = FetchStats { api_total: markets.len(), ..Default::default() };
            Ok((markets, stats))
        }

        async fn fetch_price_history(
            &self,
            history_key: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<RawPricePoint>> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_history.lock().unwrap().contains(history_key) {
                return Err(AppError::Upstream { status: 500, body: "boom".to_string() });
            }
            Ok(self
                .history
                .lock()
                .unwrap()
                .get(history_key)
                .map(|pts| {
                    pts.iter()
                        .filter(|p| p.timestamp >= from && p.timestamp <= to)
                        .copied()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn t() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn binary_market(id: &str, yes: f64) -> NormalizedMarket {
        NormalizedMarket {
            id: id.to_string(),
            question: format!("{id}?"),
            description: None,
            category: None,
            end_date: None,
            active: true,
            volume_24h: 5000.0,
            prices: PriceData {
                tokens: vec![
                    OutcomePrice {
                        outcome: "Yes".to_string(),
                        price: yes,
                        token_id: Some(format!("{id}-yes")),
                    },
                    OutcomePrice {
                        outcome: "No".to_string(),
                        price: 1.0 - yes,
                        token_id: Some(format!("{id}-no")),
                    },
                ],
                outcome_prices: Vec::new(),
            },
            history_token: Some(format!("{id}-yes")),
        }
    }

    struct Harness {
        source: Arc<FakeSource>,
        store: Arc<SqliteStore>,
        clock: Arc<ManualClock>,
        stats: Arc<CollectorStats>,
    }

    impl Harness {
        async fn new() -> Self {
            Self {
                source: Arc::new(FakeSource::default()),
                store: Arc::new(SqliteStore::in_memory().await.unwrap()),
                clock: Arc::new(ManualClock::new(t())),
                stats: Arc::new(CollectorStats::new()),
            }
        }

        fn runner(&self) -> CycleRunner {
            let store: Arc<dyn Store> = self.store.clone();
            CycleRunner::new(
                self.source.clone(),
                store.clone(),
                MovementDetector::new(store, 10.0, 60),
                self.clock.clone(),
                self.stats.clone(),
            )
        }
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(r) => r,
            other => panic!("expected a completed cycle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn three_cycles_record_suppress_then_record_again() {
        let h = Harness::new().await;
        let hist = [(23, 0.45), (18, 0.45), (12, 0.46), (6, 0.44), (1, 0.45)]
            .iter()
            .map(|&(hours, price)| RawPricePoint { timestamp: t() - ChronoDuration::hours(hours), price })
            .collect();
        h.source.history.lock().unwrap().insert("m1-yes".to_string(), hist);
        h.source.set_markets(vec![binary_market("m1", 0.65)]);
        let runner = h.runner();

        // Cycle 1: seeded, +44% against the T-23h point.
        let r1 = completed(runner.run_cycle().await);
        assert_eq!(r1.markets_seeded, 1);
        assert_eq!(r1.points_seeded, 5);
        assert_eq!(r1.movements_recorded, 1);

        // Cycle 2: still major, inside the dedup window.
        h.clock.advance(ChronoDuration::minutes(10));
        h.source.set_markets(vec![binary_market("m1", 0.66)]);
        let r2 = completed(runner.run_cycle().await);
        assert_eq!(r2.markets_seeded, 0);
        assert_eq!(r2.movements_recorded, 0);
        assert_eq!(r2.movements_suppressed, 1);

        // Cycle 3: two hours later, baseline slides to the T-18h point.
        h.clock.advance(ChronoDuration::minutes(110));
        h.source.set_markets(vec![binary_market("m1", 0.70)]);
        let r3 = completed(runner.run_cycle().await);
        assert_eq!(r3.movements_recorded, 1);

        let movements = h.store.recent_movements(10, None).await.unwrap();
        assert_eq!(movements.len(), 2);
        let latest = &movements[0].movement;
        assert_eq!(latest.significance, Significance::Major);
        assert_eq!(latest.start_price, 0.45);
        assert_eq!(latest.start_time, t() - ChronoDuration::hours(18));
        assert_eq!(latest.end_price, 0.70);
        assert!((latest.change_percent - (0.70 - 0.45) / 0.45 * 100.0).abs() < 1e-9);

        assert_eq!(h.store.count_price_points("m1").await.unwrap(), 8);
        assert_eq!(h.source.history_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.stats.cycles_completed(), 3);
    }

    #[tokio::test]
    async fn seeding_is_a_no_op_once_points_exist() {
        let h = Harness::new().await;
        h.source.history.lock().unwrap().insert(
            "m1-yes".to_string(),
            vec![RawPricePoint { timestamp: t() - ChronoDuration::hours(2), price: 50.0 }],
        );
        let runner = h.runner();
        let m = binary_market("m1", 0.5);
        h.store.upsert_market(&m, t()).await.unwrap();

        assert_eq!(runner.seed(&m, t()).await.unwrap(), SeedOutcome::Seeded(1));
        assert_eq!(runner.seed(&m, t()).await.unwrap(), SeedOutcome::AlreadySeeded);
        assert_eq!(h.store.count_price_points("m1").await.unwrap(), 1);

        // Percentage-scale history is converted on the way in.
        let p = h.store.earliest_point_since("m1", None).await.unwrap().unwrap();
        assert_eq!(p.probability, 0.5);
    }

    #[tokio::test]
    async fn empty_history_is_reported() {
        let h = Harness::new().await;
        let runner = h.runner();
        let m = binary_market("m1", 0.5);
        h.store.upsert_market(&m, t()).await.unwrap();
        assert_eq!(runner.seed(&m, t()).await.unwrap(), SeedOutcome::NoHistory);
    }

    #[tokio::test]
    async fn source_failure_aborts_only_that_cycle() {
        let h = Harness::new().await;
        h.source.set_markets(vec![binary_market("m1", 0.4)]);
        h.source.list_down.store(true, Ordering::SeqCst);
        let runner = h.runner();

        assert_eq!(runner.run_cycle().await, CycleOutcome::SourceUnavailable);
        assert_eq!(h.store.summary(t()).await.unwrap().markets, 0);

        h.source.list_down.store(false, Ordering::SeqCst);
        let report = completed(runner.run_cycle().await);
        assert_eq!(report.markets_processed, 1);

        let snap = h.stats.snapshot();
        assert_eq!(snap.cycles_source_unavailable, 1);
        assert_eq!(snap.cycles_completed, 1);
    }

    #[tokio::test]
    async fn history_failure_for_one_market_is_not_fatal() {
        let h = Harness::new().await;
        h.source.failing_history.lock().unwrap().insert("bad-yes".to_string());
        h.source.history.lock().unwrap().insert(
            "good-yes".to_string(),
            vec![RawPricePoint { timestamp: t() - ChronoDuration::hours(3), price: 0.5 }],
        );
        h.source.set_markets(vec![binary_market("bad", 0.5), binary_market("good", 0.5)]);

        let report = completed(h.runner().run_cycle().await);
        assert_eq!(report.markets_processed, 2);
        assert_eq!(report.markets_failed, 0);
        assert_eq!(report.markets_seeded, 1);
        assert_eq!(h.store.count_price_points("bad").await.unwrap(), 1);
        assert_eq!(h.store.count_price_points("good").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicates_and_degraded_prices_are_counted() {
        let h = Harness::new().await;
        let mut blank = binary_market("blank", 0.5);
        blank.prices = PriceData::default();
        h.source.set_markets(vec![
            binary_market("m1", 0.3),
            binary_market("m1", 0.9),
            blank,
        ]);

        let report = completed(h.runner().run_cycle().await);
        assert_eq!(report.markets_fetched, 3);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(report.markets_processed, 2);
        assert_eq!(report.degraded_probabilities, 1);

        // First occurrence wins.
        let p = h.store.earliest_point_since("m1", None).await.unwrap().unwrap();
        assert_eq!(p.probability, 0.3);
        let neutral = h.store.earliest_point_since("blank", None).await.unwrap().unwrap();
        assert_eq!(neutral.probability, 0.5);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let h = Harness::new().await;
        let runner = h.runner();
        runner.in_flight.store(true, Ordering::SeqCst);
        assert_eq!(runner.run_cycle().await, CycleOutcome::Skipped);
        assert_eq!(h.stats.snapshot().cycles_skipped, 1);

        runner.in_flight.store(false, Ordering::SeqCst);
        assert!(matches!(runner.run_cycle().await, CycleOutcome::Completed(_)));
        assert!(!runner.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let h = Harness::new().await;
        h.source.set_markets(vec![binary_market("m1", 0.5)]);
        let collector = Collector::new(h.runner(), Duration::from_secs(3600));

        assert!(!collector.is_running().await);
        assert!(collector.start().await);
        assert!(!collector.start().await);
        assert!(collector.is_running().await);
        assert!(collector.stats().is_running());

        // First cycle runs without waiting for the interval.
        for _ in 0..200 {
            if collector.stats().cycles_completed() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(collector.stats().cycles_completed(), 1);

        assert!(collector.stop().await);
        assert!(!collector.stop().await);
        assert!(!collector.stats().is_running());

        assert!(collector.start().await);
        collector.shutdown().await;
        assert!(!collector.is_running().await);
    }

    #[tokio::test]
    async fn restart_during_a_slow_cycle_still_runs_its_first_cycle() {
        let h = Harness::new().await;
        h.source.set_markets(vec![binary_market("m1", 0.5)]);
        h.source.list_delay_ms.store(300, Ordering::SeqCst);
        let collector = Collector::new(h.runner(), Duration::from_secs(3600));

        assert!(collector.start().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(collector.stop().await);
        assert!(collector.start().await);

        for _ in 0..300 {
            if collector.stats().cycles_completed() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = collector.stats().snapshot();
        assert_eq!(snap.cycles_completed, 2);
        assert_eq!(snap.cycles_skipped, 0);

        collector.shutdown().await;
        assert!(!collector.is_running().await);
    }
}
