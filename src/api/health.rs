//! Shared collector state for the /health endpoint.
//! Updated by the collector loop, read by the API.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collector::CycleReport;

#[derive(Default)]
pub struct CollectorStats {
    /// True between a start and the matching stop.
    running: AtomicBool,
    cycles_completed: AtomicU64,
    /// Cycles aborted because the market list could not be fetched.
    cycles_source_unavailable: AtomicU64,
    /// Cycles skipped because another was still in flight.
    cycles_skipped: AtomicU64,
    movements_recorded: AtomicU64,
    last_cycle: Mutex<Option<LastCycle>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastCycle {
    pub at: DateTime<Utc>,
    pub report: CycleReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub collector_running: bool,
    pub cycles_completed: u64,
    pub cycles_source_unavailable: u64,
    pub cycles_skipped: u64,
    pub movements_recorded: u64,
    pub last_cycle: Option<LastCycle>,
}

impl CollectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, v: bool) {
        self.running.store(v, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn record_cycle(&self, report: &CycleReport, at: DateTime<Utc>) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.movements_recorded
            .fetch_add(report.movements_recorded as u64, Ordering::Relaxed);
        let mut last = self.last_cycle.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(LastCycle { at, report: report.clone() });
    }

    pub fn record_source_unavailable(&self) {
        self.cycles_source_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last_cycle = self
            .last_cycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        HealthSnapshot {
            collector_running: self.is_running(),
            cycles_completed: self.cycles_completed(),
            cycles_source_unavailable: self.cycles_source_unavailable.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            movements_recorded: self.movements_recorded.load(Ordering::Relaxed),
            last_cycle,
        }
    }
}
