//! Session run statistics.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::pool::ArenaPoolStats;

/// Aggregated statistics for a session.
#[derive(Debug, Clone)]
pub struct SessionStatistics {
    /// Total number of runs attempted.
    pub total_runs: u64,
    /// Runs that returned an error.
    pub failed_runs: u64,
    /// Total run time in microseconds.
    pub total_run_time_us: u64,
    /// Average run time in milliseconds.
    pub average_run_time_ms: f64,
    /// Fastest run in microseconds.
    pub min_run_time_us: Option<u64>,
    /// Slowest run in microseconds.
    pub max_run_time_us: Option<u64>,
    /// Arena pool counters at the time of the snapshot.
    pub arena_pool: ArenaPoolStats,
    /// Session creation time.
    pub created_at: Instant,
    /// End of the most recent run.
    pub last_run_at: Option<Instant>,
}

impl Default for SessionStatistics {
    fn default() -> Self {
        Self {
            total_runs: 0,
            failed_runs: 0,
            total_run_time_us: 0,
            average_run_time_ms: 0.0,
            min_run_time_us: None,
            max_run_time_us: None,
            arena_pool: ArenaPoolStats::default(),
            created_at: Instant::now(),
            last_run_at: None,
        }
    }
}

impl SessionStatistics {
    /// Fraction of runs that failed.
    pub fn failure_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            self.failed_runs as f64 / self.total_runs as f64
        }
    }
}

/// Thread-safe accumulator behind [`SessionStatistics`].
#[derive(Debug, Default)]
pub(crate) struct StatisticsRecorder {
    inner: Mutex<SessionStatistics>,
}

impl StatisticsRecorder {
    pub(crate) fn record(&self, elapsed: Duration, success: bool) {
        let mut stats = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);

        stats.total_runs += 1;
        if !success {
            stats.failed_runs += 1;
        }
        stats.total_run_time_us = stats.total_run_time_us.saturating_add(us);
        stats.average_run_time_ms = stats.total_run_time_us as f64 / stats.total_runs as f64 / 1000.0;
        stats.min_run_time_us = Some(stats.min_run_time_us.map_or(us, |m| m.min(us)));
        stats.max_run_time_us = Some(stats.max_run_time_us.map_or(us, |m| m.max(us)));
        stats.last_run_at = Some(Instant::now());
    }

    pub(crate) fn snapshot(&self, arena_pool: ArenaPoolStats) -> SessionStatistics {
        let mut stats = self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.arena_pool = arena_pool;
        stats
    }
}
