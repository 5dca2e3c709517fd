use codeindex_core::BatchingConfig;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

const ROLLING_WINDOW: usize = 10;
const FAILURE_PENALTY_PER_STEP: f64 = 0.2;
const FAILURE_PENALTY_FLOOR: f64 = 0.3;
const GROWTH_FACTOR: f64 = 1.5;
const MAX_JITTER_FRACTION: f64 = 0.1;

/// Verdict from the retry policy: whether another attempt is allowed and how
/// long to back off before it.
#[derive(Debug, Clone, Copy)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

#[derive(Debug, Default)]
struct SizingState {
    recent_sizes: VecDeque<usize>,
    consecutive_failures: u32,
}

impl SizingState {
    fn rolling_average(&self) -> Option<usize> {
        if self.recent_sizes.is_empty() {
            return None;
        }
        let sum: usize = self.recent_sizes.iter().sum();
        Some(sum / self.recent_sizes.len())
    }
}

/// Feedback-control heuristic for chunk sizing. Reads memory pressure and
/// recent failure history; guarantees the result never leaves
/// `[1, min(max_batch_size, total_items)]`.
pub struct BatchSizer {
    config: BatchingConfig,
    state: Mutex<SizingState>,
}

impl BatchSizer {
    pub fn new(config: BatchingConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SizingState::default()),
        }
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    pub fn next_batch_size(&self, total_items: usize, memory_percent: Option<f64>) -> usize {
        if total_items == 0 {
            return 0;
        }

        let mut candidate = self
            .config
            .default_batch_size
            .clamp(self.config.min_batch_size.min(total_items), total_items);

        if let Some(mem) = memory_percent {
            if mem > self.config.memory_threshold_percent {
                candidate = (candidate / 2).max(self.config.min_batch_size.min(total_items));
            } else if mem < self.config.low_memory_percent {
                candidate = ((candidate as f64 * GROWTH_FACTOR) as usize)
                    .min(self.config.max_batch_size);
            }
        }

        let state = self.state.lock();
        if let Some(avg) = state.rolling_average() {
            candidate = candidate.min(avg);
        }

        let failures = state.consecutive_failures;
        drop(state);
        if failures > 0 {
            let penalty = (1.0 - FAILURE_PENALTY_PER_STEP * failures as f64)
                .max(FAILURE_PENALTY_FLOOR);
            candidate = (candidate as f64 * penalty) as usize;
        }

        let size = candidate.clamp(1, self.config.max_batch_size.min(total_items));
        debug!(
            total_items,
            memory_percent = ?memory_percent,
            failures,
            size,
            "computed next batch size"
        );
        size
    }

    /// Exponential backoff with up to 10% positive jitter. Retries are
    /// allowed while the failure count stays below the configured budget.
    pub fn should_retry(&self, failure_count: u32) -> RetryDecision {
        let retry = failure_count < self.config.retry_attempts;
        let exponent = failure_count.min(16);
        let base = self.config.retry_delay().as_secs_f64() * 2f64.powi(exponent as i32);
        let jitter = 1.0 + rand::rng().random::<f64>() * MAX_JITTER_FRACTION;
        RetryDecision {
            retry,
            delay: Duration::from_secs_f64(base * jitter),
        }
    }

    /// A successful batch feeds the rolling window and walks the failure
    /// counter back toward zero.
    pub fn record_success(&self, batch_size: usize) {
        let mut state = self.state.lock();
        state.recent_sizes.push_back(batch_size);
        while state.recent_sizes.len() > ROLLING_WINDOW {
            state.recent_sizes.pop_front();
        }
        state.consecutive_failures = state.consecutive_failures.saturating_sub(1);
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }
}
