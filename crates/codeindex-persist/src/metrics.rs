use chrono::{DateTime, Duration as ChronoDuration, Utc};
use codeindex_core::{
    Alert, AlertCategory, AggregateStats, BatchKind, MemoryProbe, MetricsConfig, Result, Severity,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-operation record. Throughput and error rate are derived at `end`,
/// never before. Invariant: `success_count + error_count <= processed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub id: Uuid,
    pub kind: BatchKind,
    pub batch_size: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: f64,
    pub processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub retry_count: u64,
    pub memory_start: u64,
    pub memory_end: u64,
    pub memory_peak: u64,
    pub throughput: f64,
    pub error_rate: f64,
    pub success: bool,
    pub timed_out: bool,
}

/// Partial progress merged into an in-flight record by `update`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressDelta {
    pub processed: u64,
    pub success: u64,
    pub error: u64,
    pub retry: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Records every batch operation, derives percentile statistics over a
/// bounded history, and raises threshold-based alerts.
pub struct MetricsCollector {
    config: MetricsConfig,
    memory: Arc<dyn MemoryProbe>,
    in_flight: DashMap<Uuid, OperationMetrics>,
    history: RwLock<VecDeque<OperationMetrics>>,
    alerts: RwLock<Vec<Alert>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig, memory: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            memory,
            in_flight: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            alerts: RwLock::new(Vec::new()),
        }
    }

    pub fn start(&self, id: Uuid, kind: BatchKind, batch_size: usize) {
        let memory_now = self.memory.used_bytes();
        let record = OperationMetrics {
            id,
            kind,
            batch_size,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0.0,
            processed: 0,
            success_count: 0,
            error_count: 0,
            retry_count: 0,
            memory_start: memory_now,
            memory_end: 0,
            memory_peak: memory_now,
            throughput: 0.0,
            error_rate: 0.0,
            success: false,
            timed_out: false,
        };
        self.in_flight.insert(id, record);
        debug!(%id, %kind, batch_size, "operation started");
    }

    pub fn update(&self, id: Uuid, delta: ProgressDelta) {
        let Some(mut record) = self.in_flight.get_mut(&id) else {
            return;
        };
        record.processed += delta.processed;
        record.success_count += delta.success;
        record.error_count += delta.error;
        record.retry_count += delta.retry;

        let counted = record.success_count + record.error_count;
        if counted > record.processed {
            record.processed = counted;
        }

        let memory_now = self.memory.used_bytes();
        if memory_now > record.memory_peak {
            record.memory_peak = memory_now;
        }
    }

    /// Flags the record so `end` emits the unconditional timeout alert.
    pub fn mark_timeout(&self, id: Uuid) {
        if let Some(mut record) = self.in_flight.get_mut(&id) {
            record.timed_out = true;
        }
    }

    pub fn end(&self, id: Uuid, success: bool) -> Option<OperationMetrics> {
        let (_, mut record) = self.in_flight.remove(&id)?;
        let ended = Utc::now();
        record.ended_at = Some(ended);
        record.duration_ms = (ended - record.started_at)
            .num_microseconds()
            .unwrap_or(i64::MAX) as f64
            / 1_000.0;
        record.memory_end = self.memory.used_bytes();
        if record.memory_end > record.memory_peak {
            record.memory_peak = record.memory_end;
        }
        record.success = success;
        record.throughput = if record.duration_ms > 0.0 {
            record.processed as f64 / (record.duration_ms / 1_000.0)
        } else {
            0.0
        };
        record.error_rate = if record.processed > 0 {
            record.error_count as f64 / record.processed as f64
        } else {
            0.0
        };

        self.check_thresholds(&record);

        {
            let mut history = self.history.write();
            history.push_back(record.clone());
            while history.len() > self.config.history_cap {
                history.pop_front();
            }
        }
        debug!(%id, duration_ms = record.duration_ms, success, "operation ended");
        Some(record)
    }

    fn check_thresholds(&self, record: &OperationMetrics) {
        let mut raised = Vec::new();

        if record.duration_ms > self.config.high_latency_ms {
            let severity = if record.duration_ms > self.config.high_latency_ms * 2.0 {
                Severity::High
            } else {
                Severity::Medium
            };
            raised.push(Alert::new(
                AlertCategory::Performance,
                severity,
                format!(
                    "{} operation took {:.0}ms (threshold {:.0}ms)",
                    record.kind, record.duration_ms, self.config.high_latency_ms
                ),
                Some(record.id),
            ));
        }

        if record.processed > 0 && record.throughput < self.config.low_throughput_ops {
            raised.push(Alert::new(
                AlertCategory::Performance,
                Severity::Medium,
                format!(
                    "throughput {:.2} ops/s below {:.2} ops/s",
                    record.throughput, self.config.low_throughput_ops
                ),
                Some(record.id),
            ));
        }

        if record.error_rate > self.config.high_error_rate {
            let severity = if record.error_rate > self.config.high_error_rate * 2.0 {
                Severity::Critical
            } else {
                Severity::High
            };
            raised.push(Alert::new(
                AlertCategory::Error,
                severity,
                format!(
                    "error rate {:.1}% above {:.1}%",
                    record.error_rate * 100.0,
                    self.config.high_error_rate * 100.0
                ),
                Some(record.id),
            ));
        }

        let total = self.memory.total_bytes();
        if total > 0 {
            let peak_percent = record.memory_peak as f64 / total as f64 * 100.0;
            if peak_percent > self.config.high_memory_percent {
                let severity = if peak_percent > self.config.critical_memory_percent {
                    Severity::High
                } else {
                    Severity::Medium
                };
                raised.push(Alert::new(
                    AlertCategory::Memory,
                    severity,
                    format!(
                        "peak memory {:.1}% above {:.1}%",
                        peak_percent, self.config.high_memory_percent
                    ),
                    Some(record.id),
                ));
            }
        }

        if record.timed_out {
            raised.push(Alert::new(
                AlertCategory::Timeout,
                Severity::High,
                format!("{} operation timed out", record.kind),
                Some(record.id),
            ));
        }

        if raised.is_empty() {
            return;
        }
        let mut alerts = self.alerts.write();
        for alert in raised {
            warn!(
                category = %alert.category,
                severity = %alert.severity,
                message = %alert.message,
                "alert raised"
            );
            alerts.push(alert);
        }
    }

    /// Records an out-of-band alert (e.g. a chunk failure reported by the
    /// orchestrator) so dashboards see the same failures callers see.
    pub fn record_alert(&self, alert: Alert) {
        self.alerts.write().push(alert);
    }

    /// Aggregate statistics over completed operations within the lookback
    /// window (all of history when `None`).
    pub fn stats(&self, lookback: Option<Duration>) -> AggregateStats {
        let cutoff = lookback
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .map(|d| Utc::now() - d);

        let history = self.history.read();
        let selected: Vec<&OperationMetrics> = history
            .iter()
            .filter(|m| match cutoff {
                Some(cutoff) => m.started_at >= cutoff,
                None => true,
            })
            .collect();

        if selected.is_empty() {
            return AggregateStats::default();
        }

        let mut durations: Vec<f64> = selected.iter().map(|m| m.duration_ms).collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = selected.len();
        let total_processed: u64 = selected.iter().map(|m| m.processed).sum();
        let total_memory_delta: u64 = selected
            .iter()
            .map(|m| m.memory_end.saturating_sub(m.memory_start))
            .sum();

        AggregateStats {
            operation_count: count,
            mean_latency_ms: durations.iter().sum::<f64>() / count as f64,
            p95_latency_ms: nearest_rank(&durations, 95.0),
            p99_latency_ms: nearest_rank(&durations, 99.0),
            mean_throughput: selected.iter().map(|m| m.throughput).sum::<f64>() / count as f64,
            mean_error_rate: selected.iter().map(|m| m.error_rate).sum::<f64>() / count as f64,
            memory_efficiency: if total_memory_delta > 0 {
                total_processed as f64 / total_memory_delta as f64
            } else {
                0.0
            },
        }
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let alerts = self.alerts.read();
        alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    pub fn export(&self, format: ExportFormat) -> Result<String> {
        let history = self.history.read();
        match format {
            ExportFormat::Json => {
                let records: Vec<&OperationMetrics> = history.iter().collect();
                Ok(serde_json::to_string_pretty(&records)?)
            }
            ExportFormat::Csv => {
                let mut out = String::from(
                    "id,kind,batch_size,started_at,duration_ms,processed,success_count,\
                     error_count,retry_count,throughput,error_rate,success,timed_out\n",
                );
                for m in history.iter() {
                    let _ = writeln!(
                        out,
                        "{},{},{},{},{:.3},{},{},{},{},{:.3},{:.4},{},{}",
                        m.id,
                        m.kind,
                        m.batch_size,
                        m.started_at.to_rfc3339(),
                        m.duration_ms,
                        m.processed,
                        m.success_count,
                        m.error_count,
                        m.retry_count,
                        m.throughput,
                        m.error_rate,
                        m.success,
                        m.timed_out
                    );
                }
                Ok(out)
            }
        }
    }

    /// Drops history entries and alerts older than the retention window.
    /// Returns the number of removed items.
    pub fn cleanup(&self) -> usize {
        let retention = match ChronoDuration::from_std(self.config.retention_window()) {
            Ok(d) => d,
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - retention;

        let mut removed = 0;
        {
            let mut history = self.history.write();
            let before = history.len();
            history.retain(|m| m.started_at >= cutoff);
            removed += before - history.len();
        }
        {
            let mut alerts = self.alerts.write();
            let before = alerts.len();
            alerts.retain(|a| a.timestamp >= cutoff);
            removed += before - alerts.len();
        }
        if removed > 0 {
            info!(removed, "pruned stale metrics");
        }
        removed
    }

    /// Spawns the low-priority retention task. The handle stops it without
    /// blocking shutdown and never keeps the process alive on its own.
    pub fn spawn_cleanup(self: &Arc<Self>) -> CleanupHandle {
        let collector = Arc::clone(self);
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stopped);
        let interval = self.config.interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }
                collector.cleanup();
            }
        });

        CleanupHandle { handle, stopped }
    }
}

pub struct CleanupHandle {
    handle: tokio::task::JoinHandle<()>,
    stopped: Arc<AtomicBool>,
}

impl CleanupHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.handle.abort();
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Nearest-rank percentile: sort ascending, `index = ceil(p/100 * n) - 1`,
/// clamped to `[0, n-1]`.
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let index = ((percentile / 100.0 * n as f64).ceil() as usize).saturating_sub(1);
    sorted[index.min(n - 1)]
}
