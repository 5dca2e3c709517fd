use crate::MemoryProbe;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use sysinfo::System;

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

struct MonitorInner {
    system: System,
    last_refresh: Instant,
    used: u64,
    total: u64,
}

/// System memory monitor with throttled refresh so that hot paths reading
/// the pressure level do not hammer procfs.
pub struct MemoryMonitor {
    inner: Mutex<MonitorInner>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let used = system.used_memory();
        let total = system.total_memory();
        Self {
            inner: Mutex::new(MonitorInner {
                system,
                last_refresh: Instant::now(),
                used,
                total,
            }),
        }
    }

    fn snapshot(&self) -> (u64, u64) {
        let mut inner = self.inner.lock();
        if inner.last_refresh.elapsed() >= MIN_REFRESH_INTERVAL {
            inner.system.refresh_memory();
            inner.used = inner.system.used_memory();
            inner.total = inner.system.total_memory();
            inner.last_refresh = Instant::now();
        }
        (inner.used, inner.total)
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for MemoryMonitor {
    fn used_percent(&self) -> f64 {
        let (used, total) = self.snapshot();
        if total == 0 {
            return 0.0;
        }
        used as f64 / total as f64 * 100.0
    }

    fn used_bytes(&self) -> u64 {
        self.snapshot().0
    }

    fn total_bytes(&self) -> u64 {
        self.snapshot().1
    }
}
