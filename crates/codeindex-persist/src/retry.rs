use crate::sizer::BatchSizer;
use codeindex_core::{PersistenceError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Wraps a fallible operation with bounded retries and an overall wall-clock
/// deadline. The deadline wins over remaining attempts: one slow attempt can
/// exhaust the whole budget. Outcomes feed the sizer's failure history.
pub struct RetryOrchestrator {
    sizer: Arc<BatchSizer>,
}

impl RetryOrchestrator {
    pub fn new(sizer: Arc<BatchSizer>) -> Self {
        Self { sizer }
    }

    pub async fn execute<T, F, Fut>(
        &self,
        label: &str,
        batch_size: usize,
        max_attempts: u32,
        overall_timeout: Duration,
        op: F,
    ) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome =
            tokio::time::timeout(overall_timeout, self.run_attempts(label, max_attempts, op))
                .await;

        match outcome {
            Ok(Ok(value)) => {
                self.sizer.record_success(batch_size);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.sizer.record_failure();
                Err(e)
            }
            Err(_) => {
                self.sizer.record_failure();
                warn!(label, ?overall_timeout, "operation exceeded deadline");
                Err(PersistenceError::OperationTimeout(format!(
                    "{} exceeded {:?}",
                    label, overall_timeout
                )))
            }
        }
    }

    async fn run_attempts<T, F, Fut>(&self, label: &str, max_attempts: u32, op: F) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        loop {
            match op(failures).await {
                Ok(value) => {
                    if failures > 0 {
                        debug!(label, failures, "operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    failures += 1;
                    warn!(label, attempt = failures, error = %e, "batch attempt failed");
                    let decision = self.sizer.should_retry(failures);
                    if failures >= max_attempts || !decision.retry || !e.is_transient() {
                        return Err(e);
                    }
                    tokio::time::sleep(decision.delay).await;
                }
            }
        }
    }
}
