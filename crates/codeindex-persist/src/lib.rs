pub mod metrics;
pub mod orchestrator;
pub mod plan;
pub mod pool;
pub mod retry;
pub mod sizer;

pub use metrics::{CleanupHandle, ExportFormat, MetricsCollector, OperationMetrics, ProgressDelta};
pub use orchestrator::PersistenceOrchestrator;
pub use plan::{chunk_primitives, file_node_id, plan_delete, plan_store, plan_update};
pub use pool::{PoolMonitor, PoolStats, PooledSession, ResourcePool};
pub use retry::RetryOrchestrator;
pub use sizer::{BatchSizer, RetryDecision};
