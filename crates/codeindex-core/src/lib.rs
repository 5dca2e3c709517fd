pub mod config;
pub mod error;
pub mod memory;
pub mod telemetry;
pub mod traits;
pub mod types;

pub use config::{
    BatchingConfig, GraphConfig, LoggingConfig, MetricsConfig, PoolConfig, Settings, VectorConfig,
};
pub use error::*;
pub use memory::MemoryMonitor;
pub use telemetry::init_tracing;
pub use traits::*;
pub use types::*;
