// Data path: source -> table -> cube merge -> schema -> writer
pub mod source;
pub mod table;
pub mod cube;
pub mod schema;
pub mod store;
pub mod writer;

// Orchestration and tooling
pub mod scheduler;
pub mod discovery;
pub mod config;
pub mod metrics;

// Public exports
pub use config::{Config, ConfigError};
pub use cube::{Cube, CubeSet, Query};
pub use scheduler::{CubeError, CubeScheduler};
pub use source::{MetricsSource, PrometheusClient};
pub use store::{ClickHouseStore, CubeStore, MemoryStore};
pub use table::{Table, TableBuilder};
