use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of the most recent cycles of one cube.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CubeStatus {
    /// Unix seconds of the last successful cycle.
    pub last_update: Option<i64>,
    /// Rows written to the cube table by the last successful cycle.
    pub rows_written: usize,
    /// Rows carrying the ambiguity marker after the last merge.
    pub ambiguous_rows: usize,
    /// Error of the last cycle, `None` once a cycle succeeds again.
    pub last_error: Option<String>,
    pub failed_cycles: u64,
}

pub type SharedCubeStatus = Arc<Mutex<HashMap<String, CubeStatus>>>;
