pub mod clickhouse;
mod error;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::table::CellValue;

pub use self::clickhouse::ClickHouseStore;
pub use self::error::StoreError;
pub use self::memory::MemoryStore;

/// One result row keyed by column name.
pub type StoreRow = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Schema change requested from a store.
///
/// Stores lower these to their own dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlOp {
    /// Time-ordered table holding `columns` in order.
    CreateTable {
        table: String,
        columns: Vec<ColumnInfo>,
    },
    AddColumn {
        table: String,
        column: ColumnInfo,
    },
    /// Creates `view` over `select`, replacing an older definition.
    CreateView { view: String, select: String },
    /// Drops `name` if present.
    Drop { name: String, kind: ObjectKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
}

/// Rows collected client-side and shipped to the store in one request.
#[async_trait]
pub trait InsertBatch: Send {
    /// Adds one row; `values` must follow the batch's column order.
    fn append(&mut self, values: Vec<CellValue>) -> Result<(), StoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn send(self: Box<Self>) -> Result<(), StoreError>;
}

/// Connection to the columnar store that receives cube data.
#[async_trait]
pub trait CubeStore: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError>;

    async fn apply(&self, op: &DdlOp) -> Result<(), StoreError>;

    async fn prepare_batch(
        &self,
        table: &str,
        columns: &[String],
    ) -> Result<Box<dyn InsertBatch>, StoreError>;
}

/// Runs one store call under `deadline`.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
}

/// Back-quotes an identifier for use in SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}
