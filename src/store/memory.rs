//! In-process store applying schema changes to plain maps.
//!
//! Backs `run --dry-run` and the test suite.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ColumnInfo, CubeStore, DdlOp, InsertBatch, ObjectKind, StoreError, StoreRow};
use crate::table::CellValue;

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<StoreRow>,
    pub is_view: bool,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, MemoryTable>,
    applied: Vec<DdlOp>,
    batches_sent: usize,
    fail_ddl: bool,
    fail_send_after: Option<usize>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::ServerError("memory store lock poisoned".to_string()))
    }

    /// Every schema change applied so far, in order.
    pub fn applied(&self) -> Vec<DdlOp> {
        self.lock().map(|s| s.applied.clone()).unwrap_or_default()
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.lock().ok().and_then(|s| s.tables.get(name).cloned())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn batches_sent(&self) -> usize {
        self.lock().map(|s| s.batches_sent).unwrap_or(0)
    }

    /// Makes every following schema change fail.
    pub fn fail_ddl(&self, fail: bool) {
        if let Ok(mut s) = self.lock() {
            s.fail_ddl = fail;
        }
    }

    /// Lets `sent` more batches through, then fails every send.
    pub fn fail_send_after(&self, sent: Option<usize>) {
        if let Ok(mut s) = self.lock() {
            let base = s.batches_sent;
            s.fail_send_after = sent.map(|n| base + n);
        }
    }

    /// Creates a table without recording a schema change.
    pub fn seed_table(&self, name: &str, columns: Vec<ColumnInfo>) {
        if let Ok(mut s) = self.lock() {
            s.tables.insert(
                name.to_string(),
                MemoryTable {
                    columns,
                    rows: Vec::new(),
                    is_view: false,
                },
            );
        }
    }
}

fn apply_op(state: &mut State, op: &DdlOp) -> Result<(), StoreError> {
    match op {
        DdlOp::CreateTable { table, columns } => {
            if state.tables.contains_key(table) {
                return Err(StoreError::TableAlreadyExists(table.clone()));
            }
            state.tables.insert(
                table.clone(),
                MemoryTable {
                    columns: columns.clone(),
                    rows: Vec::new(),
                    is_view: false,
                },
            );
        }
        DdlOp::AddColumn { table, column } => {
            let existing = state
                .tables
                .get_mut(table)
                .ok_or_else(|| StoreError::TableNotFound(table.clone()))?;
            if existing.columns.iter().any(|c| c.name == column.name) {
                return Err(StoreError::ServerError(format!(
                    "column {} already exists in {}",
                    column.name, table
                )));
            }
            existing.columns.push(column.clone());
        }
        // The select text is not evaluated; views only need to exist here.
        DdlOp::CreateView { view, .. } => {
            state.tables.insert(
                view.clone(),
                MemoryTable {
                    columns: Vec::new(),
                    rows: Vec::new(),
                    is_view: true,
                },
            );
        }
        DdlOp::Drop { name, kind } => {
            let matches = state
                .tables
                .get(name)
                .map(|t| t.is_view == (*kind == ObjectKind::View))
                .unwrap_or(false);
            if matches {
                state.tables.remove(name);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl CubeStore for MemoryStore {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.tables.contains_key(table))
    }

    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        self.lock()?
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    async fn apply(&self, op: &DdlOp) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.fail_ddl {
            return Err(StoreError::ServerError(format!("injected DDL failure: {op:?}")));
        }
        apply_op(&mut state, op)?;
        state.applied.push(op.clone());
        Ok(())
    }

    async fn prepare_batch(
        &self,
        table: &str,
        columns: &[String],
    ) -> Result<Box<dyn InsertBatch>, StoreError> {
        let state = self.lock()?;
        let existing = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        for col in columns {
            if !existing.columns.iter().any(|c| &c.name == col) {
                return Err(StoreError::ValueError(format!(
                    "column {col} not found in table {table}"
                )));
            }
        }
        Ok(Box::new(MemoryBatch {
            store: self.clone(),
            table: table.to_string(),
            columns: columns.to_vec(),
            rows: Vec::new(),
        }))
    }
}

struct MemoryBatch {
    store: MemoryStore,
    table: String,
    columns: Vec<String>,
    rows: Vec<StoreRow>,
}

#[async_trait]
impl InsertBatch for MemoryBatch {
    fn append(&mut self, values: Vec<CellValue>) -> Result<(), StoreError> {
        if values.len() != self.columns.len() {
            return Err(StoreError::ValueError(format!(
                "value count ({}) does not match column count ({})",
                values.len(),
                self.columns.len()
            )));
        }
        let mut row = StoreRow::new();
        for (col, value) in self.columns.iter().zip(values) {
            let json = serde_json::to_value(&value)
                .map_err(|e| StoreError::ValueError(e.to_string()))?;
            row.insert(col.clone(), json);
        }
        self.rows.push(row);
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    async fn send(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = this.store.lock()?;
        if let Some(limit) = state.fail_send_after {
            if state.batches_sent >= limit {
                return Err(StoreError::ServerError("injected send failure".to_string()));
            }
        }
        let table = state
            .tables
            .get_mut(&this.table)
            .ok_or_else(|| StoreError::TableNotFound(this.table.clone()))?;
        table.rows.extend(this.rows);
        state.batches_sent += 1;
        Ok(())
    }
}
