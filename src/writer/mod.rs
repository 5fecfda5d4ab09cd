mod error;

use std::sync::Arc;
use std::time::Duration;

use crate::metrics;
use crate::store::{with_deadline, CubeStore, StoreError};
use crate::table::Table;

pub use self::error::WriteError;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Number of batches needed for `rows` rows.
pub fn batch_count(rows: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    rows.div_ceil(batch_size)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub rows: usize,
    pub batches: usize,
}

/// Appends table rows to the store in fixed-size batches.
///
/// A failing batch stops the write. Batches acknowledged before it stay.
pub struct BatchWriter {
    store: Arc<dyn CubeStore>,
    batch_size: usize,
    call_timeout: Duration,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn CubeStore>,
        batch_size: usize,
        call_timeout: Duration,
    ) -> Result<Self, WriteError> {
        if batch_size == 0 {
            return Err(WriteError::InvalidBatchSize);
        }
        Ok(Self {
            store,
            batch_size,
            call_timeout,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn write(&self, table: &Table) -> Result<WriteReport, WriteError> {
        let columns = table.columns();
        let names = table.column_names();
        let mut report = WriteReport::default();

        for (batch_idx, chunk) in table.rows.chunks(self.batch_size).enumerate() {
            let failed = |source: StoreError| WriteError::BatchFailed {
                table: table.name.clone(),
                batch: batch_idx,
                source,
            };

            let mut batch = with_deadline(
                self.call_timeout,
                self.store.prepare_batch(&table.name, &names),
            )
            .await
            .map_err(failed)?;
            for row in chunk {
                batch.append(row.ordered_values(&columns)).map_err(failed)?;
            }
            with_deadline(self.call_timeout, batch.send())
                .await
                .map_err(failed)?;

            metrics::record_batch(chunk.len());
            report.rows += chunk.len();
            report.batches += 1;
            log::debug!(
                "Sent batch {} of table '{}' ({} rows)",
                batch_idx,
                table.name,
                chunk.len()
            );
        }

        log::info!(
            "Wrote {} rows in {} batches to '{}'",
            report.rows,
            report.batches,
            table.name
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ColumnInfo, MemoryStore};
    use crate::table::Row;

    fn table(rows: usize) -> Table {
        let mut table = Table::new("up");
        table.register_dimension("job");
        table.register_metric("up");
        for i in 0..rows {
            let mut row = Row::new(i as i64);
            row.metrics.insert("up".to_string(), i as f64);
            table.push_row(row);
        }
        table
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed_table(
            "up",
            vec![
                ColumnInfo::new("Time", "DateTime"),
                ColumnInfo::new("job", "String"),
                ColumnInfo::new("up", "Nullable(Float64)"),
            ],
        );
        store
    }

    #[test]
    fn batch_count_rounds_up() {
        assert_eq!(batch_count(0, 100), 0);
        assert_eq!(batch_count(1, 100), 1);
        assert_eq!(batch_count(100, 100), 1);
        assert_eq!(batch_count(101, 100), 2);
        assert_eq!(batch_count(250, 100), 3);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        assert!(matches!(
            BatchWriter::new(store, 0, Duration::from_secs(1)),
            Err(WriteError::InvalidBatchSize)
        ));
    }

    #[tokio::test]
    async fn every_row_is_written_once() {
        let store = store();
        let writer = BatchWriter::new(Arc::new(store.clone()), 100, Duration::from_secs(1)).unwrap();
        let report = writer.write(&table(250)).await.unwrap();
        assert_eq!(report, WriteReport { rows: 250, batches: 3 });

        let rows = store.table("up").unwrap().rows;
        assert_eq!(rows.len(), 250);
        assert_eq!(rows[0].get("job").and_then(|v| v.as_str()), Some(""));
        assert_eq!(rows[249].get("up").and_then(|v| v.as_f64()), Some(249.0));
    }

    #[tokio::test]
    async fn empty_table_sends_nothing() {
        let store = store();
        let writer = BatchWriter::new(Arc::new(store.clone()), 10, Duration::from_secs(1)).unwrap();
        let report = writer.write(&table(0)).await.unwrap();
        assert_eq!(report, WriteReport::default());
        assert_eq!(store.batches_sent(), 0);
    }

    #[tokio::test]
    async fn failing_batch_reports_index_and_keeps_earlier_batches() {
        let store = store();
        store.fail_send_after(Some(2));
        let writer = BatchWriter::new(Arc::new(store.clone()), 10, Duration::from_secs(1)).unwrap();
        let err = writer.write(&table(35)).await.unwrap_err();
        match err {
            WriteError::BatchFailed { table, batch, .. } => {
                assert_eq!(table, "up");
                assert_eq!(batch, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.table("up").unwrap().rows.len(), 20);
    }
}
