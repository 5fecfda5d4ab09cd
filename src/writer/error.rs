use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Write error: batch {batch} of table {table} failed: {source}")]
    BatchFailed {
        table: String,
        batch: usize,
        #[source]
        source: StoreError,
    },

    #[error("Write error: batch size must be positive")]
    InvalidBatchSize,
}
