use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Schema error: failed to create table {table}: {source}")]
    CreateFailed {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Schema error: failed to migrate table {table}: {source}")]
    MigrateFailed {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Schema error: failed to inspect table {table}: {source}")]
    InspectFailed {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Schema error: failed to create view {view}: {source}")]
    ViewFailed {
        view: String,
        #[source]
        source: StoreError,
    },

    #[error("Schema error: failed to drop {name}: {source}")]
    DropFailed {
        name: String,
        #[source]
        source: StoreError,
    },
}
