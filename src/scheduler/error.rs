use thiserror::Error;

use crate::schema::SchemaError;
use crate::source::SourceError;
use crate::writer::WriteError;

#[derive(Error, Debug)]
pub enum CubeError {
    #[error("Cube {cube}: query {query} failed: {source}")]
    QuerySource {
        cube: String,
        query: String,
        #[source]
        source: SourceError,
    },

    #[error("Cube {cube}: schema of {table} failed: {source}")]
    Schema {
        cube: String,
        table: String,
        #[source]
        source: SchemaError,
    },

    #[error("Cube {cube}: write to {table} failed: {source}")]
    Write {
        cube: String,
        table: String,
        #[source]
        source: WriteError,
    },

    #[error("Cube cycle cancelled by shutdown")]
    Cancelled,
}
