//! CSV ingestion into keyed tables
//!
//! Rows stream out of a delimited file, get a synthetic `u64` key that
//! continues from the table's current maximum, and are written either one
//! statement per row or as a single bulk upsert.

pub mod config;
pub mod db;
pub mod error;
pub mod ingestion;

pub use config::IngestConfig;
pub use error::{IngestError, Result};
