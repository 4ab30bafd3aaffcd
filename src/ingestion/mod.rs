//! Ingestion Module
//!
//! Moves rows from a delimited source into a keyed table:
//! - Streaming extraction from the source
//! - Schema discovery on the target table
//! - Primary-key continuation
//! - Sequential and bulk insertion
//! - Table creation with a synthetic key

pub mod connector;
pub mod csv_connector;
pub mod escape;
pub mod inserter;
pub mod key_allocator;
pub mod orchestrator;
pub mod schema_discovery;
pub mod table_builder;

pub use connector::{spawn_producer, IngestionConnector, Row, RowIter};
pub use csv_connector::{CsvConnector, MalformedRecords};
pub use escape::{escape_query, validate};
pub use inserter::{insert_query, BulkBatch, InsertOutcome, Inserter};
pub use key_allocator::{last_key, KeySequence};
pub use orchestrator::{IngestionMode, IngestionOptions, IngestionOrchestrator};
pub use schema_discovery::{resolve, TableDescriptor};
pub use table_builder::TableBuilder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ingestion result
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestionResult {
    /// Ingestion run ID
    pub run_id: String,

    pub source_id: String,

    pub table: String,

    pub mode: IngestionMode,

    /// Number of records ingested
    pub records_ingested: u64,

    /// Key of the first written row
    pub first_key: Option<u64>,

    /// Key of the last written row
    pub last_key: Option<u64>,

    /// Key column generated when the run created the table
    pub created_key: Option<String>,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,
}
