//! Ingestion Orchestrator - Runs the source to store pipeline
//!
//! The source is read on a blocking worker that feeds a bounded channel; the
//! inserter consumes the channel on the calling task. Dropping the returned
//! future drops the receiver, which stops the worker at its next send.
//!
//! A source failure ends a sequential run after the rows already written; a
//! bulk run writes nothing.

use crate::db::TableStore;
use crate::error::{IngestError, Result};
use crate::ingestion::connector::{spawn_producer, IngestionConnector};
use crate::ingestion::inserter::Inserter;
use crate::ingestion::table_builder::TableBuilder;
use crate::ingestion::IngestionResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionMode {
    /// One `INSERT` per row.
    #[default]
    Sequential,
    /// Whole source collected, then one bulk upsert.
    Bulk,
}

/// Options controlling a single ingestion run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestionOptions {
    pub mode: IngestionMode,
    /// Rows buffered between reader and inserter.
    pub channel_capacity: usize,
    /// Create the table from the source header if it cannot be described.
    #[serde(default)]
    pub create_table: bool,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            mode: IngestionMode::Sequential,
            channel_capacity: 1024,
            create_table: false,
        }
    }
}

/// Ingestion Orchestrator - Coordinates one source-to-table run
pub struct IngestionOrchestrator {
    store: Arc<dyn TableStore>,
    inserter: Inserter,
    table_builder: TableBuilder,
}

impl IngestionOrchestrator {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            inserter: Inserter::new(Arc::clone(&store)),
            table_builder: TableBuilder::new(),
            store,
        }
    }

    /// Creates `table` from the source header unless it already exists.
    ///
    /// Returns the generated key column when a table was created.
    async fn ensure_table(
        &self,
        connector: &dyn IngestionConnector,
        table: &str,
    ) -> Result<Option<String>> {
        match self.store.describe_table(table).await {
            Ok(_) => {
                debug!("Table {} already exists", table);
                Ok(None)
            }
            Err(IngestError::Schema(reason)) => {
                info!("Creating table {} ({})", table, reason);
                let columns = connector.columns()?;
                let key = self
                    .table_builder
                    .create_table(self.store.as_ref(), table, &columns)
                    .await?;
                Ok(Some(key))
            }
            Err(err) => Err(err),
        }
    }

    /// Ingest every row of `connector` into `table`.
    pub async fn ingest(
        &self,
        connector: &dyn IngestionConnector,
        table: &str,
        options: &IngestionOptions,
    ) -> Result<IngestionResult> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            "Ingestion run {}: {} source {} into {} ({:?} mode)",
            run_id,
            connector.source_type(),
            connector.source_id(),
            table,
            options.mode
        );

        let created_key = if options.create_table {
            self.ensure_table(connector, table).await?
        } else {
            None
        };

        // Opening the source fails here, before anything is inserted
        let rows = connector.rows()?;
        let (receiver, producer) = spawn_producer(rows, options.channel_capacity);

        let outcome = match options.mode {
            IngestionMode::Sequential => {
                let consumed = self.inserter.insert_stream(table, receiver).await;
                let produced = producer.await?;
                let outcome = consumed?;
                let produced = produced.map_err(|err| {
                    warn!(
                        "Source {} failed after {} rows were written: {}",
                        connector.source_id(),
                        outcome.rows,
                        err
                    );
                    err
                })?;
                debug!("Source produced {} rows, {} written", produced, outcome.rows);
                outcome
            }
            IngestionMode::Bulk => {
                let collected = self.inserter.collect_bulk(table, receiver).await;
                let produced = producer.await?;
                let batch = collected?;
                let produced = produced.map_err(|err| {
                    warn!(
                        "Source {} failed, discarding {} collected rows: {}",
                        connector.source_id(),
                        batch.len(),
                        err
                    );
                    err
                })?;
                debug!("Source produced {} rows for one upsert", produced);
                self.inserter.write_bulk(batch).await?
            }
        };

        let finished_at = Utc::now();
        info!(
            "Ingestion run {} finished: {} rows into {} in {} ms",
            run_id,
            outcome.rows,
            table,
            (finished_at - started_at).num_milliseconds()
        );

        Ok(IngestionResult {
            run_id,
            source_id: connector.source_id().to_string(),
            table: table.to_string(),
            mode: options.mode,
            records_ingested: outcome.rows,
            first_key: outcome.first_key,
            last_key: outcome.last_key,
            created_key,
            started_at,
            finished_at,
        })
    }
}
