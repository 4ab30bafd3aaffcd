//! Ingestion Connector Trait - Abstract interface for row sources

use crate::error::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One data record: text fields aligned to the payload columns.
pub type Row = Vec<String>;

/// Lazy, finite, non-restartable row sequence.
pub type RowIter = Box<dyn Iterator<Item = Result<Row>> + Send>;

/// Ingestion Connector Trait
///
/// Implementations:
/// - CsvConnector: delimited text files
pub trait IngestionConnector: Send + Sync {
    /// Open a fresh pass over the data records (header excluded).
    fn rows(&self) -> Result<RowIter>;

    /// Column names from the header, read independently of any `rows` pass.
    fn columns(&self) -> Result<Vec<String>>;

    /// Get source ID (unique identifier)
    fn source_id(&self) -> &str;

    /// Get source type (e.g., "csv")
    fn source_type(&self) -> &str;
}

/// Runs `rows` on a blocking worker, feeding a bounded channel.
///
/// The worker blocks while the channel is full and stops as soon as the
/// receiver is dropped. The sender is dropped on every exit path, which closes
/// the channel for the consumer. The task yields the number of rows handed
/// over, or the first source error.
pub fn spawn_producer(rows: RowIter, capacity: usize) -> (mpsc::Receiver<Row>, JoinHandle<Result<u64>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let task = tokio::task::spawn_blocking(move || {
        let mut sent = 0u64;
        for row in rows {
            let row = row?;
            if tx.blocking_send(row).is_err() {
                debug!("Consumer hung up after {} rows", sent);
                break;
            }
            sent += 1;
        }
        Ok(sent)
    });

    (rx, task)
}
