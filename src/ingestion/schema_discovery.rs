//! Schema Discovery - Resolves the key and payload columns of a live table

use crate::db::TableStore;
use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Key and payload columns of a target table, as seen at resolve time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub primary_key: String,
    /// Every column except the primary key, in store order.
    pub columns: Vec<String>,
}

/// Describe `table` and split its columns into the single primary key and
/// the payload columns.
pub async fn resolve(store: &dyn TableStore, table: &str) -> Result<TableDescriptor> {
    let description = store.describe_table(table).await?;

    let primary_key = match description.primary_key.as_slice() {
        [key] => key.clone(),
        keys => {
            return Err(IngestError::Schema(format!(
                "incorrect primary keys number for {}: expected 1, found {}",
                table,
                keys.len()
            )))
        }
    };

    let columns: Vec<String> = description
        .columns
        .into_iter()
        .map(|column| column.name)
        .filter(|name| *name != primary_key)
        .collect();

    debug!("Resolved {}: key {}, {} payload columns", table, primary_key, columns.len());

    Ok(TableDescriptor {
        name: table.to_string(),
        primary_key,
        columns,
    })
}
