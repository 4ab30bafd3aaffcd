//! Table Builder - Creates target tables keyed by a synthetic identity column

use crate::db::{ColumnSpec, ColumnType, TableStore};
use crate::error::{IngestError, Result};
use crate::ingestion::escape::ensure_valid;
use itertools::Itertools;
use tracing::info;
use uuid::Uuid;

const KEY_PREFIX: &str = "id-";

/// Table Builder - Declares `id-<uuid>` as the sole `Uint64` key and every
/// declared column as optional text.
#[derive(Clone, Copy, Debug, Default)]
pub struct TableBuilder;

impl TableBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Fresh key column name, unique with overwhelming probability.
    pub fn generate_key_name(&self) -> String {
        format!("{}{}", KEY_PREFIX, Uuid::new_v4())
    }

    /// Column declarations for a table keyed by `key_name`.
    pub fn column_specs(&self, key_name: &str, declared: &[String]) -> Result<Vec<ColumnSpec>> {
        ensure_valid("key column name", key_name)?;
        for column in declared {
            ensure_valid("column name", column)?;
        }

        if let Some(duplicate) = declared
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(key_name))
            .duplicates()
            .next()
        {
            return Err(IngestError::Schema(format!("column {} declared twice", duplicate)));
        }

        let mut specs = Vec::with_capacity(declared.len() + 1);
        specs.push(ColumnSpec::required(key_name, ColumnType::Uint64));
        specs.extend(
            declared
                .iter()
                .map(|column| ColumnSpec::optional(column.as_str(), ColumnType::Text)),
        );
        Ok(specs)
    }

    /// Create `table` with the declared payload columns.
    ///
    /// Returns the generated key column name.
    pub async fn create_table(
        &self,
        store: &dyn TableStore,
        table: &str,
        declared: &[String],
    ) -> Result<String> {
        ensure_valid("table name", table)?;

        let key_name = self.generate_key_name();
        let specs = self.column_specs(&key_name, declared)?;

        store
            .create_table(table, &specs, std::slice::from_ref(&key_name))
            .await?;

        info!(
            "Created table {} with key {} and {} columns",
            table,
            key_name,
            declared.len()
        );
        Ok(key_name)
    }
}
