//! Primary-Key Allocator - Finds where key numbering continues
//!
//! The high-water mark is read in a read-only transaction and is advisory:
//! nothing is reserved, so two writers running at once can pick the same
//! starting key. The pipeline assumes a single writer per table.

use crate::db::{TableStore, TxMode, Value};
use crate::error::{IngestError, Result};
use crate::ingestion::escape::{escape_query, PLACEHOLDER};

/// Highest stored value of `primary_key` in `table`, or 0 for an empty table.
pub async fn last_key(store: &dyn TableStore, table: &str, primary_key: &str) -> Result<u64> {
    let ident = store.dialect().quote_ident(PLACEHOLDER);
    let template = format!(
        "SELECT {} AS last_id FROM {} ORDER BY last_id DESC LIMIT 1",
        ident, ident
    );
    let query = escape_query(&template, &[primary_key.into(), table.into()])?;

    let rows = store.execute(TxMode::OnlineReadOnly, &query).await?;
    match rows.first() {
        None => Ok(0),
        Some(row) => row.get("last_id").and_then(Value::as_u64).ok_or_else(|| {
            IngestError::Database(format!("{} returned no unsigned last_id", table))
        }),
    }
}

/// Running key counter for one insertion call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeySequence {
    last: u64,
}

impl KeySequence {
    pub fn starting_after(last: u64) -> Self {
        Self { last }
    }

    /// Advance and return the next key.
    pub fn next_key(&mut self) -> Result<u64> {
        self.last = self
            .last
            .checked_add(1)
            .ok_or(IngestError::KeyOverflow(self.last))?;
        Ok(self.last)
    }
}
