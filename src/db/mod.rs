//! Store boundary for the ingestion pipeline
//!
//! The pipeline talks to the target table store only through [`TableStore`].
//! `PgStore` is the PostgreSQL adapter; `MemoryStore` keeps tables in process
//! and is what tests and dry runs write into.

pub mod connection;
pub mod memory;
pub mod pg_store;

pub use connection::{init_pool, PoolSettings};
pub use memory::MemoryStore;
pub use pg_store::{PgStore, RetryPolicy};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Column types the pipeline ever declares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Uint64,
    Text,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn optional(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

/// Live table metadata as reported by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableDescription {
    pub primary_key: Vec<String>,
    /// All columns, primary key included, in store order.
    pub columns: Vec<ColumnSpec>,
}

/// Transaction mode for a single `execute` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxMode {
    /// Serializable read-write transaction, committed after the statement.
    ReadWrite,
    /// Read-only, tolerates slightly stale reads.
    OnlineReadOnly,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Uint64(u64),
    Text(String),
    Null,
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint64(v) => Some(*v),
            _ => None,
        }
    }
}

/// A structured row: ordered `(field, value)` pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

/// Statement language accepted by a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    Yql,
    Postgres,
}

impl Dialect {
    /// Quotes an identifier. The caller validates it first.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Dialect::Yql => format!("`{}`", ident),
            Dialect::Postgres => format!("\"{}\"", ident),
        }
    }

    /// Wraps a text literal. The caller validates it first.
    pub fn text_literal(&self, value: &str) -> String {
        match self {
            Dialect::Yql => format!("\"{}\"u", value),
            Dialect::Postgres => format!("'{}'", value),
        }
    }
}

/// Table store driver.
///
/// Implementations own connection handling and any retry policy; callers see
/// one attempt per method call.
#[async_trait]
pub trait TableStore: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn create_table(
        &self,
        name: &str,
        columns: &[ColumnSpec],
        primary_key: &[String],
    ) -> Result<()>;

    async fn describe_table(&self, name: &str) -> Result<TableDescription>;

    async fn execute(&self, mode: TxMode, statement: &str) -> Result<Vec<Record>>;

    async fn bulk_upsert(&self, table: &str, records: Vec<Record>) -> Result<()>;
}
