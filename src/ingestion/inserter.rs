//! Inserter - Writes rows under continuing synthetic keys
//!
//! Every call resolves the table and its key high-water mark afresh, then
//! either executes one statement per row (sequential) or drains a channel
//! into a single bulk upsert (bulk). The first error ends the call.

use crate::db::{Dialect, Record, TableStore, TxMode, Value};
use crate::error::{IngestError, Result};
use crate::ingestion::connector::Row;
use crate::ingestion::escape::{escape_query, QueryArg, PLACEHOLDER};
use crate::ingestion::key_allocator::{last_key, KeySequence};
use crate::ingestion::schema_discovery::{resolve, TableDescriptor};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::iter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What one insertion call wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub rows: u64,
    pub first_key: Option<u64>,
    pub last_key: Option<u64>,
}

impl InsertOutcome {
    fn record(&mut self, key: u64) {
        self.rows += 1;
        self.first_key.get_or_insert(key);
        self.last_key = Some(key);
    }
}

fn check_length(columns: &[String], row: &[String]) -> Result<()> {
    if row.len() != columns.len() {
        return Err(IngestError::LengthMismatch {
            expected: columns.len(),
            actual: row.len(),
        });
    }
    Ok(())
}

/// Build the single-row `INSERT` for `row` under key `id`.
///
/// Table, key, column names and every value go through the query escaper;
/// values are wrapped as text literals of `dialect`.
pub fn insert_query(
    dialect: Dialect,
    table: &str,
    primary_key: &str,
    id: u64,
    columns: &[String],
    row: &[String],
) -> Result<String> {
    check_length(columns, row)?;

    let ident = dialect.quote_ident(PLACEHOLDER);
    let literal = dialect.text_literal(PLACEHOLDER);
    let column_list = iter::repeat(ident.as_str()).take(columns.len() + 1).join(", ");
    let value_list = iter::once(PLACEHOLDER)
        .chain(iter::repeat(literal.as_str()).take(row.len()))
        .join(", ");
    let template = format!("INSERT INTO {} ({}) VALUES ({});", ident, column_list, value_list);

    let mut args: Vec<QueryArg<'_>> = Vec::with_capacity(columns.len() + row.len() + 3);
    args.push(table.into());
    args.push(primary_key.into());
    args.extend(columns.iter().map(QueryArg::from));
    args.push(id.into());
    args.extend(row.iter().map(QueryArg::from));

    escape_query(&template, &args)
}

/// Inserter - Owns the key counter for the duration of one call.
pub struct Inserter {
    store: Arc<dyn TableStore>,
}

impl Inserter {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Resolve the table and the key numbering continues from.
    async fn prepare(&self, table: &str) -> Result<(TableDescriptor, KeySequence)> {
        let descriptor = resolve(self.store.as_ref(), table).await?;
        let last = last_key(self.store.as_ref(), table, &descriptor.primary_key).await?;
        info!("Inserting into {} after key {}", table, last);
        Ok((descriptor, KeySequence::starting_after(last)))
    }

    async fn insert_row(&self, descriptor: &TableDescriptor, id: u64, row: &[String]) -> Result<()> {
        let statement = insert_query(
            self.store.dialect(),
            &descriptor.name,
            &descriptor.primary_key,
            id,
            &descriptor.columns,
            row,
        )?;
        self.store.execute(TxMode::ReadWrite, &statement).await?;
        debug!("Inserted key {} into {}", id, descriptor.name);
        Ok(())
    }

    /// Sequential mode: one statement per row, in order.
    ///
    /// An empty input returns without touching the store.
    pub async fn insert_all<I>(&self, table: &str, rows: I) -> Result<InsertOutcome>
    where
        I: IntoIterator<Item = Row>,
        I::IntoIter: Send,
    {
        let mut rows = rows.into_iter().peekable();
        if rows.peek().is_none() {
            return Ok(InsertOutcome::default());
        }

        let (descriptor, mut keys) = self.prepare(table).await?;
        let mut outcome = InsertOutcome::default();
        for row in rows {
            let id = keys.next_key()?;
            self.insert_row(&descriptor, id, &row).await?;
            outcome.record(id);
        }

        info!("Inserted {} rows into {}", outcome.rows, table);
        Ok(outcome)
    }

    /// Sequential mode fed by a channel.
    ///
    /// Nothing is resolved until the first row arrives; a channel that closes
    /// empty returns without touching the store.
    pub async fn insert_stream(&self, table: &str, mut rows: mpsc::Receiver<Row>) -> Result<InsertOutcome> {
        let Some(first) = rows.recv().await else {
            return Ok(InsertOutcome::default());
        };

        let (descriptor, mut keys) = self.prepare(table).await?;
        let mut outcome = InsertOutcome::default();
        let mut next = Some(first);
        while let Some(row) = next {
            let id = keys.next_key()?;
            self.insert_row(&descriptor, id, &row).await?;
            outcome.record(id);
            next = rows.recv().await;
        }

        info!("Inserted {} rows into {}", outcome.rows, table);
        Ok(outcome)
    }

    /// Bulk mode: drain the channel, then write everything with one upsert.
    pub async fn insert_bulk(&self, table: &str, rows: mpsc::Receiver<Row>) -> Result<InsertOutcome> {
        let batch = self.collect_bulk(table, rows).await?;
        self.write_bulk(batch).await
    }

    /// Drain the channel into keyed records without writing anything.
    ///
    /// Row length is checked while collecting, so a bad row aborts before
    /// anything is written. Values stay typed fields, never statement text.
    pub async fn collect_bulk(&self, table: &str, mut rows: mpsc::Receiver<Row>) -> Result<BulkBatch> {
        let (descriptor, mut keys) = self.prepare(table).await?;

        let mut batch = BulkBatch {
            table: descriptor.name.clone(),
            records: Vec::new(),
            outcome: InsertOutcome::default(),
        };
        while let Some(row) = rows.recv().await {
            check_length(&descriptor.columns, &row)?;
            let id = keys.next_key()?;

            let mut record = Record::with_capacity(descriptor.columns.len() + 1);
            record.push(descriptor.primary_key.as_str(), Value::Uint64(id));
            for (column, value) in descriptor.columns.iter().zip(row) {
                record.push(column.as_str(), Value::Text(value));
            }
            batch.records.push(record);
            batch.outcome.record(id);
        }

        Ok(batch)
    }

    /// Write a collected batch with one upsert. An empty batch issues none.
    pub async fn write_bulk(&self, batch: BulkBatch) -> Result<InsertOutcome> {
        if batch.records.is_empty() {
            info!("Nothing to upsert into {}", batch.table);
            return Ok(batch.outcome);
        }

        self.store.bulk_upsert(&batch.table, batch.records).await?;
        info!("Upserted {} rows into {}", batch.outcome.rows, batch.table);
        Ok(batch.outcome)
    }
}

/// Records collected for one bulk upsert.
#[derive(Debug)]
pub struct BulkBatch {
    table: String,
    records: Vec<Record>,
    outcome: InsertOutcome,
}

impl BulkBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ColumnSpec, ColumnType, MemoryStore};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn store_with_last_key(last: Option<u64>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_table(
                "table1",
                &[
                    ColumnSpec::required("user_id", ColumnType::Uint64),
                    ColumnSpec::optional("column1", ColumnType::Text),
                    ColumnSpec::optional("column2", ColumnType::Text),
                    ColumnSpec::optional("column3", ColumnType::Text),
                ],
                &["user_id".to_string()],
            )
            .await
            .unwrap();

        if let Some(last) = last {
            let mut record = Record::default();
            record.push("user_id", Value::Uint64(last));
            store.bulk_upsert("table1", vec![record]).await.unwrap();
        }
        store
    }

    fn keys_of(store: &MemoryStore) -> Vec<u64> {
        store
            .rows("table1")
            .unwrap()
            .iter()
            .filter_map(|r| r.get("user_id").and_then(Value::as_u64))
            .collect()
    }

    fn channel_of(rows: Vec<Row>) -> mpsc::Receiver<Row> {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            tx.try_send(row).unwrap();
        }
        rx
    }

    #[test]
    fn builds_yql_insert_statement() {
        let query = insert_query(
            Dialect::Yql,
            "table1",
            "user_id",
            1,
            &strings(&["column1", "column2", "column3"]),
            &strings(&["val1", "val2", "val3"]),
        )
        .unwrap();

        assert_eq!(
            query,
            "INSERT INTO `table1` (`user_id`, `column1`, `column2`, `column3`) \
             VALUES (1, \"val1\"u, \"val2\"u, \"val3\"u);"
        );
    }

    #[test]
    fn builds_postgres_insert_statement() {
        let query = insert_query(
            Dialect::Postgres,
            "people",
            "id-1",
            9,
            &strings(&["name"]),
            &strings(&["Grace"]),
        )
        .unwrap();

        assert_eq!(query, "INSERT INTO \"people\" (\"id-1\", \"name\") VALUES (9, 'Grace');");
    }

    #[test]
    fn rejects_unsafe_values() {
        let err = insert_query(
            Dialect::Yql,
            "table1",
            "user_id",
            1,
            &strings(&["column1"]),
            &strings(&["x\"u); DROP TABLE table1; --"]),
        )
        .unwrap_err();

        assert!(matches!(err, IngestError::ForbiddenSymbol(_)));
    }

    #[test]
    fn rejects_length_mismatch() {
        let err = insert_query(
            Dialect::Yql,
            "table1",
            "user_id",
            1,
            &strings(&["column1", "column2"]),
            &strings(&["only one"]),
        )
        .unwrap_err();

        assert!(matches!(err, IngestError::LengthMismatch { expected: 2, actual: 1 }));
    }

    #[tokio::test]
    async fn sequential_insert_continues_after_last_key() {
        let store = store_with_last_key(Some(41)).await;
        let inserter = Inserter::new(store.clone());

        let outcome = inserter
            .insert_all(
                "table1",
                vec![strings(&["a", "b", "c"]), strings(&["d", "e", "f"])],
            )
            .await
            .unwrap();

        assert_eq!(outcome.rows, 2);
        assert_eq!(outcome.first_key, Some(42));
        assert_eq!(outcome.last_key, Some(43));
        assert_eq!(keys_of(&store), vec![41, 42, 43]);

        let statements = store.statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[1].contains("VALUES (42, \"a\"u, \"b\"u, \"c\"u);"));
        assert!(statements[2].contains("VALUES (43, \"d\"u, \"e\"u, \"f\"u);"));
    }

    #[tokio::test]
    async fn sequential_insert_on_empty_table_starts_at_one() {
        let store = store_with_last_key(None).await;
        let inserter = Inserter::new(store.clone());

        inserter
            .insert_all("table1", vec![strings(&["a", "b", "c"])])
            .await
            .unwrap();

        assert_eq!(keys_of(&store), vec![1]);
    }

    #[tokio::test]
    async fn length_mismatch_stops_before_the_row_reaches_the_store() {
        let store = store_with_last_key(None).await;
        let inserter = Inserter::new(store.clone());

        let err = inserter
            .insert_all("table1", vec![strings(&["a", "b"])])
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::LengthMismatch { .. }));
        // only the key lookup was executed
        assert_eq!(store.execute_calls(), 1);
        assert!(keys_of(&store).is_empty());
    }

    #[tokio::test]
    async fn sequential_insert_stops_at_first_store_error() {
        let store = store_with_last_key(None).await;
        store.fail_execute_at(3);
        let inserter = Inserter::new(store.clone());

        let result = inserter
            .insert_all(
                "table1",
                vec![
                    strings(&["a", "b", "c"]),
                    strings(&["d", "e", "f"]),
                    strings(&["g", "h", "i"]),
                ],
            )
            .await;

        assert!(matches!(result, Err(IngestError::Database(_))));
        assert_eq!(keys_of(&store), vec![1]);
        assert_eq!(store.execute_calls(), 3);
    }

    #[tokio::test]
    async fn empty_input_never_touches_the_store() {
        let store = Arc::new(MemoryStore::new());
        let inserter = Inserter::new(store.clone());

        let outcome = inserter.insert_all("missing", Vec::<Row>::new()).await.unwrap();
        assert_eq!(outcome, InsertOutcome::default());

        let outcome = inserter.insert_stream("missing", channel_of(Vec::new())).await.unwrap();
        assert_eq!(outcome.rows, 0);
        assert_eq!(store.execute_calls(), 0);
    }

    #[tokio::test]
    async fn stream_insert_follows_channel_order() {
        let store = store_with_last_key(Some(10)).await;
        let inserter = Inserter::new(store.clone());

        let outcome = inserter
            .insert_stream(
                "table1",
                channel_of(vec![strings(&["1", "2", "3"]), strings(&["4", "5", "6"])]),
            )
            .await
            .unwrap();

        assert_eq!(outcome.first_key, Some(11));
        assert_eq!(outcome.last_key, Some(12));
        let rows = store.rows("table1").unwrap();
        assert_eq!(rows[2].get("column1"), Some(&Value::Text("4".to_string())));
    }

    #[tokio::test]
    async fn bulk_insert_uses_one_upsert() {
        let store = store_with_last_key(Some(5)).await;
        let upserts_before = store.bulk_upsert_calls();
        let inserter = Inserter::new(store.clone());

        let outcome = inserter
            .insert_bulk(
                "table1",
                channel_of(vec![
                    strings(&["col1_row1", "col2_row1", "col3_row1"]),
                    strings(&["col1_row2", "col2_row2", "col3_row2"]),
                    strings(&["col1_row3", "col2_row3", "col3_row3"]),
                ]),
            )
            .await
            .unwrap();

        assert_eq!(outcome.rows, 3);
        assert_eq!(store.bulk_upsert_calls() - upserts_before, 1);
        assert_eq!(keys_of(&store), vec![5, 6, 7, 8]);

        let rows = store.rows("table1").unwrap();
        assert_eq!(rows[1].get("column2"), Some(&Value::Text("col2_row1".to_string())));
        assert_eq!(rows[3].get("column3"), Some(&Value::Text("col3_row3".to_string())));

        // only the key lookup went through statement text
        assert_eq!(store.execute_calls(), 1);
    }

    #[tokio::test]
    async fn bulk_insert_checks_row_length_before_writing() {
        let store = store_with_last_key(None).await;
        let inserter = Inserter::new(store.clone());

        let err = inserter
            .insert_bulk(
                "table1",
                channel_of(vec![strings(&["a", "b", "c"]), strings(&["short"])]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::LengthMismatch { expected: 3, actual: 1 }));
        assert_eq!(store.bulk_upsert_calls(), 0);
    }

    #[tokio::test]
    async fn bulk_insert_of_empty_stream_writes_nothing() {
        let store = store_with_last_key(None).await;
        let inserter = Inserter::new(store.clone());

        let outcome = inserter.insert_bulk("table1", channel_of(Vec::new())).await.unwrap();

        assert_eq!(outcome.rows, 0);
        assert_eq!(store.bulk_upsert_calls(), 0);
    }
}
