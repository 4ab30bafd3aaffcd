//! PostgreSQL table store
//!
//! Statement text from the pipeline runs inside its own transaction; metadata
//! comes from `information_schema`. Transient failures (I/O, pool timeouts,
//! serialization conflicts) are retried with an exponential backoff before the
//! error reaches the caller.

use crate::db::connection::{init_pool, PoolSettings};
use crate::db::{
    ColumnSpec, ColumnType, Dialect, Record, TableDescription, TableStore, TxMode, Value,
};
use crate::error::{IngestError, Result};
use crate::ingestion::escape::ensure_valid;
use async_trait::async_trait;
use itertools::Itertools;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Postgres, QueryBuilder, Row, TypeInfo};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bind parameters PostgreSQL accepts in one statement.
const MAX_BIND_PARAMS: usize = 65_535;

const DIALECT: Dialect = Dialect::Postgres;

/// Retry policy for transient store failures
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
        _ => false,
    }
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Uint64 => "BIGINT",
        ColumnType::Text => "TEXT",
    }
}

fn create_table_ddl(name: &str, columns: &[ColumnSpec], primary_key: &[String]) -> Result<String> {
    ensure_valid("table name", name)?;
    for column in columns {
        ensure_valid("column name", &column.name)?;
    }
    for key in primary_key {
        ensure_valid("primary key", key)?;
    }

    let mut parts: Vec<String> = columns
        .iter()
        .map(|column| {
            let null = if column.nullable { "" } else { " NOT NULL" };
            format!(
                "{} {}{}",
                DIALECT.quote_ident(&column.name),
                sql_type(column.column_type),
                null
            )
        })
        .collect();
    if !primary_key.is_empty() {
        parts.push(format!(
            "PRIMARY KEY ({})",
            primary_key.iter().map(|k| DIALECT.quote_ident(k)).join(", ")
        ));
    }

    Ok(format!(
        "CREATE TABLE {} ({})",
        DIALECT.quote_ident(name),
        parts.join(", ")
    ))
}

/// Quoted pieces of a bulk upsert, shared by every chunk.
#[derive(Debug)]
struct UpsertPlan {
    head: String,
    tail: String,
    rows_per_statement: usize,
}

impl UpsertPlan {
    fn new(table: &str, primary_key: &str, fields: &[&str]) -> Result<Self> {
        ensure_valid("table name", table)?;
        for field in fields {
            ensure_valid("column name", field)?;
        }
        if !fields.contains(&primary_key) {
            return Err(IngestError::Database(format!(
                "records for {} carry no value for key {}",
                table, primary_key
            )));
        }

        let head = format!(
            "INSERT INTO {} ({}) ",
            DIALECT.quote_ident(table),
            fields.iter().map(|f| DIALECT.quote_ident(f)).join(", ")
        );

        let updates = fields
            .iter()
            .filter(|f| **f != primary_key)
            .map(|f| {
                let ident = DIALECT.quote_ident(f);
                format!("{} = EXCLUDED.{}", ident, ident)
            })
            .join(", ");
        let tail = if updates.is_empty() {
            format!(" ON CONFLICT ({}) DO NOTHING", DIALECT.quote_ident(primary_key))
        } else {
            format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                DIALECT.quote_ident(primary_key),
                updates
            )
        };

        Ok(Self {
            head,
            tail,
            rows_per_statement: (MAX_BIND_PARAMS / fields.len()).max(1),
        })
    }
}

/// Field names shared by all records, in the first record's order.
fn common_fields(records: &[Record]) -> Result<Vec<&str>> {
    let Some(first) = records.first() else {
        return Ok(Vec::new());
    };
    let fields: Vec<&str> = first.fields.iter().map(|(name, _)| name.as_str()).collect();

    for record in records {
        let same = record.fields.len() == fields.len()
            && record
                .fields
                .iter()
                .zip(&fields)
                .all(|((name, _), expected)| name == expected);
        if !same {
            return Err(IngestError::Database(
                "bulk upsert records must share one field layout".to_string(),
            ));
        }

        for (name, value) in &record.fields {
            if let Value::Uint64(v) = value {
                if *v > i64::MAX as u64 {
                    return Err(IngestError::Database(format!(
                        "value {} of {} does not fit BIGINT",
                        v, name
                    )));
                }
            }
        }
    }

    Ok(fields)
}

fn decode_row(row: &PgRow) -> Result<Record> {
    let mut record = Record::with_capacity(row.len());
    for column in row.columns() {
        let idx = column.ordinal();
        let type_name = column.type_info().name();
        let integer: Option<Option<i64>> = match type_name {
            "INT8" => Some(row.try_get::<Option<i64>, _>(idx)?),
            "INT4" => Some(row.try_get::<Option<i32>, _>(idx)?.map(i64::from)),
            "INT2" => Some(row.try_get::<Option<i16>, _>(idx)?.map(i64::from)),
            _ => None,
        };

        let value = match integer {
            Some(Some(n)) => Value::Uint64(u64::try_from(n).map_err(|_| {
                IngestError::Database(format!("negative value {} in {}", n, column.name()))
            })?),
            Some(None) => Value::Null,
            None => match type_name {
                "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" => row
                    .try_get::<Option<String>, _>(idx)?
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
                other => {
                    return Err(IngestError::Database(format!(
                        "unsupported column type {} for {}",
                        other,
                        column.name()
                    )))
                }
            },
        };
        record.push(column.name(), value);
    }
    Ok(record)
}

async fn run_statement(pool: &PgPool, mode: TxMode, statement: &str) -> std::result::Result<Vec<PgRow>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let setup = match mode {
        TxMode::ReadWrite => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        TxMode::OnlineReadOnly => "SET TRANSACTION READ ONLY",
    };
    sqlx::query(setup).execute(&mut *tx).await?;
    let rows = sqlx::query(statement).fetch_all(&mut *tx).await?;
    tx.commit().await?;
    Ok(rows)
}

async fn run_upsert(pool: &PgPool, plan: &UpsertPlan, records: &[Record]) -> std::result::Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for chunk in records.chunks(plan.rows_per_statement) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(plan.head.as_str());
        builder.push_values(chunk, |mut row, record| {
            for (_, value) in &record.fields {
                match value {
                    // range checked in common_fields
                    Value::Uint64(v) => {
                        row.push_bind(*v as i64);
                    }
                    Value::Text(text) => {
                        row.push_bind(text.as_str());
                    }
                    Value::Null => {
                        row.push_bind(None::<String>);
                    }
                }
            }
        });
        builder.push(plan.tail.as_str());
        builder.build().execute(&mut *tx).await?;
    }
    tx.commit().await
}

/// PostgreSQL-backed [`TableStore`].
pub struct PgStore {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<Self> {
        let pool = init_pool(database_url, settings).await?;
        Ok(Self::new(pool))
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retry_policy.max_retries && is_transient(&err) => {
                    let delay = self.retry_policy.delay_for_attempt(attempt);
                    warn!(
                        "{} failed (retry {} of {} in {:?}): {}",
                        what,
                        attempt + 1,
                        self.retry_policy.max_retries,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn primary_key(&self, name: &str) -> Result<Vec<String>> {
        let pool = &self.pool;
        let rows: Vec<(String,)> = self
            .with_retries("primary key lookup", move || {
                sqlx::query_as::<_, (String,)>(
                    r#"
                    SELECT kcu.column_name::text
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                      ON tc.constraint_name = kcu.constraint_name
                     AND tc.table_schema = kcu.table_schema
                     AND tc.table_name = kcu.table_name
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                      AND tc.table_schema = current_schema()
                      AND tc.table_name = $1
                    ORDER BY kcu.ordinal_position
                    "#,
                )
                .bind(name)
                .fetch_all(pool)
            })
            .await?;
        Ok(rows.into_iter().map(|(column,)| column).collect())
    }
}

#[async_trait]
impl TableStore for PgStore {
    fn dialect(&self) -> Dialect {
        DIALECT
    }

    async fn create_table(
        &self,
        name: &str,
        columns: &[ColumnSpec],
        primary_key: &[String],
    ) -> Result<()> {
        let ddl = create_table_ddl(name, columns, primary_key)?;
        debug!("{}", ddl);

        let pool = &self.pool;
        let ddl = ddl.as_str();
        self.with_retries("create table", move || sqlx::query(ddl).execute(pool))
            .await?;
        Ok(())
    }

    async fn describe_table(&self, name: &str) -> Result<TableDescription> {
        let pool = &self.pool;
        let rows: Vec<(String, String, String)> = self
            .with_retries("describe table", move || {
                sqlx::query_as::<_, (String, String, String)>(
                    r#"
                    SELECT column_name::text, data_type::text, is_nullable::text
                    FROM information_schema.columns
                    WHERE table_schema = current_schema()
                      AND table_name = $1
                    ORDER BY ordinal_position
                    "#,
                )
                .bind(name)
                .fetch_all(pool)
            })
            .await?;

        if rows.is_empty() {
            return Err(IngestError::Schema(format!("table {} not found", name)));
        }

        let columns = rows
            .into_iter()
            .map(|(column, data_type, nullable)| ColumnSpec {
                name: column,
                column_type: if data_type == "bigint" {
                    ColumnType::Uint64
                } else {
                    ColumnType::Text
                },
                nullable: nullable == "YES",
            })
            .collect();

        Ok(TableDescription {
            primary_key: self.primary_key(name).await?,
            columns,
        })
    }

    async fn execute(&self, mode: TxMode, statement: &str) -> Result<Vec<Record>> {
        let pool = &self.pool;
        let rows = self
            .with_retries("execute", move || run_statement(pool, mode, statement))
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn bulk_upsert(&self, table: &str, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let primary_key = match self.primary_key(table).await?.as_slice() {
            [key] => key.clone(),
            keys => {
                return Err(IngestError::Schema(format!(
                    "bulk upsert into {} needs one key column, found {}",
                    table,
                    keys.len()
                )))
            }
        };

        let fields = common_fields(&records)?;
        let plan = UpsertPlan::new(table, &primary_key, &fields)?;
        debug!(
            "Upserting {} records into {} ({} per statement)",
            records.len(),
            table,
            plan.rows_per_statement
        );

        let pool = &self.pool;
        let plan = &plan;
        let records = records.as_slice();
        self.with_retries("bulk upsert", move || run_upsert(pool, plan, records))
            .await
    }
}
