//! In-process table store
//!
//! Understands exactly the YQL statements the ingestion pipeline emits: the
//! single-row `INSERT` and the descending `SELECT ... LIMIT 1` used for key
//! continuation. Every executed statement is recorded so callers can inspect
//! what would have been sent to a real store.

use crate::db::{ColumnSpec, Dialect, Record, TableDescription, TableStore, TxMode, Value};
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

fn insert_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^INSERT INTO `(?P<table>[^`]+)` \((?P<cols>[^)]*)\) VALUES \((?P<vals>[^)]*)\);$")
            .expect("insert pattern is valid")
    })
}

fn last_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^SELECT `(?P<pk>[^`]+)` AS last_id FROM `(?P<table>[^`]+)` ORDER BY last_id DESC LIMIT 1$")
            .expect("last key pattern is valid")
    })
}

struct MemoryTable {
    description: TableDescription,
    rows: BTreeMap<u64, Record>,
}

impl MemoryTable {
    fn key_column(&self) -> Result<&str> {
        match self.description.primary_key.as_slice() {
            [key] => Ok(key.as_str()),
            keys => Err(IngestError::Database(format!(
                "memory store writes need exactly one key column, table has {}",
                keys.len()
            ))),
        }
    }

    fn has_column(&self, name: &str) -> bool {
        self.description.columns.iter().any(|c| c.name == name)
    }

    /// Lays `record` out in table column order, filling gaps with nulls.
    fn normalize(&self, record: &Record) -> Result<(u64, Record)> {
        let key_column = self.key_column()?;
        for (field, _) in &record.fields {
            if !self.has_column(field) {
                return Err(IngestError::Database(format!("unknown column {}", field)));
            }
        }

        let key = record
            .get(key_column)
            .and_then(Value::as_u64)
            .ok_or_else(|| IngestError::Database(format!("missing value for key column {}", key_column)))?;

        let mut row = Record::with_capacity(self.description.columns.len());
        for column in &self.description.columns {
            let value = record.get(&column.name).cloned().unwrap_or(Value::Null);
            if value == Value::Null && !column.nullable {
                return Err(IngestError::Database(format!("column {} is not nullable", column.name)));
            }
            row.push(column.name.clone(), value);
        }
        Ok((key, row))
    }
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    statements: Vec<String>,
    execute_calls: usize,
    bulk_upsert_calls: usize,
    fail_on_execute: Option<usize>,
}

impl MemoryState {
    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| IngestError::Schema(format!("table {} not found", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| IngestError::Schema(format!("table {} not found", name)))
    }

    fn run_insert(&mut self, table: &str, cols: &str, vals: &str) -> Result<()> {
        let columns: Vec<&str> = split_list(cols)
            .into_iter()
            .map(|c| c.trim_matches('`'))
            .collect();
        let values = split_list(vals)
            .into_iter()
            .map(parse_literal)
            .collect::<Result<Vec<_>>>()?;

        if columns.len() != values.len() {
            return Err(IngestError::Database(format!(
                "{} columns but {} values",
                columns.len(),
                values.len()
            )));
        }

        let mut record = Record::with_capacity(columns.len());
        for (column, value) in columns.into_iter().zip(values) {
            record.push(column, value);
        }

        let target = self.table_mut(table)?;
        let (key, row) = target.normalize(&record)?;
        if target.rows.contains_key(&key) {
            return Err(IngestError::Database(format!(
                "duplicate key {} in table {}",
                key, table
            )));
        }
        target.rows.insert(key, row);
        Ok(())
    }

    fn run_last_key(&self, table: &str, pk: &str) -> Result<Vec<Record>> {
        let target = self.table(table)?;
        if target.key_column()? != pk {
            return Err(IngestError::Database(format!("{} is not the key of {}", pk, table)));
        }

        Ok(target
            .rows
            .keys()
            .next_back()
            .map(|key| {
                let mut record = Record::with_capacity(1);
                record.push("last_id", Value::Uint64(*key));
                vec![record]
            })
            .unwrap_or_default())
    }
}

fn split_list(list: &str) -> Vec<&str> {
    if list.is_empty() {
        Vec::new()
    } else {
        list.split(", ").collect()
    }
}

fn parse_literal(literal: &str) -> Result<Value> {
    if let Some(text) = literal
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix("\"u"))
    {
        return Ok(Value::Text(text.to_string()));
    }
    if literal == "NULL" {
        return Ok(Value::Null);
    }
    literal
        .parse::<u64>()
        .map(Value::Uint64)
        .map_err(|_| IngestError::Database(format!("unsupported literal {}", literal)))
}

/// Table store kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `n`-th `execute` call (1-based, counted from creation) fail.
    pub fn fail_execute_at(&self, n: usize) {
        self.state().fail_on_execute = Some(n);
    }

    /// Every statement passed to `execute`, in call order.
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn execute_calls(&self) -> usize {
        self.state().execute_calls
    }

    pub fn bulk_upsert_calls(&self) -> usize {
        self.state().bulk_upsert_calls
    }

    /// Stored rows ordered by key.
    pub fn rows(&self, table: &str) -> Result<Vec<Record>> {
        let state = self.state();
        let rows = state.table(table)?.rows.values().cloned().collect();
        Ok(rows)
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    fn dialect(&self) -> Dialect {
        Dialect::Yql
    }

    async fn create_table(
        &self,
        name: &str,
        columns: &[ColumnSpec],
        primary_key: &[String],
    ) -> Result<()> {
        let mut state = self.state();
        if state.tables.contains_key(name) {
            return Err(IngestError::Database(format!("table {} already exists", name)));
        }
        for key in primary_key {
            if !columns.iter().any(|c| &c.name == key) {
                return Err(IngestError::Database(format!(
                    "primary key {} is not a declared column",
                    key
                )));
            }
        }

        state.tables.insert(
            name.to_string(),
            MemoryTable {
                description: TableDescription {
                    primary_key: primary_key.to_vec(),
                    columns: columns.to_vec(),
                },
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn describe_table(&self, name: &str) -> Result<TableDescription> {
        Ok(self.state().table(name)?.description.clone())
    }

    async fn execute(&self, mode: TxMode, statement: &str) -> Result<Vec<Record>> {
        let mut state = self.state();
        state.execute_calls += 1;
        state.statements.push(statement.to_string());

        if state.fail_on_execute == Some(state.execute_calls) {
            return Err(IngestError::Database(format!(
                "injected failure on execute call {}",
                state.execute_calls
            )));
        }

        if let Some(caps) = last_key_pattern().captures(statement) {
            return state.run_last_key(&caps["table"], &caps["pk"]);
        }

        if let Some(caps) = insert_pattern().captures(statement) {
            if mode == TxMode::OnlineReadOnly {
                return Err(IngestError::Database(
                    "write attempted in a read-only transaction".to_string(),
                ));
            }
            state.run_insert(&caps["table"], &caps["cols"], &caps["vals"])?;
            return Ok(Vec::new());
        }

        Err(IngestError::Database(format!("unsupported statement: {}", statement)))
    }

    async fn bulk_upsert(&self, table: &str, records: Vec<Record>) -> Result<()> {
        let mut state = self.state();
        state.bulk_upsert_calls += 1;

        let target = state.table_mut(table)?;
        let rows = records
            .iter()
            .map(|record| target.normalize(record))
            .collect::<Result<Vec<_>>>()?;
        target.rows.extend(rows);
        Ok(())
    }
}
