//! Runtime configuration
//!
//! Layered as defaults, then an optional JSON file, then environment
//! (`DATABASE_URL`, `CSV_INGEST_*`). The binary applies its flags last.

use crate::db::PoolSettings;
use crate::db::RetryPolicy;
use crate::error::{IngestError, Result};
use crate::ingestion::{IngestionMode, IngestionOptions, MalformedRecords};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "CSV_INGEST_";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub database_url: Option<String>,
    pub separator: char,
    pub channel_capacity: usize,
    pub malformed_records: MalformedRecords,
    pub mode: IngestionMode,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Whole-run deadline; `None` runs without one.
    pub deadline_secs: Option<u64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            separator: ',',
            channel_capacity: 1024,
            malformed_records: MalformedRecords::Skip,
            mode: IngestionMode::Sequential,
            max_connections: 10,
            acquire_timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 200,
            deadline_secs: None,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| IngestError::Config(format!("invalid value {:?} for {}", raw, key)))
}

impl IngestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            IngestError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|raw| (key, raw))
        };

        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some((key, raw)) = var("SEPARATOR") {
            self.separator = parse_var(&key, &raw)?;
        }
        if let Some((key, raw)) = var("CHANNEL_CAPACITY") {
            self.channel_capacity = parse_var(&key, &raw)?;
        }
        if let Some((key, raw)) = var("MALFORMED_RECORDS") {
            self.malformed_records = match raw.trim().to_lowercase().as_str() {
                "skip" => MalformedRecords::Skip,
                "fail" => MalformedRecords::Fail,
                _ => {
                    return Err(IngestError::Config(format!(
                        "invalid value {:?} for {}",
                        raw, key
                    )))
                }
            };
        }
        if let Some((key, raw)) = var("MODE") {
            self.mode = match raw.trim().to_lowercase().as_str() {
                "sequential" => IngestionMode::Sequential,
                "bulk" => IngestionMode::Bulk,
                _ => {
                    return Err(IngestError::Config(format!(
                        "invalid value {:?} for {}",
                        raw, key
                    )))
                }
            };
        }
        if let Some((key, raw)) = var("MAX_CONNECTIONS") {
            self.max_connections = parse_var(&key, &raw)?;
        }
        if let Some((key, raw)) = var("ACQUIRE_TIMEOUT_SECS") {
            self.acquire_timeout_secs = parse_var(&key, &raw)?;
        }
        if let Some((key, raw)) = var("MAX_RETRIES") {
            self.max_retries = parse_var(&key, &raw)?;
        }
        if let Some((key, raw)) = var("RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = parse_var(&key, &raw)?;
        }
        if let Some((key, raw)) = var("DEADLINE_SECS") {
            self.deadline_secs = Some(parse_var(&key, &raw)?);
        }

        Ok(self)
    }

    /// Separator as the single byte the CSV reader needs.
    pub fn separator_byte(&self) -> Result<u8> {
        if self.separator.is_ascii() {
            Ok(self.separator as u8)
        } else {
            Err(IngestError::Config(format!(
                "separator {:?} is not a single-byte character",
                self.separator
            )))
        }
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| IngestError::Config("DATABASE_URL is not set".to_string()))
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn ingestion_options(&self) -> Result<IngestionOptions> {
        if self.channel_capacity == 0 {
            return Err(IngestError::Config(
                "channel capacity must be at least 1".to_string(),
            ));
        }
        Ok(IngestionOptions {
            mode: self.mode,
            channel_capacity: self.channel_capacity,
            create_table: false,
        })
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}
