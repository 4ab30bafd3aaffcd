//! CSV Connector - Streams trimmed records out of a delimited text file

use crate::error::{IngestError, Result};
use crate::ingestion::connector::{IngestionConnector, Row, RowIter};
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::PathBuf;
use tracing::warn;

/// What to do with a record the parser rejects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedRecords {
    /// Drop the record and log it.
    #[default]
    Skip,
    /// End the stream with the parse error.
    Fail,
}

/// CSV Connector - Reads a delimited file whose first record is the header.
#[derive(Clone, Debug)]
pub struct CsvConnector {
    source_id: String,
    path: PathBuf,
    separator: u8,
    malformed: MalformedRecords,
}

impl CsvConnector {
    pub fn new(path: impl Into<PathBuf>, separator: u8) -> Self {
        let path = path.into();
        let source_id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Self {
            source_id,
            path,
            separator,
            malformed: MalformedRecords::default(),
        }
    }

    pub fn with_malformed_records(mut self, policy: MalformedRecords) -> Self {
        self.malformed = policy;
        self
    }

    fn open(&self) -> Result<csv::Reader<File>> {
        let file = File::open(&self.path)?;
        Ok(ReaderBuilder::new()
            .has_headers(false)
            .delimiter(self.separator)
            .from_reader(file))
    }

    /// Streams data records, skipping the header.
    pub fn read_rows(&self) -> Result<CsvRows> {
        let reader = self.open()?;
        Ok(CsvRows {
            records: reader.into_records(),
            path: self.path.clone(),
            policy: self.malformed,
            position: 0,
            done: false,
        })
    }

    /// Reads only the header record.
    pub fn read_columns(&self) -> Result<Vec<String>> {
        let mut reader = self.open()?;
        let mut record = StringRecord::new();
        if !reader.read_record(&mut record)? {
            return Err(IngestError::Source(format!(
                "{} has no header record",
                self.path.display()
            )));
        }
        Ok(trim_record(&record))
    }
}

fn trim_record(record: &StringRecord) -> Row {
    record.iter().map(|field| field.trim().to_string()).collect()
}

/// Row iterator over one pass of a CSV file. The file is closed on drop.
pub struct CsvRows {
    records: StringRecordsIntoIter<File>,
    path: PathBuf,
    policy: MalformedRecords,
    position: u64,
    done: bool,
}

impl Iterator for CsvRows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let result = self.records.next()?;
            self.position += 1;

            // The first record is the header, parsed or not
            if self.position == 1 {
                continue;
            }

            match result {
                Ok(record) => return Some(Ok(trim_record(&record))),
                Err(err) if err.is_io_error() || self.policy == MalformedRecords::Fail => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
                Err(err) => {
                    warn!(
                        "Skipping malformed record {} in {}: {}",
                        self.position,
                        self.path.display(),
                        err
                    );
                }
            }
        }
    }
}

impl IngestionConnector for CsvConnector {
    fn rows(&self) -> Result<RowIter> {
        Ok(Box::new(self.read_rows()?))
    }

    fn columns(&self) -> Result<Vec<String>> {
        self.read_columns()
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_type(&self) -> &str {
        "csv"
    }
}
