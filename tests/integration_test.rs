use csv_ingest::db::{MemoryStore, TableStore, Value};
use csv_ingest::ingestion::{
    CsvConnector, IngestionConnector, IngestionMode, IngestionOptions, IngestionOrchestrator,
    MalformedRecords, TableBuilder,
};
use csv_ingest::IngestError;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Write `content` to `name` inside a fresh temp dir.
fn write_csv(name: &str, content: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    (dir, path)
}

fn options(mode: IngestionMode, create_table: bool) -> IngestionOptions {
    IngestionOptions {
        mode,
        channel_capacity: 2,
        create_table,
    }
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

#[tokio::test]
async fn sequential_run_creates_table_and_trims_values() {
    let (_dir, path) = write_csv("people.csv", "name, age ,male\n Jack ,66, true\nGrace,64,false\n");
    let store = Arc::new(MemoryStore::new());
    let connector = CsvConnector::new(&path, b',');

    let result = IngestionOrchestrator::new(store.clone())
        .ingest(&connector, "people", &options(IngestionMode::Sequential, true))
        .await
        .unwrap();

    assert_eq!(result.records_ingested, 2);
    assert_eq!((result.first_key, result.last_key), (Some(1), Some(2)));
    let key = result.created_key.expect("table was created");
    assert!(key.starts_with("id-"));

    let rows = store.rows("people").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(&key), Some(&Value::Uint64(1)));
    assert_eq!(rows[0].get("name"), Some(&text("Jack")));
    assert_eq!(rows[0].get("male"), Some(&text("true")));
    assert_eq!(rows[1].get("age"), Some(&text("64")));

    let inserts: Vec<String> = store
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("INSERT"))
        .collect();
    assert_eq!(
        inserts[0],
        format!(
            "INSERT INTO `people` (`{}`, `name`, `age`, `male`) VALUES (1, \"Jack\"u, \"66\"u, \"true\"u);",
            key
        )
    );
}

#[tokio::test]
async fn bulk_run_continues_after_sequential_run() {
    let (_dir, path) = write_csv("letters.csv", "letter\na\nb\nc\n");
    let store = Arc::new(MemoryStore::new());
    let orchestrator = IngestionOrchestrator::new(store.clone());
    let connector = CsvConnector::new(&path, b',');

    orchestrator
        .ingest(&connector, "letters", &options(IngestionMode::Sequential, true))
        .await
        .unwrap();
    let bulk = orchestrator
        .ingest(&connector, "letters", &options(IngestionMode::Bulk, true))
        .await
        .unwrap();

    assert_eq!((bulk.first_key, bulk.last_key), (Some(4), Some(6)));
    assert_eq!(store.bulk_upsert_calls(), 1);

    let letters: Vec<Value> = store
        .rows("letters")
        .unwrap()
        .iter()
        .map(|row| row.get("letter").cloned().unwrap())
        .collect();
    assert_eq!(
        letters,
        ["a", "b", "c", "a", "b", "c"].map(text).to_vec()
    );
}

#[tokio::test]
async fn header_only_file_touches_nothing() {
    let (_dir, path) = write_csv("empty.csv", "a,b\n");
    let store = Arc::new(MemoryStore::new());
    TableBuilder::new()
        .create_table(store.as_ref(), "t", &["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    let orchestrator = IngestionOrchestrator::new(store.clone());
    let connector = CsvConnector::new(&path, b',');

    let sequential = orchestrator
        .ingest(&connector, "t", &options(IngestionMode::Sequential, false))
        .await
        .unwrap();
    let bulk = orchestrator
        .ingest(&connector, "t", &options(IngestionMode::Bulk, false))
        .await
        .unwrap();

    assert_eq!(sequential.records_ingested, 0);
    assert_eq!(bulk.records_ingested, 0);
    assert_eq!(bulk.first_key, None);
    assert_eq!(store.bulk_upsert_calls(), 0);
    assert!(store.rows("t").unwrap().is_empty());
}

#[tokio::test]
async fn columns_survive_a_full_pass() {
    let (_dir, path) = write_csv("cols.csv", "name;age;male\nJack;66;true\n");
    let connector = CsvConnector::new(&path, b';');

    let before = connector.columns().unwrap();
    let rows: Vec<_> = connector.rows().unwrap().collect();
    let after = connector.columns().unwrap();

    assert_eq!(before, vec!["name", "age", "male"]);
    assert_eq!(before, after);
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn forbidden_value_stops_sequential_run() {
    let (_dir, path) = write_csv("bad.csv", "v\nok\nnot;ok\nnever\n");
    let store = Arc::new(MemoryStore::new());
    let connector = CsvConnector::new(&path, b',');

    let err = IngestionOrchestrator::new(store.clone())
        .ingest(&connector, "vals", &options(IngestionMode::Sequential, true))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::ForbiddenSymbol(_)));
    assert_eq!(store.rows("vals").unwrap().len(), 1);
}

#[tokio::test]
async fn wider_source_than_table_is_rejected_in_bulk() {
    let (_dir, path) = write_csv("wide.csv", "a,b,c\n1,2,3\n");
    let store = Arc::new(MemoryStore::new());
    TableBuilder::new()
        .create_table(store.as_ref(), "narrow", &["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    let connector = CsvConnector::new(&path, b',');

    let err = IngestionOrchestrator::new(store.clone())
        .ingest(&connector, "narrow", &options(IngestionMode::Bulk, false))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        IngestError::LengthMismatch {
            expected: 2,
            actual: 3
        }
    ));
    assert_eq!(store.bulk_upsert_calls(), 0);
}

#[tokio::test]
async fn malformed_records_follow_policy() {
    let (_dir, path) = write_csv("ragged.csv", "a,b\n1,2\n3\n4,5\n");
    let store = Arc::new(MemoryStore::new());
    let orchestrator = IngestionOrchestrator::new(store.clone());

    let lenient = CsvConnector::new(&path, b',');
    let result = orchestrator
        .ingest(&lenient, "ragged", &options(IngestionMode::Sequential, true))
        .await
        .unwrap();
    assert_eq!(result.records_ingested, 2);

    let strict = CsvConnector::new(&path, b',').with_malformed_records(MalformedRecords::Fail);
    let err = orchestrator
        .ingest(&strict, "ragged", &options(IngestionMode::Bulk, true))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Csv(_)));
    assert_eq!(store.bulk_upsert_calls(), 0);
    assert_eq!(store.rows("ragged").unwrap().len(), 2);
}

#[tokio::test]
async fn missing_source_fails_before_any_write() {
    let store = Arc::new(MemoryStore::new());
    TableBuilder::new()
        .create_table(store.as_ref(), "t", &["a".to_string()])
        .await
        .unwrap();
    let connector = CsvConnector::new("/nonexistent/input.csv", b',');

    let err = IngestionOrchestrator::new(store.clone())
        .ingest(&connector, "t", &options(IngestionMode::Sequential, false))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Io(_)));
    assert_eq!(store.execute_calls(), 0);
    assert!(store.describe_table("t").await.is_ok());
}
