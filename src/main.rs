use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use csv_ingest::db::{MemoryStore, PgStore, TableStore};
use csv_ingest::ingestion::{
    CsvConnector, IngestionConnector, IngestionMode, IngestionOrchestrator, IngestionResult,
    MalformedRecords, TableBuilder,
};
use csv_ingest::IngestConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "csv-ingest")]
#[command(about = "Load CSV files into tables keyed by a synthetic id")]
struct Cli {
    /// Database connection string (or set DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Field separator, one ASCII character (default: ,)
    #[arg(short, long, global = true)]
    separator: Option<char>,

    /// Abort the command after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// JSON config file, applied before the environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the header columns of a CSV file
    Columns { csv: PathBuf },

    /// Create a table with a fresh key column
    CreateTable {
        table: String,

        /// Take the columns from this file's header
        #[arg(required_unless_present = "columns", conflicts_with = "columns")]
        csv: Option<PathBuf>,

        /// Comma separated column names
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
    },

    /// Insert every data record of a CSV file into a table
    Ingest {
        table: String,

        csv: PathBuf,

        /// Write all rows with one bulk upsert
        #[arg(long)]
        bulk: bool,

        /// Create the table from the header if it does not exist
        #[arg(long)]
        create: bool,

        /// Fail on the first malformed record instead of skipping it
        #[arg(long)]
        strict: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        /// Run against an in-memory table and print the generated statements
        #[arg(long)]
        dry_run: bool,
    },
}

fn build_config(cli: &Cli) -> Result<IngestConfig> {
    let mut config = match &cli.config {
        Some(path) => IngestConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?
            .with_overrides(|key| std::env::var(key).ok())?,
        None => IngestConfig::from_env()?,
    };

    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(separator) = cli.separator {
        config.separator = separator;
    }
    if let Some(secs) = cli.timeout_secs {
        config.deadline_secs = Some(secs);
    }
    Ok(config)
}

async fn connect(config: &IngestConfig) -> Result<Arc<dyn TableStore>> {
    let store = PgStore::connect(config.database_url()?, &config.pool_settings())
        .await
        .context("connecting to the database")?
        .with_retry_policy(config.retry_policy());
    Ok(Arc::new(store))
}

fn report(result: &IngestionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("Run:      {}", result.run_id);
    println!("Table:    {}", result.table);
    println!("Rows:     {}", result.records_ingested);
    if let (Some(first), Some(last)) = (result.first_key, result.last_key) {
        println!("Keys:     {}..={}", first, last);
    }
    if let Some(key) = &result.created_key {
        println!("Created:  key column {}", key);
    }
    Ok(())
}

async fn run(command: Command, config: IngestConfig) -> Result<()> {
    match command {
        Command::Columns { csv } => {
            let connector = CsvConnector::new(csv, config.separator_byte()?);
            for column in connector.columns()? {
                println!("{}", column);
            }
        }

        Command::CreateTable {
            table,
            csv,
            columns,
        } => {
            let columns = match (csv, columns) {
                (_, Some(columns)) => columns,
                (Some(csv), None) => CsvConnector::new(csv, config.separator_byte()?).columns()?,
                (None, None) => return Err(anyhow!("either a CSV file or --columns is required")),
            };
            let store = connect(&config).await?;
            let key = TableBuilder::new()
                .create_table(store.as_ref(), &table, &columns)
                .await?;
            println!("{}", key);
        }

        Command::Ingest {
            table,
            csv,
            bulk,
            create,
            strict,
            json,
            dry_run,
        } => {
            let malformed = if strict {
                MalformedRecords::Fail
            } else {
                config.malformed_records
            };
            let connector = CsvConnector::new(csv, config.separator_byte()?)
                .with_malformed_records(malformed);

            let mut options = config.ingestion_options()?;
            if bulk {
                options.mode = IngestionMode::Bulk;
            }
            options.create_table = create || dry_run;

            let result = if dry_run {
                info!("Dry run: writing {} into memory", table);
                let store = Arc::new(MemoryStore::new());
                let result = IngestionOrchestrator::new(store.clone())
                    .ingest(&connector, &table, &options)
                    .await?;
                for statement in store.statements() {
                    println!("{}", statement);
                }
                result
            } else {
                let store = connect(&config).await?;
                IngestionOrchestrator::new(store)
                    .ingest(&connector, &table, &options)
                    .await?
            };

            report(&result, json)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let deadline = config.deadline();

    let work = run(cli.command, config);
    match deadline {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| anyhow!("timed out after {}s", limit.as_secs()))?,
        None => work.await,
    }
}
