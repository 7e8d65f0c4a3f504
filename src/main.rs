use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, miette};
use payrecon::application::Services;
use payrecon::application::distribution::Distributor;
use payrecon::application::pipeline::{CancelFlag, ImportPipeline};
use payrecon::config::Config;
use payrecon::domain::batch::BatchStatus;
use payrecon::domain::payment::DateRange;
use payrecon::domain::ports::Stores;
use payrecon::infrastructure::distribution::{
    FileSystemStorage, JsonDocumentRenderer, LoggingEmailClient,
};
use payrecon::infrastructure::in_memory::{InMemoryPaymentSource, in_memory_stores};
#[cfg(feature = "storage-rocksdb")]
use payrecon::infrastructure::rocksdb::RocksDBStore;
use payrecon::interfaces::csv::payment_reader::{PaymentReader, parse_timestamp};
use payrecon::interfaces::csv::report_writer::ReportWriter;
use payrecon::interfaces::json::load_registrations;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON policy file. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Registration snapshot (JSON array) loaded before the command runs.
    #[arg(long, global = true)]
    registrations: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a gateway payment export and reconcile it.
    Import {
        /// Payments CSV file
        #[arg(long)]
        payments: PathBuf,
        /// Only payments at or after this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_from)]
        from: Option<DateTime<Utc>>,
        /// Only payments at or before this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_to)]
        to: Option<DateTime<Utc>>,
        /// Source label recorded on the batch; defaults to the file name
        #[arg(long)]
        source: Option<String>,
        /// Report what would happen without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Render issued invoices into this directory
        #[arg(long)]
        documents: Option<PathBuf>,
    },
    /// Inspect and adjudicate the review queue.
    Review {
        #[command(subcommand)]
        action: ReviewCommand,
    },
    /// Move records pending past the expiry age to the failed store.
    Expire,
    /// Re-run matching on pending records.
    Recheck,
    /// Transaction sequence administration.
    Sequence {
        #[command(subcommand)]
        action: SequenceCommand,
    },
}

#[derive(Subcommand)]
enum ReviewCommand {
    /// List pending records, oldest first
    List,
    /// Match a pending payment to a registration and issue its invoices
    Accept {
        payment_id: String,
        registration_id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Reject a pending payment
    Reject {
        payment_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
}

#[derive(Subcommand)]
enum SequenceCommand {
    /// Allocate and print the next transaction id
    Next,
    /// Reset the counter so the next allocation returns VALUE + 1
    Reset { value: u64 },
}

fn parse_from(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_bound(raw, false)
}

fn parse_to(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_bound(raw, true)
}

fn parse_bound(raw: &str, end_of_day: bool) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(at) = parse_timestamp(raw) {
        return Ok(at);
    }
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("expected RFC 3339 or YYYY-MM-DD, got '{raw}'"))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| format!("invalid date '{raw}'"))
}

fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => Ok(RocksDBStore::open(path).into_diagnostic()?.stores()),
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(in_memory_stores())
        }
        None => Ok(in_memory_stores()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).into_diagnostic()?;
    let stores = open_stores(cli.db_path)?;

    if let Some(path) = &cli.registrations {
        let registrations = load_registrations(path).into_diagnostic()?;
        let count = registrations.len();
        for registration in registrations {
            stores
                .registrations
                .upsert(registration)
                .await
                .into_diagnostic()?;
        }
        info!(count, "Registrations loaded");
    }

    let services = Services::new(&stores, &config);
    let stdout = io::stdout();

    match cli.command {
        Command::Import {
            payments,
            from,
            to,
            source,
            dry_run,
            documents,
        } => {
            let source_name = source.unwrap_or_else(|| {
                payments
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "csv".to_string())
            });
            let file = File::open(&payments).into_diagnostic()?;
            let mut records = Vec::new();
            for result in PaymentReader::new(file).payments() {
                match result {
                    Ok(payment) => records.push(payment),
                    Err(e) => warn!(error = %e, "Skipping unreadable payment row"),
                }
            }
            let adapter = Arc::new(InMemoryPaymentSource::new(
                source_name,
                records,
                config.pipeline.page_size,
            ));

            let mut pipeline =
                ImportPipeline::new(adapter, &stores, &services, config.pipeline.clone());
            if let Some(dir) = documents {
                pipeline = pipeline.with_distributor(Distributor::new(
                    Arc::new(JsonDocumentRenderer),
                    Arc::new(FileSystemStorage::new(dir)),
                    Arc::new(LoggingEmailClient),
                    config.pipeline.distribution_retries,
                    config.pipeline.retry_backoff(),
                ));
            }

            let range = DateRange { from, to };
            let mut writer = ReportWriter::new(stdout.lock());
            if dry_run {
                let lines = pipeline.dry_run(range).await.into_diagnostic()?;
                writer.write_dry_run(&lines).into_diagnostic()?;
                return Ok(());
            }

            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            let batch = pipeline.run(range, &cancel).await.into_diagnostic()?;
            writer.write_batch(&batch).into_diagnostic()?;
            if batch.status == BatchStatus::Failed {
                return Err(miette!(
                    "import batch {} failed: {}",
                    batch.batch_id,
                    batch.error.unwrap_or_default()
                ));
            }
        }
        Command::Review { action } => match action {
            ReviewCommand::List => {
                let pending = services.queue.list().await.into_diagnostic()?;
                ReportWriter::new(stdout.lock())
                    .write_pending(&pending)
                    .into_diagnostic()?;
            }
            ReviewCommand::Accept {
                payment_id,
                registration_id,
                actor,
            } => {
                let pair = services
                    .queue
                    .accept(&payment_id, &registration_id, &actor)
                    .await
                    .into_diagnostic()?;
                println!(
                    "{},{},{},{}",
                    pair.payment_id,
                    pair.customer.invoice_number,
                    pair.supplier.invoice_number,
                    pair.customer.total
                );
            }
            ReviewCommand::Reject {
                payment_id,
                reason,
                actor,
            } => {
                let failed = services
                    .queue
                    .reject(&payment_id, &reason, &actor)
                    .await
                    .into_diagnostic()?;
                println!("{},rejected,{}", failed.record.id(), failed.reason);
            }
        },
        Command::Expire => {
            let expired = services.queue.expire(Utc::now()).await.into_diagnostic()?;
            println!("expired,{}", expired.len());
        }
        Command::Recheck => {
            let summary = services.queue.recheck(Utc::now()).await.into_diagnostic()?;
            println!("resolved,still_pending,failed");
            println!(
                "{},{},{}",
                summary.resolved, summary.still_pending, summary.failed
            );
        }
        Command::Sequence { action } => match action {
            SequenceCommand::Next => {
                let id = services.transactions.next().await.into_diagnostic()?;
                println!("{id}");
            }
            SequenceCommand::Reset { value } => {
                services
                    .transactions
                    .reset_sequence(value)
                    .await
                    .into_diagnostic()?;
                println!("{value}");
            }
        },
    }

    Ok(())
}
