mod db;
mod discovery;
mod dispatcher;
mod fetcher;
mod jobs;
mod parser;
mod processor;
mod settings;

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use crate::discovery::{DiscoverOptions, HttpListing};
use crate::dispatcher::DispatchOptions;
use crate::fetcher::HttpFetcher;
use crate::jobs::DocType;
use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "legal_crawler", about = "Legal document crawler and article parser")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Walk listing pages and queue ids not seen before
    Discover {
        #[arg(value_enum)]
        doc_type: DocType,
        #[arg(long, default_value = "1")]
        start_page: u32,
        /// Last page to scan (default: start page + 100)
        #[arg(long)]
        end_page: Option<u32>,
        /// Stop a page range after this many empty pages in a row
        #[arg(long, default_value = "3")]
        max_empty: u32,
        /// Page ranges scanned in parallel
        #[arg(short, long, default_value = "4")]
        workers: usize,
    },
    /// Fetch one batch of pending jobs
    Process {
        #[arg(value_enum)]
        doc_type: DocType,
        #[arg(short, long, default_value = "100")]
        batch_size: usize,
        #[arg(long, default_value = "3")]
        max_retries: u32,
        #[arg(short, long, default_value = "8")]
        workers: usize,
    },
    /// Split fetched documents into articles
    Parse {
        #[arg(long, value_enum, default_value_t = DocType::Law)]
        doc_type: DocType,
        /// Max documents to parse (default: all unparsed)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Parse documents again even if they were parsed before
        #[arg(long)]
        reparse: bool,
    },
    /// Reset permanently failed jobs to pending
    Requeue {
        #[arg(value_enum)]
        doc_type: DocType,
        /// Only this id (default: every failed job of the type)
        #[arg(long)]
        id: Option<String>,
    },
    /// Show job and article counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect(&settings.database_path)?;
            db::init_schema(&conn)?;
            println!("Schema ready at {}", settings.database_path.display());
            Ok(())
        }
        Commands::Discover {
            doc_type,
            start_page,
            end_page,
            max_empty,
            workers,
        } => {
            if doc_type == DocType::Qa {
                anyhow::bail!("qa documents have no listing pages; queue their ids directly");
            }
            let conn = db::connect(&settings.database_path)?;
            db::init_schema(&conn)?;
            drop(conn);

            let source = Arc::new(HttpListing::new(fetcher::build_client(&settings)?));
            let opts = DiscoverOptions {
                max_empty_pages: max_empty,
                workers,
                page_delay: Duration::from_millis(settings.page_delay_ms),
            };
            let new_ids = discovery::discover(
                &settings.database_path,
                source,
                doc_type,
                start_page,
                end_page,
                &opts,
            )
            .await?;
            println!("Queued {} new {} ids.", new_ids, doc_type);
            Ok(())
        }
        Commands::Process {
            doc_type,
            batch_size,
            max_retries,
            workers,
        } => {
            let conn = db::connect(&settings.database_path)?;
            db::init_schema(&conn)?;
            drop(conn);

            let fetcher = Arc::new(HttpFetcher::new(fetcher::build_client(&settings)?));
            let opts = DispatchOptions {
                batch_size,
                max_retries,
                workers,
                max_error_chars: settings.error_log_chars,
            };
            let report =
                dispatcher::process_pending(&settings.database_path, fetcher, doc_type, &opts)
                    .await?;
            if report.claimed == 0 {
                println!("No pending {} jobs. Run 'discover' first or all jobs are done.", doc_type);
                return Ok(());
            }
            println!(
                "Done: {} claimed, {} ok, {} will retry, {} failed for good, {} skipped.",
                report.claimed, report.succeeded, report.retrying, report.failed, report.skipped,
            );
            if report.lost > 0 {
                println!("{} outcomes could not be recorded; see the log.", report.lost);
            }
            Ok(())
        }
        Commands::Parse {
            doc_type,
            limit,
            reparse,
        } => {
            let conn = db::connect(&settings.database_path)?;
            db::init_schema(&conn)?;
            let counts = processor::process_documents(
                &conn,
                doc_type,
                limit,
                reparse,
                settings.error_log_chars,
            )?;
            if counts.documents == 0 {
                println!("No unparsed {} documents. Run 'process' first.", doc_type);
                return Ok(());
            }
            counts.print();
            Ok(())
        }
        Commands::Requeue { doc_type, id } => {
            let conn = db::connect(&settings.database_path)?;
            db::init_schema(&conn)?;
            let n = db::requeue_failed(&conn, doc_type, id.as_deref())?;
            println!("Requeued {} failed {} jobs.", n, doc_type);
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&settings.database_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!(
                "{:<9} | {:>7} | {:>7} | {:>8} | {:>7} | {:>7}",
                "Type", "Total", "Pending", "Retrying", "Success", "Failed"
            );
            println!("{}", "-".repeat(60));
            for (doc_type, t) in &s.per_type {
                println!(
                    "{:<9} | {:>7} | {:>7} | {:>8} | {:>7} | {:>7}",
                    doc_type.as_str(), t.total, t.pending, t.retrying, t.success, t.failed
                );
            }
            println!();
            println!("Documents:      {}", s.documents);
            println!("Articles:       {}", s.articles);
            println!("Parse failures: {}", s.parse_failures);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn process_defaults() {
        let cli = Cli::try_parse_from(["legal_crawler", "process", "judgment"]).unwrap();
        match cli.command {
            Commands::Process {
                doc_type,
                batch_size,
                max_retries,
                workers,
            } => {
                assert_eq!(doc_type, DocType::Judgment);
                assert_eq!((batch_size, max_retries, workers), (100, 3, 8));
            }
            _ => panic!("expected process"),
        }
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
