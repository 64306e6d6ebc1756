use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dlcount_sync::{ReconcileConfig, RunSummary};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "dlcount")]
#[command(about = "Download count reconciler")]
struct Cli {
    /// Site build directory that receives the count files.
    #[arg(long, global = true)]
    dest: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fold settled days into the archives and regenerate outputs.
    Archive,
    /// Regenerate outputs from the archives.
    Build {
        /// Skip fetching the not-yet-archived recent days.
        #[arg(long)]
        no_topup: bool,
    },
    /// Create empty archives with watermarks the day before `since`.
    Init {
        #[arg(long)]
        since: NaiveDate,
    },
    /// Write the GA4 property's metric and dimension listings.
    Metadata {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn print_summary(summary: &RunSummary) {
    if summary.is_skipped() {
        println!("nothing to do: archives are up to date (run_id={})", summary.run_id);
        return;
    }
    println!(
        "{:?} run complete: run_id={} content_paths={} content_total={} links={} unresolved_urls={} files_written={} report={}",
        summary.mode,
        summary.run_id,
        summary.content_paths,
        summary.content_total,
        summary.link_keys,
        summary.unresolved_urls,
        summary.files_written,
        summary.report_dir.as_deref().unwrap_or("-"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,dlcount=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Archive) {
        Commands::Archive => {
            let summary = dlcount_sync::run_archive_from_env(cli.dest).await?;
            print_summary(&summary);
        }
        Commands::Build { no_topup } => {
            let summary = dlcount_sync::run_build_from_env(cli.dest, !no_topup).await?;
            print_summary(&summary);
        }
        Commands::Init { since } => {
            let config = ReconcileConfig::from_env()?;
            let written = dlcount_sync::init_data_dir(&config, since).await?;
            for path in written {
                println!("created {}", path.display());
            }
        }
        Commands::Metadata { dir } => {
            let config = ReconcileConfig::from_env()?;
            for path in dlcount_sync::write_property_metadata(&config, &dir).await? {
                println!("wrote {}", path.display());
            }
        }
        Commands::Report { runs } => {
            let config = ReconcileConfig::from_env()?;
            println!("{}", dlcount_sync::report_recent_runs(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
