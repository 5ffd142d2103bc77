use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};

use segment_broadcast::config::{self, RunOverrides};
use segment_broadcast::db;
use segment_broadcast::dispatch::AbortSignal;
use segment_broadcast::provider::MulticastClient;
use segment_broadcast::runner;

#[derive(Debug, Parser)]
#[command(author, version, about = "Deliver segmented campaign broadcasts")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one campaign invocation
    Run {
        /// Campaign key from the config file
        campaign: String,

        /// Compute and log the chunk plan without sending or writing the ledger
        #[arg(long)]
        dry_run: bool,

        /// Send only to this recipient, bypassing all filters
        #[arg(long)]
        test_recipient: Option<String>,

        /// Override the provider batch size for this run
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Same as `run --dry-run`
    Plan {
        campaign: String,
    },
    /// List configured campaigns
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let (campaign, overrides) = match args.command {
        Command::List => {
            for (key, c) in &cfg.campaigns {
                println!(
                    "{key}\tsource={}\twindow={}..{}d\tonce_ever={}",
                    c.source.as_str(),
                    c.window.start_days_ago,
                    c.window.end_days_ago,
                    c.filters.once_ever
                );
            }
            return Ok(());
        }
        Command::Plan { campaign } => (
            campaign,
            RunOverrides {
                dry_run: true,
                ..RunOverrides::default()
            },
        ),
        Command::Run {
            campaign,
            dry_run,
            test_recipient,
            batch_size,
        } => (
            campaign,
            RunOverrides {
                dry_run,
                test_recipient,
                batch_size,
            },
        ),
    };

    let plan = cfg.plan(&campaign, overrides)?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url.clone());
    let pool = db::init_pool(&database_url, cfg.db_timeout()).await?;
    db::run_migrations(&pool).await?;

    let provider = MulticastClient::from_config(&cfg.provider)?;

    let abort = AbortSignal::new();
    let on_signal = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current chunk");
            on_signal.abort();
        }
    });

    info!(campaign = %plan.key, dry_run = plan.dry_run, "starting campaign run");
    match runner::run_campaign(&pool, &provider, &plan, chrono::Utc::now(), &abort).await {
        Ok(summary) => {
            println!("{summary}");
            if summary.batches_failed > 0 {
                warn!(
                    failed_batches = summary.batches_failed,
                    "some chunks failed; they will be retried on the next run"
                );
            }
            Ok(())
        }
        Err(err) => {
            error!(%err, retryable = err.is_retryable(), "campaign run aborted");
            Err(err.into())
        }
    }
}
