use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use segment_broadcast::config;
use segment_broadcast::db;
use segment_broadcast::model::CampaignKey;

#[derive(Parser, Debug)]
#[command(author, version, about = "Print roster ledger totals")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Show the most common pending errors for this campaign
    #[arg(long)]
    campaign: Option<String>,

    /// Number of error rows to show
    #[arg(long, default_value = "10")]
    top: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url.clone());
    let pool = db::init_pool(&database_url, cfg.db_timeout()).await?;
    db::run_migrations(&pool).await?;

    println!("campaign\ttotal\tsent\tpending\tpending_with_error");
    for s in db::campaign_stats(&pool).await? {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            s.campaign_key, s.total, s.sent, s.pending, s.pending_with_error
        );
    }

    if let Some(raw) = args.campaign {
        let key = CampaignKey::parse(&raw)?;
        println!();
        println!("pending errors for {key}:");
        for (error, count) in db::error_breakdown(&pool, &key, args.top).await? {
            println!("  {count:>6}  {error}");
        }
    }
    Ok(())
}
