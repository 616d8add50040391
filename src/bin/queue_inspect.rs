use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use clinic_checkin::config;
use clinic_checkin::db::{self, QueueStore};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print the waiting queue and recent notification outcomes"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// How many recent entries to list
    #[arg(long, default_value_t = 20)]
    recent: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = QueueStore::new(pool);

    let waiting = store.list_waiting().await?;
    println!("Waiting ({}):", waiting.len());
    for w in &waiting {
        println!(
            "  #{:<3} id={:<6} {:<24} since {}",
            w.position,
            w.entry.id,
            w.entry.patient_name,
            w.entry.created_at.format("%H:%M:%S")
        );
    }

    println!("Recent entries:");
    for e in store.recent(args.recent).await? {
        println!(
            "  id={:<6} {:<10} sms={:<7} attempts={} {}",
            e.id,
            e.status.as_str(),
            e.notification_state.as_str(),
            e.attempt_count,
            e.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
