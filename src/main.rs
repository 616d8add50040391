use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use clinic_checkin::sms::{SmsGateway, TwilioClient};
use clinic_checkin::{app, config, db, handlers};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let gateway: Option<Arc<dyn SmsGateway>> = match cfg.sms_credentials() {
        Some(creds) => match TwilioClient::from_credentials(&creds) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                error!(?err, "sms gateway misconfigured; tracking texts disabled");
                None
            }
        },
        None => None,
    };

    let services = app::build_services(&cfg, pool.clone(), gateway);
    let router = handlers::router(services.state);

    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind_addr))?;
    info!(addr = %cfg.app.bind_addr, "starting check-in server");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(?err, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
        })
        .await?;

    // The router (and every dispatcher handle) is gone; let deliveries drain.
    if let Some(task) = services.dispatcher_task {
        if tokio::time::timeout(Duration::from_secs(30), task).await.is_err() {
            warn!("notification dispatcher did not drain in time");
        }
    }
    pool.close().await;
    Ok(())
}
