use anyhow::{Context, Result};
use gitfund::api::ApiServer;
use gitfund::config::Settings;
use gitfund::store::PgStore;
use gitfund::util::db::Db;
use gitfund::util::env as env_util;
use gitfund::Platform;
use std::sync::Arc;
use tracing::{error, info};

/// Re-runs the sweep on a fixed interval. A failed pass is logged and the
/// next tick tries again.
async fn sweep_loop(platform: Arc<Platform<PgStore>>) {
    let mut ticker = tokio::time::interval(platform.settings.sync.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = platform.run_sweep().await {
            error!(error = %e, "scheduled sweep failed");
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    env_util::init_env();
    gitfund::telemetry::init_tracing("info,sqlx=warn,actix_web=info")?;

    env_util::preflight_check(
        "gitfund",
        &["DATABASE_URL", "API_SECRET", "STRIPE_SECRET_KEY", "STRIPE_WEBHOOK_TOKEN"],
        &["VIES_URL", "MAILJET_API_KEY", "API_HOST", "API_PORT", "AUTO_MIGRATE"],
    )?;

    let settings = Settings::from_env().context("loading settings")?;
    let server = ApiServer::from_env()?;

    let db = Db::connect(&env_util::db_url()?, settings.db_max_connections).await?;
    let platform = Arc::new(Platform::production(settings, db)?);
    info!("platform ready");

    if env_util::env_flag("GITFUND_SWEEP_ENABLED", true) {
        tokio::spawn(sweep_loop(platform.clone()));
    } else {
        info!("background sweep disabled; rely on POST /api/v1/cron/sync");
    }

    server.run(platform).await
}
