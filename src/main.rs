use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meterd::app::Application;
use meterd::config::Config;
use meterd::web;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path = std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/meterd.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(
        meters = cfg.meter.len(),
        period_secs = cfg.time_period,
        "loaded config"
    );

    let app = Arc::new(Application::build(cfg)?);

    if let Some(ws) = app.config.webserver.as_ref().filter(|ws| ws.active) {
        let port = ws.port;
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(app, port).await {
                error!(error = %e, "status webserver failed");
            }
        });
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(app.config.time_period));
    // a slow cycle delays the next tick instead of bursting to catch up
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let sig = tokio::signal::ctrl_c();
    tokio::pin!(sig);
    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                app.run_cycle().await;
            }
        }
    }

    Ok(())
}
