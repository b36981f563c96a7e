//! Optional status webserver: a read-only view of the registry for
//! debugging and dashboards.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::app::Application;
use crate::error::AppError;
use crate::registry::SetSnapshot;

#[derive(Debug, Serialize)]
struct MeterReadout {
    #[serde(rename = "Time")]
    time: DateTime<Utc>,
    #[serde(rename = "RunTime")]
    run_time: f64,
    #[serde(rename = "Measurand")]
    measurand: HashMap<String, f64>,
}

pub fn router(app: Arc<Application>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/currentdata", get(current_data))
        .route("/meter/{name}", get(read_meter))
        .with_state(app)
}

pub async fn serve(app: Arc<Application>, port: u16) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status webserver listening");
    axum::serve(listener, router(app))
        .await
        .map_err(AppError::Io)
}

async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Last completed cycle, straight from the registry snapshot.
async fn current_data(State(app): State<Arc<Application>>) -> Json<SetSnapshot> {
    Json(app.meters.snapshot())
}

/// Fresh on-demand read of one meter, bypassing the cycle cadence.
async fn read_meter(
    State(app): State<Arc<Application>>,
    Path(name): Path<String>,
) -> Result<Json<MeterReadout>, StatusCode> {
    let meter = app.meters.get(&name).ok_or(StatusCode::NOT_FOUND)?;

    let started = Instant::now();
    let measurand = meter.read_all().await;
    Ok(Json(MeterReadout {
        time: Utc::now(),
        run_time: started.elapsed().as_secs_f64(),
        measurand,
    }))
}
