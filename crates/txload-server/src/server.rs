//! Service shell: periodic runner and HTTP surface
//!
//! - `GET /health`: database connectivity
//! - `GET /runs/last`: report of the most recent completed run
//! - `POST /shutdown`: stop the periodic runner and the server

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use crate::error::AppError;
use crate::orchestrator::EtlOrchestrator;
use crate::stats::RunReport;
use crate::store::RecordStore;
use crate::transport::TransportSession;

/// Most recent run report, shared between the runner and the handlers
#[derive(Debug, Clone, Default)]
pub struct LastRun(Arc<RwLock<Option<RunReport>>>);

impl LastRun {
    pub async fn set(&self, report: RunReport) {
        *self.0.write().await = Some(report);
    }

    pub async fn get(&self) -> Option<RunReport> {
        self.0.read().await.clone()
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub last_run: LastRun,
    pub shutdown: CancellationToken,
}

/// Run the pipeline every `interval` until `shutdown` fires.
///
/// The date of each run is produced by `today`. A run in progress when
/// shutdown fires finishes its started files and is still recorded.
pub async fn run_schedule<T, S>(
    orchestrator: Arc<EtlOrchestrator<T, S>>,
    interval: Duration,
    shutdown: CancellationToken,
    last_run: LastRun,
    today: impl Fn() -> chrono::NaiveDate,
) where
    T: TransportSession,
    S: RecordStore,
{
    loop {
        let report = orchestrator.run(&shutdown, today()).await;
        last_run.set(report).await;

        if shutdown.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Periodic runner stopped");
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/runs/last", get(last_run))
        .route("/shutdown", post(shutdown))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Health check handler
async fn health_check(State(state): State<AppState>) -> Result<Response, AppError> {
    sqlx::query("SELECT 1").fetch_one(&state.db).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "database": "connected",
            "shutting_down": state.shutdown.is_cancelled(),
        })),
    )
        .into_response())
}

async fn last_run(State(state): State<AppState>) -> Result<Json<RunReport>, AppError> {
    state
        .last_run
        .get()
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No run has completed yet".to_string()))
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    info!("Shutdown requested over HTTP");
    state.shutdown.cancel();
    (StatusCode::ACCEPTED, Json(json!({ "status": "shutting_down" })))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::stats::{RunInfo, RunStats};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    fn state() -> AppState {
        let db = PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgresql://nobody@127.0.0.1:1/none")
            .unwrap();
        AppState {
            db,
            last_run: LastRun::default(),
            shutdown: CancellationToken::new(),
        }
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_last_run_before_and_after() {
        let state = state();
        let (status, body) = send(router(state.clone()), "GET", "/runs/last").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["status"], 404);

        let report = RunStats::new(5).report(RunInfo::start(NaiveDate::from_ymd_opt(2024, 12, 1).unwrap()), false);
        let run_id = report.run_id.to_string();
        state.last_run.set(report).await;

        let (status, body) = send(router(state), "GET", "/runs/last").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["run_id"], run_id);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_token() {
        let state = state();
        let (status, _) = send(router(state.clone()), "POST", "/shutdown").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_health_without_database() {
        let (status, body) = send(router(state()), "GET", "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["message"], "Database unavailable");
    }
}
