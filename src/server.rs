//! HTTP API: task submission, result polling, and service status

use crate::page::index_page;
use crate::{
    ChallengeSolver, PoolStats, SolveRequest, SolverError, TaskCounts, TaskId, TaskRecord,
    NOT_READY,
};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Shared application state
pub struct AppState {
    pub solver: Arc<ChallengeSolver>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(solver: Arc<ChallengeSolver>) -> Self {
        Self {
            solver,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/turnstile", get(submit_task))
        .route("/result", get(get_result))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Turnstile solver API listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "status": "error", "error": message.into() })),
    )
        .into_response()
}

impl IntoResponse for SolverError {
    fn into_response(self) -> Response {
        let status = match &self {
            SolverError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitParams {
    pub url: Option<String>,
    pub sitekey: Option<String>,
    pub action: Option<String>,
    pub cdata: Option<String>,
    pub proxy: Option<String>,
    pub useragent: Option<String>,
}

impl SubmitParams {
    /// Check the required parameters and build the solve request.
    pub fn into_request(self) -> Result<SolveRequest, SolverError> {
        let url = self.url.filter(|u| !u.is_empty());
        let sitekey = self.sitekey.filter(|s| !s.is_empty());
        let (Some(url), Some(sitekey)) = (url, sitekey) else {
            return Err(SolverError::Validation(
                "Both 'url' and 'sitekey' are required".to_string(),
            ));
        };
        if let Err(e) = url::Url::parse(&url) {
            return Err(SolverError::Validation(format!("Invalid url '{url}': {e}")));
        }

        Ok(SolveRequest {
            url,
            sitekey,
            action: self.action,
            cdata: self.cdata,
            proxy: self.proxy,
            user_agent: self.useragent,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SubmitParams>,
) -> Result<Response, SolverError> {
    let request = params.into_request()?;

    let task_id = TaskId::generate();
    state.solver.store().create(&task_id).await;
    state.solver.spawn(task_id.clone(), request);
    crate::metrics::record_submission();
    debug!("Request completed with taskid {}.", task_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            task_id: task_id.to_string(),
        }),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ResultParams {
    pub id: Option<String>,
}

async fn get_result(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ResultParams>,
) -> Result<Response, SolverError> {
    let record = params
        .id
        .map(TaskId::from)
        .and_then(|id| state.solver.store().get(&id))
        .ok_or_else(|| SolverError::Validation("Invalid task ID/Request parameter".to_string()))?;

    Ok(match record {
        TaskRecord::Pending => (StatusCode::OK, NOT_READY).into_response(),
        record @ TaskRecord::Failed { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, Json(record.to_entry())).into_response()
        }
        record => (StatusCode::OK, Json(record.to_entry())).into_response(),
    })
}

async fn index() -> Html<&'static str> {
    Html(index_page())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pool: PoolStats,
    pub tasks: TaskCounts,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pool = state.solver.pool().get_stats().await;
    Json(HealthResponse {
        status: if pool.available > 0 { "healthy" } else { "busy" },
        pool,
        tasks: state.solver.store().counts(),
    })
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "metrics are disabled"),
    }
}
