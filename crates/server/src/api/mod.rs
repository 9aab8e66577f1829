use crate::config::{AppState, Engine, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flowpilot_core::EngineError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the engine and the API server; returns after a ctrl-c shutdown
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let mut engine = Engine::new(&config)?;
    let recovered = engine.state.orchestrator.recover().await?;
    if !recovered.is_empty() {
        tracing::info!(
            "Re-dispatched {} step executions left over from a previous run",
            recovered.len()
        );
    }
    let background = engine.spawn_background();

    let app = create_router(engine.state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in background {
        handle.abort();
    }
    engine.event_log.flush_all().await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route("/api/workflows/{workflow_id}", get(handlers::get_workflow))
        .route(
            "/api/workflows/{workflow_id}/executions",
            post(handlers::trigger_execution).get(handlers::list_executions),
        )
        .route("/api/executions/{execution_id}", get(handlers::get_execution))
        .route(
            "/api/executions/{execution_id}/events",
            get(handlers::get_execution_events),
        )
        .route(
            "/api/executions/{execution_id}/cancel",
            post(handlers::cancel_execution),
        )
        .route(
            "/api/executions/{execution_id}/pause",
            post(handlers::pause_execution),
        )
        .route(
            "/api/executions/{execution_id}/resume",
            post(handlers::resume_execution),
        )
        .route(
            "/api/step-executions/{step_execution_id}/complete",
            post(handlers::complete_step),
        )
        .route(
            "/api/step-executions/{step_execution_id}/fail",
            post(handlers::fail_step),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "flowpilot",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Error type for API handlers; engine errors pick their own status code
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<EngineError>() {
            Some(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Some(e) if e.is_graph_error() => StatusCode::UNPROCESSABLE_ENTITY,
            Some(e) if e.is_invalid_state() => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_msg = self.0.to_string();
        let details = self
            .0
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        if status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.0);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, error_msg);
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
