//! The HTTP surface of an agent: health, status, metrics and administrative actions.

use std::time::Duration;

use anyhow::Result;
use axum::extract::{Extension, Path};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{AddExtensionLayer, Json, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::agent::{AdminAction, AdminRequest, AgentHandle};
use crate::config::Config;
use crate::error::AppError;
use crate::get_metrics_recorder;

/// The maximum amount of time to wait on the agent to answer a request.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = (StatusCode, Json<Value>);

/// The body of a drain request.
#[derive(Debug, Deserialize)]
struct DrainBody {
    reason: String,
}

/// Spawns the HTTP server of the given agent.
pub fn spawn_server(config: &Config, agent: AgentHandle, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let prom = get_metrics_recorder(config).handle();
    let app = router(agent).layer(AddExtensionLayer::new(prom));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.http_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("http server is listening at 0.0.0.0:{}", config.http_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Build the router of all agent routes, minus the metrics handle.
pub(crate) fn router(agent: AgentHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_scrape))
        .route("/config/current", get(current_config))
        .route("/config/pending", get(pending_config))
        .route("/actions/reconfigure", post(reconfigure))
        .route("/actions/promote/:name", post(promote))
        .route("/actions/drain/:name", post(drain))
        .layer(AddExtensionLayer::new(agent))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn status(Extension(agent): Extension<AgentHandle>) -> Json<Value> {
    let status = agent.status_rx.borrow().clone();
    Json(json!(status))
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}

async fn current_config(Extension(agent): Extension<AgentHandle>) -> Reply {
    submit(&agent, AdminAction::ShowCurrentConfig).await
}

async fn pending_config(Extension(agent): Extension<AgentHandle>) -> Reply {
    submit(&agent, AdminAction::ShowPendingConfig).await
}

async fn reconfigure(Extension(agent): Extension<AgentHandle>) -> Reply {
    submit(&agent, AdminAction::ForceReconfigure).await
}

async fn promote(Extension(agent): Extension<AgentHandle>, Path(name): Path<String>) -> Reply {
    submit(&agent, AdminAction::PromoteNode(name)).await
}

async fn drain(Extension(agent): Extension<AgentHandle>, Path(name): Path<String>, Json(body): Json<DrainBody>) -> Reply {
    submit(&agent, AdminAction::DrainNode { name, reason: body.reason }).await
}

/// Submit an action to the agent's reaction loop and await its reply.
pub(crate) async fn submit(agent: &AgentHandle, action: AdminAction) -> Reply {
    let (reply, rx) = oneshot::channel();
    if agent.admin_tx.send(AdminRequest { action, reply }).await.is_err() {
        return error_reply(StatusCode::SERVICE_UNAVAILABLE, "agent is shutting down");
    }
    match tokio::time::timeout(ADMIN_TIMEOUT, rx).await {
        Ok(Ok(Ok(value))) => (StatusCode::OK, Json(value)),
        Ok(Ok(Err(err))) => {
            let code = status_code(&err);
            if code == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(error = ?err, "error handling admin request");
            }
            error_reply(code, &err.to_string())
        }
        Ok(Err(_)) => error_reply(StatusCode::SERVICE_UNAVAILABLE, "agent dropped the request"),
        Err(_) => error_reply(StatusCode::SERVICE_UNAVAILABLE, "timeout waiting on the agent"),
    }
}

/// The HTTP status code of the given error.
pub(crate) fn status_code(err: &AppError) -> StatusCode {
    match err {
        AppError::Rejected(_) | AppError::MalformedInput(_) => StatusCode::CONFLICT,
        AppError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Collaborator(_) | AppError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(code: StatusCode, message: &str) -> Reply {
    (code, Json(json!({ "error": message })))
}
