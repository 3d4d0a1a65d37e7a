//! HTTP surface: batch ingest, search, eventual delete, storage
//! management, and password-gated graceful shutdown.

use crate::config::Config;
use crate::engine::Engine;
use crate::model::{DeleteQuery, LogBatch, SearchQuery, ShutdownRequest, StorageRequest, Value};
use crate::{Error, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiState {
    engine: Arc<Engine>,
    password: String,
    shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(engine: Arc<Engine>, password: String, shutdown: CancellationToken) -> ApiState {
        ApiState {
            engine,
            password,
            shutdown,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/logs", post(post_logs).delete(delete_logs))
        .route("/logs/search", post(search_logs))
        .route("/storages", get(get_storages))
        .route("/storage", post(post_storage).delete(delete_storage))
        .route("/shutdown", post(post_shutdown))
        .with_state(state)
}

/// How long in-flight requests get to finish once shutdown starts.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Serve the API until shutdown is requested or the process receives
/// Ctrl-C; either way the listener drains gracefully, bounded by
/// [`DRAIN_TIMEOUT`], and the engine's background loops stop.
pub async fn serve(engine: Arc<Engine>, config: &Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let state = ApiState::new(
        Arc::clone(&engine),
        config.password.clone(),
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    info!(port = config.port, "server listening");

    // Fold Ctrl-C into the shutdown token so one signal drives the drain.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let server = axum::serve(listener, router(state)).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    });

    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(DRAIN_TIMEOUT).await;
        } => {
            warn!("drain timeout reached; closing with requests in flight");
        }
    }

    engine.shutdown();
    info!("server closed");
    Ok(())
}

fn error_response(error: &Error) -> Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
        "Server error".to_string()
    } else {
        error.to_string()
    };
    (status, Json(serde_json::json!({ "error": body }))).into_response()
}

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(serde_json::json!({ "message": text }))).into_response()
}

fn respond(result: Result<()>, status: StatusCode, text: &str) -> Response {
    match result {
        Ok(()) => message(status, text),
        Err(e) => error_response(&e),
    }
}

async fn post_logs(State(state): State<ApiState>, Json(batch): Json<LogBatch>) -> Response {
    if let Err(e) = batch.validate() {
        return error_response(&e);
    }
    respond(
        state.engine.write_logs(batch.storage, batch.logs).await,
        StatusCode::CREATED,
        "Logs saved",
    )
}

async fn search_logs(State(state): State<ApiState>, Json(query): Json<SearchQuery>) -> Response {
    match state.engine.search(query).await {
        Ok(rows) => {
            let body: Vec<Vec<serde_json::Value>> = rows
                .iter()
                .map(|row| row.iter().map(Value::to_json).collect())
                .collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn delete_logs(State(state): State<ApiState>, Json(query): Json<DeleteQuery>) -> Response {
    if let Err(e) = query.validate() {
        return error_response(&e);
    }
    respond(
        state.engine.delete_logs(query).await,
        StatusCode::OK,
        "Logs will be deleted",
    )
}

async fn get_storages(State(state): State<ApiState>) -> Response {
    (StatusCode::OK, Json(state.engine.storages())).into_response()
}

async fn post_storage(
    State(state): State<ApiState>,
    Json(request): Json<StorageRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return error_response(&e);
    }
    respond(
        state.engine.create_storage(&request.storage),
        StatusCode::CREATED,
        "Storage created",
    )
}

async fn delete_storage(
    State(state): State<ApiState>,
    Json(request): Json<StorageRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return error_response(&e);
    }
    respond(
        state.engine.drop_storage(&request.storage),
        StatusCode::OK,
        "Storage deleted",
    )
}

async fn post_shutdown(
    State(state): State<ApiState>,
    Json(request): Json<ShutdownRequest>,
) -> Response {
    if request.password != state.password {
        return error_response(&Error::Forbidden("Incorrect password".to_string()));
    }
    state.shutdown.cancel();
    message(StatusCode::OK, "Server shutdown")
}
