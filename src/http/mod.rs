use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppContext;
use crate::blocking::{SessionError, SessionSnapshot};
use crate::poller::InstanceStatus;
use crate::waits::{Snapshot, TopWaits};

const DEFAULT_TOP_N: usize = 5;

pub fn create_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/instances", get(get_instances))
        .route("/instances/:key/waits/last", get(get_last))
        .route("/instances/:key/waits/history", get(get_history))
        .route("/instances/:key/waits/top", get(get_top))
        .route("/instances/:key/sessions", get(get_sessions));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn get_healthz(State(ctx): State<AppContext>) -> StatusCode {
    if ctx.repository.is_open().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    if let Some(stats) = ctx.repository.journal_stats() {
        ctx.metrics.set_journal_stats(stats);
    }
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct InstanceView {
    #[serde(flatten)]
    instance: InstanceStatus,
    /// Seconds since the last snapshot was emitted, when one was.
    stale_seconds: Option<i64>,
}

fn instance_view(instance: InstanceStatus, now: DateTime<Utc>) -> InstanceView {
    let stale_seconds = instance
        .status
        .as_ref()
        .and_then(|status| status.last_emit_at)
        .map(|emitted| (now - emitted).num_seconds().max(0));
    InstanceView {
        instance,
        stale_seconds,
    }
}

async fn get_instances(State(ctx): State<AppContext>) -> Json<Vec<InstanceView>> {
    let now = ctx.registry.context().clock.now();
    Json(
        ctx.registry
            .statuses()
            .into_iter()
            .map(|instance| instance_view(instance, now))
            .collect(),
    )
}

/// Configured instances and instances with replayed history are both readable.
async fn ensure_known(ctx: &AppContext, key: &str) -> Result<(), StatusCode> {
    if ctx.registry.contains(key) || ctx.repository.keys().await.iter().any(|k| k == key) {
        Ok(())
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn get_last(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
) -> Result<Json<Snapshot>, StatusCode> {
    ensure_known(&ctx, &key).await?;
    Ok(Json(ctx.repository.last(&key).await))
}

async fn get_history(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
) -> Result<Json<Vec<Snapshot>>, StatusCode> {
    ensure_known(&ctx, &key).await?;
    Ok(Json(ctx.repository.values(&key).await))
}

#[derive(Debug, Deserialize)]
struct TopParams {
    n: Option<usize>,
}

async fn get_top(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
    Query(params): Query<TopParams>,
) -> Result<Json<TopWaits>, StatusCode> {
    ensure_known(&ctx, &key).await?;
    let n = params.n.unwrap_or(DEFAULT_TOP_N);
    Ok(Json(ctx.repository.top(&key, n).await))
}

async fn get_sessions(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    match ctx.sessions.get(&key).await {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(err @ SessionError::UnknownInstance(_)) => Err((StatusCode::NOT_FOUND, err.to_string())),
        Err(err) => {
            warn!(key = %key, error = %err, "session listing failed");
            Err((StatusCode::BAD_GATEWAY, err.to_string()))
        }
    }
}
