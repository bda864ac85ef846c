//! Health and cron-trigger HTTP surface.
use crate::db::{self, Pool};
use crate::model::DigestStatus;
use crate::scheduler::Scheduler;
use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CRON_KEY_HEADER: &str = "x-cron-key";

pub struct AppState {
    pub pool: Pool,
    pub scheduler: Scheduler,
    pub cron_key: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/cron/digest", post(cron_digest))
        .with_state(state)
}

pub async fn serve(addr: &str, state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "yt-digest-bot",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let pending = db::count_digests_by_status(&state.pool, DigestStatus::Pending)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let failed = db::count_digests_by_status(&state.pool, DigestStatus::Failed)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({
        "status": "healthy",
        "pending_digests": pending,
        "failed_digests": failed,
    })))
}

/// Cron-triggered scheduler tick, authenticated by a shared secret header.
async fn cron_digest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers, &state.cron_key) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        match scheduler.run_tick(Utc::now(), &cancel).await {
            Ok(summary) => info!(
                due = summary.due_subscriptions,
                sent = summary.digests_sent,
                "cron tick complete"
            ),
            Err(err) => error!(?err, "cron tick failed"),
        }
    });

    Ok(Json(json!({"status": "triggered"})))
}

fn authorized(headers: &HeaderMap, cron_key: &str) -> bool {
    headers
        .get(CRON_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|provided| provided == cron_key)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cron_auth_requires_exact_key() {
        let mut headers = HeaderMap::new();
        assert!(!authorized(&headers, "secret"));

        headers.insert(CRON_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(!authorized(&headers, "secret"));

        headers.insert(CRON_KEY_HEADER, HeaderValue::from_static("secret"));
        assert!(authorized(&headers, "secret"));
    }
}
