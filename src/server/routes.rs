//! Axum HTTP routes for the status API.

use crate::bulk::{BulkService, BulkState, BulkStatus};
use crate::error::{MigrationError, ServerError, ServerResult};
use crate::migration::MigrationService;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
pub struct AppState {
    pub bulk: Arc<BulkService>,
    pub migrations: Option<Arc<MigrationService>>,
}

/// Body of `GET /bulk/:command_id`
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct BulkStatusView {
    pub total: i64,
    pub processed: u64,
    pub state: BulkState,
}

impl From<BulkStatus> for BulkStatusView {
    fn from(status: BulkStatus) -> Self {
        Self {
            total: status.total,
            processed: status.processed,
            state: status.state,
        }
    }
}

#[derive(Deserialize)]
struct ListParams {
    username: Option<String>,
}

// ─── Route builder ───────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bulk", get(list_statuses))
        .route("/bulk/:command_id", get(get_status))
        .route("/migrations/:migration_id", get(get_migration))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Handlers ────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> ServerResult<impl IntoResponse> {
    let bulk = state.bulk.clone();
    let commands: BTreeMap<&'static str, u64> = blocking(move || bulk.count_by_state())
        .await?
        .into_iter()
        .map(|(command_state, count)| (command_state.as_str(), count))
        .collect();
    let migrations = state
        .migrations
        .as_ref()
        .map(|m| m.migration_ids())
        .unwrap_or_default();

    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commands": commands,
        "migrations": migrations,
    })))
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<String>,
) -> ServerResult<Json<BulkStatusView>> {
    let status = blocking(move || state.bulk.get_status(&command_id)).await?;
    Ok(Json(status.into()))
}

async fn list_statuses(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ServerResult<Json<Vec<BulkStatus>>> {
    let username = params
        .username
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ServerError::InvalidParameter {
            name: "username".into(),
            reason: "required".into(),
        })?;
    let statuses = blocking(move || state.bulk.get_statuses(&username)).await?;
    Ok(Json(statuses))
}

async fn get_migration(
    State(state): State<Arc<AppState>>,
    Path(migration_id): Path<String>,
) -> ServerResult<impl IntoResponse> {
    let Some(migrations) = state.migrations.clone() else {
        return Err(MigrationError::UnknownMigration(migration_id).into());
    };
    // Reading may probe the data on first use
    let view = blocking(move || migrations.get_status(&migration_id)).await?;
    Ok(Json(view))
}

/// Run a store call off the async runtime
async fn blocking<T, F>(f: F) -> ServerResult<T>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServerError::Other(format!("Request task failed: {}", e)))?
        .map_err(ServerError::from)
}

// ─── Server startup ──────────────────────────────────────────────

/// Serve the status API until `shutdown` resolves
pub async fn serve<F>(state: Arc<AppState>, addr: SocketAddr, shutdown: F) -> ServerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Status API shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_view_keeps_three_fields() {
        let mut status = BulkStatus::scheduled("c", "noop", "alice", chrono::Utc::now());
        status.processed = 3;
        let json = serde_json::to_value(BulkStatusView::from(status)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"total": -1, "processed": 3, "state": "SCHEDULED"})
        );
    }
}
