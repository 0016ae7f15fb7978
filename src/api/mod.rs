//! HTTP API for deposit ingestion, intent status and history

use crate::config::ApiConfig;
use crate::coordination::{DispersalOrchestrator, TaskRecord};
use crate::error::{DisperserError, DisperserResult};
use crate::events::{is_address, is_tx_hash, DepositEvent};
use crate::intent::{ChainDispersalStatus, DepositIntent, IntentStatus};
use crate::state::{IntentStats, ListFilter, MAX_PAGE_SIZE};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<DispersalOrchestrator>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/event", post(post_event))
        .route("/status/:intent_id", get(get_status))
        .route("/history", get(get_history))
        .route("/stats", get(get_stats))
        .route("/tasks", get(get_tasks))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server until `shutdown` resolves
pub async fn run_server(
    config: ApiConfig,
    orchestrator: Arc<DispersalOrchestrator>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> DisperserResult<()> {
    let app = router(AppState { orchestrator });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| DisperserError::Internal(format!("API bind to {} failed: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| DisperserError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Error body `{error, code}`
struct ApiError {
    status: StatusCode,
    error: String,
    code: &'static str,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: message.into(),
            code: "VALIDATION_ERROR",
        }
    }
}

impl From<DisperserError> for ApiError {
    fn from(err: DisperserError) -> Self {
        let status = match &err {
            DisperserError::Validation(_) => StatusCode::BAD_REQUEST,
            DisperserError::IntentNotFound { .. } => StatusCode::NOT_FOUND,
            DisperserError::StoreConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", err);
        }

        Self {
            status,
            error: match &err {
                DisperserError::Validation(message) => message.clone(),
                other => other.to_string(),
            },
            code: err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.error,
                code: self.code,
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the store is reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.orchestrator.store().health_check().await.is_ok();
    let body = ReadinessResponse {
        ready: store_ok,
        store: store_ok,
        outstanding_tasks: state.orchestrator.supervisor().outstanding(),
    };

    if store_ok {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Ingest one deposit event
async fn post_event(
    State(state): State<AppState>,
    payload: Result<Json<DepositEvent>, JsonRejection>,
) -> Result<Json<PostEventResponse>, ApiError> {
    let Json(event) = payload
        .map_err(|e| ApiError::validation(format!("Invalid event payload: {}", e.body_text())))?;

    let (intent, _created) = state.orchestrator.ingest_deposit(event).await?;

    Ok(Json(PostEventResponse {
        ok: true,
        intent_id: intent.id,
        new_status: intent.status,
    }))
}

/// Get one intent
async fn get_status(
    State(state): State<AppState>,
    Path(intent_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    if !is_tx_hash(&intent_id) {
        return Err(ApiError::validation(
            "Invalid intentId format. Expected a 0x-prefixed 64-character hex string.",
        ));
    }

    let intent = state.orchestrator.get_intent(&intent_id).await?;
    Ok(Json(StatusResponse { intent }))
}

/// Paginated history, newest first
async fn get_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(query) =
        query.map_err(|e| ApiError::validation(format!("Invalid query parameters: {}", e.body_text())))?;

    if let Some(user) = &query.user_address {
        if !is_address(user) {
            return Err(ApiError::validation("Invalid address format"));
        }
    }

    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(ApiError::validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }

    let filter = ListFilter {
        user_address: query.user_address,
        status: query.status,
    };
    let page = state
        .orchestrator
        .store()
        .list(&filter, limit, query.cursor.as_deref())
        .await?;

    Ok(Json(HistoryResponse {
        items: page.items.iter().map(HistoryEntry::from).collect(),
        next_cursor: page.next_cursor,
    }))
}

/// Intent counts per status
async fn get_stats(State(state): State<AppState>) -> Result<Json<IntentStats>, ApiError> {
    Ok(Json(state.orchestrator.store().stats().await?))
}

/// Outstanding chain workers
async fn get_tasks(State(state): State<AppState>) -> Json<TasksResponse> {
    let tasks = state.orchestrator.supervisor().snapshot();
    Json(TasksResponse {
        outstanding: tasks.len(),
        tasks,
    })
}

// Request and response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    user_address: Option<String>,
    status: Option<IntentStatus>,
    limit: Option<usize>,
    cursor: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    outstanding_tasks: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostEventResponse {
    ok: bool,
    intent_id: String,
    new_status: IntentStatus,
}

#[derive(Serialize)]
struct StatusResponse {
    intent: DepositIntent,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    items: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

/// Compact intent summary for history listings
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    id: String,
    user_address: String,
    source_chain_id: u64,
    source_tx_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_symbol: Option<String>,
    amount_in_usd: String,
    status: IntentStatus,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    num_chains: usize,
    chains: Vec<HistoryChain>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryChain {
    chain_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain_name: Option<String>,
    amount_usd: String,
    status: ChainDispersalStatus,
}

impl From<&DepositIntent> for HistoryEntry {
    fn from(intent: &DepositIntent) -> Self {
        Self {
            id: intent.id.clone(),
            user_address: intent.user_address.clone(),
            source_chain_id: intent.source_chain_id,
            source_tx_hash: intent.source_tx_hash.clone(),
            token_symbol: intent.token_symbol.clone(),
            amount_in_usd: intent.amount_in_usd.clone(),
            status: intent.status,
            created_at: intent.created_at,
            completed_at: intent.completed_at,
            num_chains: intent.chain_statuses.len(),
            chains: intent
                .chain_statuses
                .iter()
                .map(|chain| HistoryChain {
                    chain_id: chain.chain_id(),
                    chain_name: chain.allocation.chain_name.clone(),
                    amount_usd: chain.allocation.amount_usd.clone(),
                    status: chain.status,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct TasksResponse {
    outstanding: usize,
    tasks: Vec<TaskRecord>,
}
