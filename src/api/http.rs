//! HTTP API Server
//!
//! Document writes for the stand-alone node, shard status, reconciliation
//! controls and the metrics snapshot.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::node::ShardNode;
use crate::reconcile::PairState;
use crate::replication::ReplicationOutcome;
use crate::state::ShardSnapshot;
use crate::store::{Document, DocumentStore, Operation, TxnId};

/// Shared application state
pub struct AppState {
    pub node: Arc<ShardNode>,
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node: Arc<ShardNode>) -> Self {
        let state = Arc::new(AppState {
            node,
            started: Instant::now(),
        });
        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .route("/shards", get(handle_shards))
            .route("/shards/:shard", get(handle_shard).delete(handle_decommission))
            // Writes
            .route(
                "/shards/:shard/documents/:key",
                get(handle_get_document)
                    .post(handle_upsert)
                    .delete(handle_remove),
            )
            .route("/shards/:shard/transactions/:txn/commit", post(handle_commit))
            .route("/shards/:shard/transactions/:txn/abort", post(handle_abort))
            // Reconciliation
            .route(
                "/shards/:shard/followers/:follower/resync",
                post(handle_resync),
            )
            .route("/shards/:shard/reconfigure", post(handle_reconfigure))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Document write request
#[derive(Debug, Deserialize, Serialize)]
pub struct UpsertRequest {
    pub body: serde_json::Value,
    #[serde(default)]
    pub txn: Option<TxnId>,
}

/// Document remove query
#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub txn: Option<TxnId>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub led_shards: Vec<String>,
    pub degraded_shards: Vec<String>,
    pub uptime_seconds: u64,
}

/// Document as read from the leader copy
#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub key: String,
    pub revision: u64,
    pub body: serde_json::Value,
}

/// Reconciliation state of one follower
#[derive(Debug, Serialize)]
pub struct PairStatus {
    pub follower: String,
    pub state: String,
    pub resync_running: bool,
}

/// Shard detail response
#[derive(Debug, Serialize)]
pub struct ShardResponse {
    #[serde(flatten)]
    pub snapshot: ShardSnapshot,
    pub reconciliation: Vec<PairStatus>,
}

/// Resync request response
#[derive(Debug, Serialize)]
pub struct ResyncResponse {
    pub scheduled: bool,
    pub state: String,
}

/// Reconfiguration response
#[derive(Debug, Serialize)]
pub struct ReconfigureResponse {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(error: &Error) -> Response {
    let (status, code) = match error {
        Error::ShardNotFound(_) => (StatusCode::NOT_FOUND, "SHARD_NOT_FOUND"),
        Error::ParticipantNotFound { .. } => (StatusCode::NOT_FOUND, "PARTICIPANT_NOT_FOUND"),
        Error::NotLeader { .. } => (StatusCode::MISDIRECTED_REQUEST, "NOT_LEADER"),
        Error::StaleGeneration { .. } => (StatusCode::CONFLICT, "STALE_GENERATION"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn outcome_response(outcome: ReplicationOutcome) -> Response {
    let status = match outcome {
        ReplicationOutcome::Committed { .. } | ReplicationOutcome::PartiallyCommitted { .. } => StatusCode::OK,
        ReplicationOutcome::Failed { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(outcome)).into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let node = &state.node;
    let metrics = node.metrics.snapshot();
    Json(HealthResponse {
        healthy: true,
        node_id: node.node_id().to_string(),
        led_shards: node.rounds.shards().await,
        degraded_shards: metrics.degraded_shards,
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.metrics.snapshot())
}

async fn handle_shards(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshots: Vec<ShardSnapshot> = state
        .node
        .registry
        .views()
        .await
        .iter()
        .map(|v| v.snapshot())
        .collect();
    Json(snapshots)
}

async fn handle_shard(State(state): State<Arc<AppState>>, Path(shard): Path<String>) -> Response {
    let node = &state.node;
    let view = match node.registry.view(&shard).await {
        Ok(view) => view,
        Err(e) => return error_response(&e),
    };

    let mut reconciliation = Vec::new();
    for follower in view.followers.keys() {
        let pair = node.reconciler.state(&shard, follower).await;
        reconciliation.push(PairStatus {
            follower: follower.clone(),
            state: pair.to_string(),
            resync_running: node.reconciler.resync_running(&shard, follower).await,
        });
    }

    Json(ShardResponse {
        snapshot: view.snapshot(),
        reconciliation,
    })
    .into_response()
}

async fn handle_decommission(State(state): State<Arc<AppState>>, Path(shard): Path<String>) -> Response {
    match state.node.decommission(&shard).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_get_document(
    State(state): State<Arc<AppState>>,
    Path((shard, key)): Path<(String, String)>,
) -> Response {
    let store = match state.node.rounds.store(&shard).await {
        Ok(store) => store,
        Err(e) => return error_response(&e),
    };
    let tag = store.current_tag().await;
    match store.get(&key, tag).await {
        Ok(Some(Document { key, revision, body })) => {
            Json(DocumentResponse { key, revision, body }).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_upsert(
    State(state): State<Arc<AppState>>,
    Path((shard, key)): Path<(String, String)>,
    Json(req): Json<UpsertRequest>,
) -> Response {
    let mut op = Operation::upsert(key, req.body);
    op.txn = req.txn;
    outcome_response(state.node.leader.replicate(&shard, op).await)
}

async fn handle_remove(
    State(state): State<Arc<AppState>>,
    Path((shard, key)): Path<(String, String)>,
    query: Option<axum::extract::Query<RemoveQuery>>,
) -> Response {
    let mut op = Operation::remove(key);
    op.txn = query.and_then(|q| q.0.txn);
    outcome_response(state.node.leader.replicate(&shard, op).await)
}

async fn handle_commit(
    State(state): State<Arc<AppState>>,
    Path((shard, txn)): Path<(String, TxnId)>,
) -> Response {
    outcome_response(state.node.leader.commit_transaction(&shard, txn).await)
}

async fn handle_abort(
    State(state): State<Arc<AppState>>,
    Path((shard, txn)): Path<(String, TxnId)>,
) -> Response {
    outcome_response(state.node.leader.abort_transaction(&shard, txn).await)
}

async fn handle_resync(
    State(state): State<Arc<AppState>>,
    Path((shard, follower)): Path<(String, String)>,
) -> Response {
    let node = &state.node;
    if let Err(e) = node.registry.view(&shard).await {
        return error_response(&e);
    }
    let scheduled = node.reconciler.request_resync(&shard, &follower).await;
    let pair: PairState = node.reconciler.state(&shard, &follower).await;
    Json(ResyncResponse {
        scheduled,
        state: pair.to_string(),
    })
    .into_response()
}

async fn handle_reconfigure(State(state): State<Arc<AppState>>, Path(shard): Path<String>) -> Response {
    match state.node.reconciler.on_target_change(&shard).await {
        Ok(plan) => Json(ReconfigureResponse {
            added: plan.added,
            removed: plan.removed,
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}
