//! HTTP routes
//!
//! Every route maps onto one registry or pool operation. Bodies and
//! responses are JSON; errors are `{"error": "..."}` with a status from
//! [`ApiError::status`].

use crate::error::ApiError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use conclave_core::{EventTime, MemberId};
use conclave_registry::pool::BOOTSTRAP_LIST_SIZE;
use conclave_registry::{
    JoinOutcome, MemberInfo, MemberSummary, PoolPolicy, PoolSnapshot, PoolStats, PullResult,
    RegistryService,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

type Registry = State<Arc<RegistryService>>;
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Longest a client may block in `wait`
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Body of a join request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Joining member
    pub member: MemberInfo,
    /// Policy used if this join creates the pool
    #[serde(default)]
    pub policy: Option<PoolPolicy>,
}

/// Body naming a single member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRequest {
    /// Member concerned
    pub member: MemberId,
}

/// Body of an election request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectRequest {
    /// Election name
    pub election: String,
    /// Proposed winner
    pub candidate: MemberId,
}

/// Body of a signal request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Sending member
    pub source: MemberId,
    /// Application tag
    pub tag: String,
    /// Recipients; absent means everyone
    #[serde(default)]
    pub targets: Option<Vec<MemberId>>,
}

/// Body of a terminate request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminateRequest {
    /// Member asking for termination, if any
    #[serde(default)]
    pub source: Option<MemberId>,
}

/// Event time assigned by a mutating call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeResponse {
    /// Assigned time
    pub time: EventTime,
}

/// Winner of an election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectResponse {
    /// Winning member
    pub winner: MemberId,
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    member: MemberId,
    from: EventTime,
}

#[derive(Debug, Deserialize)]
struct MemberQuery {
    member: MemberId,
}

#[derive(Debug, Deserialize)]
struct PeersQuery {
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    time: EventTime,
    timeout_ms: u64,
}

/// Build the API router over `registry`
pub fn router(registry: Arc<RegistryService>) -> Router {
    Router::new()
        .route("/pools", get(list_pools))
        .route("/pools/{pool}", post(create_pool))
        .route("/pools/{pool}/join", post(join))
        .route("/pools/{pool}/leave", post(leave))
        .route("/pools/{pool}/die", post(die))
        .route("/pools/{pool}/heartbeat", post(heartbeat))
        .route("/pools/{pool}/maybe-dead", post(maybe_dead))
        .route("/pools/{pool}/elect", post(elect))
        .route("/pools/{pool}/signal", post(signal))
        .route("/pools/{pool}/terminate", post(terminate))
        .route("/pools/{pool}/sequence/{name}", post(sequence_number))
        .route("/pools/{pool}/events", get(pull))
        .route("/pools/{pool}/wait", get(wait))
        .route("/pools/{pool}/members", get(members))
        .route("/pools/{pool}/peers", get(peers))
        .route("/pools/{pool}/snapshot", get(snapshot))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_pools(State(registry): Registry) -> Json<BTreeMap<String, usize>> {
    Json(registry.pool_sizes().await)
}

async fn create_pool(
    State(registry): Registry,
    Path(pool): Path<String>,
    Json(policy): Json<PoolPolicy>,
) -> ApiResult<PoolStats> {
    let pool = registry.get_or_create(&pool, Some(policy)).await?;
    Ok(Json(pool.stats().await))
}

async fn join(
    State(registry): Registry,
    Path(pool): Path<String>,
    Json(request): Json<JoinRequest>,
) -> ApiResult<JoinOutcome> {
    if request.member.name.is_empty() {
        return Err(ApiError::BadRequest("member name is empty".to_string()));
    }
    let outcome = registry.join(&pool, request.policy, request.member).await?;
    Ok(Json(outcome))
}

async fn leave(
    State(registry): Registry,
    Path(pool): Path<String>,
    Json(request): Json<MemberRequest>,
) -> ApiResult<TimeResponse> {
    let time = registry.leave(&pool, request.member).await?;
    Ok(Json(TimeResponse { time }))
}

async fn die(
    State(registry): Registry,
    Path(pool): Path<String>,
    Json(request): Json<MemberRequest>,
) -> ApiResult<TimeResponse> {
    let time = registry.die(&pool, request.member).await?;
    Ok(Json(TimeResponse { time }))
}

async fn heartbeat(
    State(registry): Registry,
    Path(pool): Path<String>,
    Json(request): Json<MemberRequest>,
) -> Result<StatusCode, ApiError> {
    registry.heartbeat(&pool, request.member).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn maybe_dead(
    State(registry): Registry,
    Path(pool): Path<String>,
    Json(request): Json<MemberRequest>,
) -> ApiResult<serde_json::Value> {
    let suspected = registry.pool(&pool).await?.maybe_dead(request.member).await?;
    if suspected {
        registry.notify();
    }
    Ok(Json(serde_json::json!({ "suspected": suspected })))
}

async fn elect(
    State(registry): Registry,
    Path(pool): Path<String>,
    Json(request): Json<ElectRequest>,
) -> ApiResult<ElectResponse> {
    let winner = registry
        .elect(&pool, &request.election, request.candidate)
        .await?;
    Ok(Json(ElectResponse { winner }))
}

async fn signal(
    State(registry): Registry,
    Path(pool): Path<String>,
    Json(request): Json<SignalRequest>,
) -> ApiResult<TimeResponse> {
    let time = registry
        .signal(&pool, request.source, &request.tag, request.targets.as_deref())
        .await?;
    Ok(Json(TimeResponse { time }))
}

async fn terminate(
    State(registry): Registry,
    Path(pool): Path<String>,
    Json(request): Json<TerminateRequest>,
) -> ApiResult<TimeResponse> {
    let time = registry.terminate(&pool, request.source).await?;
    Ok(Json(TimeResponse { time }))
}

async fn sequence_number(
    State(registry): Registry,
    Path((pool, name)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let value = registry.pool(&pool).await?.sequence_number(&name).await?;
    Ok(Json(serde_json::json!({ "value": value })))
}

async fn pull(
    State(registry): Registry,
    Path(pool): Path<String>,
    Query(query): Query<PullQuery>,
) -> ApiResult<PullResult> {
    let result = registry.pull(&pool, query.member, query.from).await?;
    Ok(Json(result))
}

async fn wait(
    State(registry): Registry,
    Path(pool): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<serde_json::Value> {
    let timeout = Duration::from_millis(query.timeout_ms).min(MAX_WAIT);
    let reached = registry
        .pool(&pool)
        .await?
        .wait_for_event_time(query.time, timeout)
        .await;
    Ok(Json(serde_json::json!({ "reached": reached })))
}

async fn members(State(registry): Registry, Path(pool): Path<String>) -> Json<Vec<MemberSummary>> {
    Json(registry.members(&pool).await)
}

async fn peers(
    State(registry): Registry,
    Path(pool): Path<String>,
    Query(query): Query<PeersQuery>,
) -> ApiResult<Vec<MemberId>> {
    let count = query.count.unwrap_or(BOOTSTRAP_LIST_SIZE);
    let peers = registry.pool(&pool).await?.bootstrap_peers(count).await;
    Ok(Json(peers))
}

async fn snapshot(
    State(registry): Registry,
    Path(pool): Path<String>,
    Query(query): Query<MemberQuery>,
) -> ApiResult<PoolSnapshot> {
    let snapshot = registry.pool(&pool).await?.snapshot(query.member).await?;
    Ok(Json(snapshot))
}

async fn stats(State(registry): Registry) -> Json<Vec<PoolStats>> {
    Json(registry.stats().await.0)
}
