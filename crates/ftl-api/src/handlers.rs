//! Controller, schema, verb and pub/sub handlers.

use std::collections::BTreeSet;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ftl_controller::{CreateDeployment, Heartbeat, LogLine, RuntimeUpdate};
use ftl_core::{DeploymentKey, Digest, RefKey};
use ftl_dispatch::{CallContext, CallRequest};
use ftl_pubsub::PublishEvent;
use ftl_state::DeploymentArtefact;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::stream::{ndjson_request, ndjson_response, receiver_stream};
use crate::{ApiResponse, ApiState};

fn deployment_key(text: &str) -> ApiResult<DeploymentKey> {
    Ok(DeploymentKey::parse(text)?)
}

fn reference(text: &str) -> ApiResult<RefKey> {
    text.parse().map_err(ApiError::invalid)
}

// ── Controller ─────────────────────────────────────────────────

/// GET /api/v1/ping
pub async fn ping(State(state): State<ApiState>) -> impl IntoResponse {
    state.controller.ping();
    ApiResponse::ok(())
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.controller.status())
}

/// GET /api/v1/processes
pub async fn process_list(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.controller.process_list())
}

// ── Deployments ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Created {
    pub deployment_key: DeploymentKey,
}

/// POST /api/v1/deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    Json(request): Json<CreateDeployment>,
) -> ApiResult<Response> {
    let key = state.controller.create_deployment(request)?;
    Ok((StatusCode::CREATED, ApiResponse::ok(Created { deployment_key: key })).into_response())
}

/// GET /api/v1/deployments/{key}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<Response> {
    let deployment = state.controller.get_deployment(&deployment_key(&key)?)?;
    Ok(ApiResponse::ok(deployment).into_response())
}

#[derive(Debug, Deserialize)]
pub struct Replicas {
    pub min_replicas: Option<u32>,
}

/// POST /api/v1/deployments/{key}/update
pub async fn update_deploy(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(replicas): Json<Replicas>,
) -> ApiResult<Response> {
    let key = deployment_key(&key)?;
    state.controller.update_deploy(&key, replicas.min_replicas)?;
    Ok(ApiResponse::ok(()).into_response())
}

/// POST /api/v1/deployments/{key}/replace
pub async fn replace_deploy(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(replicas): Json<Replicas>,
) -> ApiResult<Response> {
    let key = deployment_key(&key)?;
    state
        .controller
        .replace_deploy(&key, replicas.min_replicas.unwrap_or(1))?;
    Ok(ApiResponse::ok(()).into_response())
}

/// PUT /api/v1/deployments/{key}/runtime
pub async fn update_deployment_runtime(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(update): Json<RuntimeUpdate>,
) -> ApiResult<Response> {
    let key = deployment_key(&key)?;
    state.controller.update_deployment_runtime(&key, update)?;
    Ok(ApiResponse::ok(()).into_response())
}

/// GET /api/v1/deployments/{key}/context
pub async fn deployment_context(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<Response> {
    let key = deployment_key(&key)?;
    let updates = state.controller.deployment_context(&key)?;
    Ok(ndjson_response(receiver_stream(updates)))
}

// ── Artefacts ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Uploaded {
    pub digest: Digest,
}

/// POST /api/v1/artefacts, the raw artefact as the body.
pub async fn upload_artefact(
    State(state): State<ApiState>,
    body: Bytes,
) -> ApiResult<Response> {
    let digest = state.controller.upload_artefact(&body)?;
    Ok((StatusCode::CREATED, ApiResponse::ok(Uploaded { digest })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct Digests {
    pub digests: Vec<Digest>,
}

#[derive(Debug, Serialize)]
pub struct Missing {
    pub missing_digests: Vec<Digest>,
}

/// POST /api/v1/artefacts/diffs
pub async fn artefact_diffs(
    State(state): State<ApiState>,
    Json(request): Json<Digests>,
) -> ApiResult<Response> {
    let missing_digests = state.controller.get_artefact_diffs(&request.digests)?;
    Ok(ApiResponse::ok(Missing { missing_digests }).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ArtefactQuery {
    /// Comma separated digests the caller already has.
    #[serde(default)]
    pub have: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Chunk {
    #[serde(flatten)]
    pub artefact: DeploymentArtefact,
    /// Base64.
    pub chunk: String,
}

/// GET /api/v1/deployments/{key}/artefacts
pub async fn deployment_artefacts(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Query(query): Query<ArtefactQuery>,
) -> ApiResult<Response> {
    let key = deployment_key(&key)?;
    let mut have = BTreeSet::new();
    for digest in query.have.iter().flat_map(|h| h.split(',')).filter(|d| !d.is_empty()) {
        have.insert(digest.parse::<Digest>()?);
    }
    let chunks = state.controller.get_deployment_artefacts(&key, &have)?;
    let chunks = chunks.into_iter().map(|c| Chunk {
        artefact: c.artefact,
        chunk: STANDARD.encode(c.chunk),
    });
    Ok(ndjson_response(stream::iter(chunks)))
}

// ── Runners ────────────────────────────────────────────────────

/// POST /api/v1/runners/register, heartbeats as newline-delimited JSON.
/// The runner stays registered until the request body ends.
pub async fn register_runner(State(state): State<ApiState>, body: Body) -> ApiResult<Response> {
    state
        .controller
        .register_runner(ndjson_request::<Heartbeat>(body))
        .await?;
    Ok(ApiResponse::ok(()).into_response())
}

#[derive(Debug, Serialize)]
pub struct Received {
    pub lines: usize,
}

/// POST /api/v1/logs, log lines as newline-delimited JSON.
pub async fn stream_deployment_logs(State(state): State<ApiState>, body: Body) -> ApiResult<Response> {
    let lines = state
        .controller
        .stream_deployment_logs(ndjson_request::<LogLine>(body))
        .await?;
    Ok(ApiResponse::ok(Received { lines }).into_response())
}

// ── Schema ─────────────────────────────────────────────────────

/// GET /api/v1/schema
pub async fn get_schema(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.controller.get_schema())
}

/// GET /api/v1/schema/pull
pub async fn pull_schema(State(state): State<ApiState>) -> Response {
    ndjson_response(receiver_stream(state.controller.pull_schema()))
}

// ── Verbs ──────────────────────────────────────────────────────

/// POST /api/v1/verbs/{verb}, the verb's request as the body. Call
/// context travels in the FTL headers.
pub async fn call(
    State(state): State<ApiState>,
    Path(verb): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let verb = reference(&verb)?;
    let context = CallContext::from_headers(&headers)?;
    let response = state
        .dispatcher
        .call(CallRequest::new(verb, body.to_vec()), context)
        .await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], response).into_response())
}

// ── Pub/sub ────────────────────────────────────────────────────

/// POST /api/v1/topics/{topic}/events, the event as the body. The
/// publishing verb is the last `FTL-Verb` header.
pub async fn publish_event(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let topic = reference(&topic)?;
    let context = CallContext::from_headers(&headers)?;
    let event = state.pubsub.publish_event(PublishEvent {
        topic,
        caller: context.current_caller().cloned(),
        body: body.to_vec(),
        request_key: context.request_key,
    })?;
    Ok((StatusCode::CREATED, ApiResponse::ok(event)).into_response())
}

/// POST /api/v1/subscriptions/{subscription}/reset
pub async fn reset_subscription(
    State(state): State<ApiState>,
    Path(subscription): Path<String>,
) -> ApiResult<Response> {
    let subscription = reference(&subscription)?;
    let row = state.pubsub.reset_subscription(&subscription)?;
    info!(%subscription, "subscription reset");
    Ok(ApiResponse::ok(row).into_response())
}
