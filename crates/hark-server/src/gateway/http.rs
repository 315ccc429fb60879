//! REST endpoints.
//!
//! Every handler authorises the connecting peer first (except `/health`),
//! then shuttles between wire JSON and the service layer. Errors map to
//! stable `{error, message}` bodies; see [`ApiError`].

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use hark_types::config::{STT_LANGUAGES, STT_MODELS, TTS_VOICES};
use hark_types::{ConfigPatch, PermissionDecision, PermissionId, RelayError, ResponseMode, TurnId};

use crate::service::Accepted;
use crate::turns::ResponseView;

use super::SharedRelay;

/// Cap on a permission status long-poll.
const STATUS_LONG_POLL: Duration = Duration::from_secs(30);

/// [`RelayError`] carried out of a handler, rendered as JSON.
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::AuthDenied => StatusCode::FORBIDDEN,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::Cooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Busy | RelayError::Conflict(_) => StatusCode::CONFLICT,
            RelayError::Unavailable(_) => StatusCode::BAD_GATEWAY,
            RelayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut body = json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        if let RelayError::Cooldown { remaining_ms } = &self.0 {
            body["cooldown_ms"] = json!(remaining_ms);
        }
        (status, Json(body)).into_response()
    }
}

/// Build the REST router.
pub fn api_router(relay: SharedRelay) -> Router {
    let body_cap = relay.max_upload_bytes + 64 * 1024;
    Router::new()
        .route("/health", get(health))
        .route("/transcribe", post(transcribe))
        .route("/api/config", get(get_config).post(post_config))
        .route("/api/chat", get(get_chat))
        .route("/api/history", get(get_history))
        .route("/api/requests", get(get_requests))
        .route("/api/response/{id}", get(get_response))
        .route("/api/response/{id}/ack", post(post_ack))
        .route("/api/audio/{id}", get(get_audio))
        .route("/api/message", post(post_message))
        .route("/api/claude/restart", post(post_restart))
        .route("/api/abort", post(post_abort))
        .route("/api/prompt/respond", post(post_prompt_respond))
        .route("/api/permission/request", post(post_permission_request))
        .route("/api/permission/status/{id}", get(get_permission_status))
        .route("/api/permission/respond", post(post_permission_respond))
        .layer(DefaultBodyLimit::max(body_cap))
        .with_state(relay)
}

async fn authorize(relay: &SharedRelay, addr: SocketAddr) -> Result<(), ApiError> {
    if relay.auth.verify(addr.ip()).await {
        Ok(())
    } else {
        Err(ApiError(RelayError::AuthDenied))
    }
}

fn accepted_body(accepted: &Accepted) -> serde_json::Value {
    json!({
        "request_id": accepted.turn.id,
        "transcript": accepted.transcript,
        "response_mode": accepted.response_mode,
        "message": if accepted.transcript.is_empty() {
            Some("no speech detected")
        } else {
            None
        },
    })
}

// ---------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn transcribe(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;

    if let Some(content_type) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        if !content_type.starts_with("audio/") {
            return Err(RelayError::BadRequest(format!(
                "expected audio/* content type, got {content_type}"
            ))
            .into());
        }
    }
    if body.len() > relay.max_upload_bytes {
        return Err(RelayError::PayloadTooLarge {
            max: relay.max_upload_bytes as u64,
            actual: body.len() as u64,
        }
        .into());
    }
    let mode = parse_mode_header(&headers)?;

    let accepted = relay.submit_voice(body.to_vec(), mode).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted_body(&accepted))).into_response())
}

fn parse_mode_header(headers: &HeaderMap) -> Result<Option<ResponseMode>, ApiError> {
    match headers.get("x-response-mode").map(|v| v.to_str().unwrap_or("")) {
        None => Ok(None),
        Some(raw) => ResponseMode::parse(raw).map(Some).ok_or_else(|| {
            ApiError(RelayError::BadRequest(format!(
                "invalid response mode: {raw}"
            )))
        }),
    }
}

async fn get_config(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    Ok(Json(json!({
        "config": relay.config.get(),
        "options": {
            "models": STT_MODELS,
            "languages": STT_LANGUAGES,
            "response_modes": ["text", "audio", "disabled"],
            "voices": TTS_VOICES,
        },
    }))
    .into_response())
}

async fn post_config(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(patch): Json<ConfigPatch>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    match relay.patch_config(&patch) {
        Ok(config) => Ok(Json(json!({"status": "ok", "config": config})).into_response()),
        Err(errors) => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "errors": errors})),
        )
            .into_response()),
    }
}

async fn get_chat(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    let snapshot = relay.state.snapshot().await;
    Ok(Json(json!({
        "status": snapshot.status,
        "messages": snapshot.messages,
        "prompt": snapshot.prompt,
        "usage": snapshot.usage,
    }))
    .into_response())
}

async fn get_history(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    let snapshot = relay.state.snapshot().await;
    Ok(Json(json!({"messages": snapshot.messages})).into_response())
}

async fn get_requests(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    Ok(Json(json!({
        "requests": relay.turns.recent(100),
        "work_dir": relay.work_dir,
        "agent_stderr": relay.agent.stderr_tail(),
    }))
    .into_response())
}

async fn get_response(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<TurnId>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    let body = match relay.turns.response_view(&id) {
        ResponseView::NotFound => {
            return Ok((
                StatusCode::NOT_FOUND,
                Json(json!({"status": "not_found"})),
            )
                .into_response())
        }
        ResponseView::Pending => json!({"status": "pending"}),
        ResponseView::Disabled => json!({"status": "disabled"}),
        ResponseView::Failed { error } => json!({"status": "failed", "error": error}),
        ResponseView::CompletedText { response } => {
            json!({"status": "completed", "type": "text", "response": response})
        }
        ResponseView::CompletedAudio {
            response,
            audio_url,
        } => json!({
            "status": "completed",
            "type": "audio",
            "response": response,
            "audio_url": audio_url,
        }),
    };
    Ok(Json(body).into_response())
}

async fn post_ack(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<TurnId>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    relay.ack(&id).await?;
    Ok(Json(json!({})).into_response())
}

async fn get_audio(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<TurnId>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    match relay.audio.get(&id) {
        Some((bytes, mime)) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime)],
            bytes.as_ref().clone(),
        )
            .into_response()),
        None => Err(RelayError::NotFound.into()),
    }
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    text: String,
    response_mode: Option<String>,
}

async fn post_message(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<MessageBody>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    let mode = match &body.response_mode {
        None => None,
        Some(raw) => Some(ResponseMode::parse(raw).ok_or_else(|| {
            ApiError(RelayError::BadRequest(format!(
                "invalid response mode: {raw}"
            )))
        })?),
    };
    let accepted = relay.submit_text(&body.text, mode).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted_body(&accepted))).into_response())
}

async fn post_restart(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    relay.restart_agent().await?;
    Ok(Json(json!({"status": "restarted"})).into_response())
}

async fn post_abort(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    let aborted = relay.abort().await?;
    Ok(Json(json!({"status": "ok", "aborted": aborted})).into_response())
}

#[derive(Debug, Deserialize)]
struct PromptRespondBody {
    option: u32,
}

async fn post_prompt_respond(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<PromptRespondBody>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    match relay.respond_prompt(body.option).await {
        Ok(()) => Ok(Json(json!({"status": "ok"})).into_response()),
        // Responding when no prompt is active (e.g. a duplicate of a
        // response that already resolved it) is a no-op success.
        Err(RelayError::NotFound) => {
            Ok(Json(json!({"status": "ok", "message": "no active prompt"})).into_response())
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct PermissionRequestBody {
    tool_name: String,
    input_summary: Option<String>,
    tool_input: Option<serde_json::Value>,
}

async fn post_permission_request(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<PermissionRequestBody>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    if body.tool_name.is_empty() {
        return Err(RelayError::BadRequest("tool_name is required".into()).into());
    }
    let request = relay
        .broker
        .request(&body.tool_name, body.tool_input.as_ref(), body.input_summary)
        .await;
    Ok(Json(json!({"status": "ok", "request_id": request.id})).into_response())
}

async fn get_permission_status(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<PermissionId>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    match relay.broker.status(&id, STATUS_LONG_POLL).await {
        Some((decision, reason)) => {
            let status = if decision.is_pending() {
                "pending"
            } else {
                "resolved"
            };
            Ok(Json(json!({
                "status": status,
                "decision": decision,
                "reason": reason,
            }))
            .into_response())
        }
        None => Err(RelayError::NotFound.into()),
    }
}

#[derive(Debug, Deserialize)]
struct PermissionRespondBody {
    request_id: PermissionId,
    decision: String,
    reason: Option<String>,
}

async fn post_permission_respond(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<PermissionRespondBody>,
) -> Result<Response, ApiError> {
    authorize(&relay, addr).await?;
    let decision = match body.decision.as_str() {
        "allow" => PermissionDecision::Allow,
        "deny" => PermissionDecision::Deny,
        other => {
            return Err(RelayError::BadRequest(format!("invalid decision: {other}")).into());
        }
    };
    relay
        .broker
        .respond(&body.request_id, decision, body.reason.as_deref())?;
    Ok(Json(json!({"status": "ok"})).into_response())
}
