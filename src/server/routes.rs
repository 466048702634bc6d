//! Start, status and terminate endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::runtime::OrchestrationStatus;

/// Management links returned by the start endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub id: String,
    pub status_query_get_uri: String,
    pub terminate_post_uri: String,
}

/// Instance status as served by `GET /orchestrations/:id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub instance_id: String,
    pub runtime_status: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TerminateRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

fn base_url(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|host| format!("http://{host}"))
        .unwrap_or_default()
}

/// `GET|POST /orchestrations/start`. The body, if any, is the orchestration input.
pub async fn start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let id = state.client.start_new(&state.orchestration, body).await?;
    tracing::info!(target: "durable_fanout::server", instance_id = %id, "Started orchestration with ID = '{id}'.");

    let base = base_url(&headers);
    let status_uri = format!("{base}/orchestrations/{id}");
    let response = StartResponse {
        terminate_post_uri: format!("{status_uri}/terminate"),
        status_query_get_uri: status_uri.clone(),
        id,
    };
    Ok((StatusCode::ACCEPTED, [(header::LOCATION, status_uri)], Json(response)))
}

/// `GET /orchestrations/:id`
pub async fn status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<StatusResponse>> {
    let instance = state
        .client
        .get_instance(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("instance not found: {id}")))?;

    let error = match &instance.status {
        OrchestrationStatus::Failed { details } => Some(details.display_message()),
        OrchestrationStatus::Terminated { reason } => Some(format!("terminated: {reason}")),
        _ => None,
    };
    Ok(Json(StatusResponse {
        instance_id: instance.instance_id,
        runtime_status: instance.status.name().to_string(),
        created_at: instance.created_at_ms,
        output: instance.output,
        error,
    }))
}

/// `POST /orchestrations/:id/terminate` with an optional `{ "reason": ... }` body.
pub async fn terminate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: String,
) -> ApiResult<StatusCode> {
    let request: TerminateRequest = if body.trim().is_empty() {
        TerminateRequest::default()
    } else {
        serde_json::from_str(&body).map_err(|e| ApiError::bad_request(format!("invalid terminate request: {e}")))?
    };

    let status = state.client.get_orchestration_status(&id).await?;
    if status == OrchestrationStatus::NotFound {
        return Err(ApiError::not_found(format!("instance not found: {id}")));
    }
    if status.is_terminal() {
        return Err(ApiError::conflict(format!("instance {id} is already {}", status.name())));
    }

    let reason = request.reason.unwrap_or_else(|| "terminated via API".to_string());
    state.client.terminate_instance(&id, reason).await?;
    Ok(StatusCode::ACCEPTED)
}

/// `GET /health`
pub async fn health() -> &'static str {
    "ok"
}
