//! # Connection Status Handlers
//!
//! Read-only status projection across every registered tool, and the
//! idempotent disconnect operation.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::broker::ToolStatus;
use crate::error::ApiError;
use crate::handlers::connect::ToolPath;
use crate::server::AppState;

/// Per-tool status entry for API responses. Token material never appears
/// here; only display-safe metadata survives the projection.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ToolStatusResponse {
    /// Whether a connection currently exists
    pub connected: bool,
    /// When the connection was first established (RFC 3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
    /// Scopes granted by the provider
    pub scopes: Vec<String>,
    /// Display-safe provider metadata (e.g., a workspace name)
    pub metadata: BTreeMap<String, String>,
}

impl From<ToolStatus> for ToolStatusResponse {
    fn from(status: ToolStatus) -> Self {
        Self {
            connected: status.connected,
            connected_at: status.connected_at.map(|at| at.to_rfc3339()),
            scopes: status.scopes,
            metadata: status.metadata,
        }
    }
}

/// Status map across every registered tool
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub tools: BTreeMap<String, ToolStatusResponse>,
}

/// Get per-tool connection status for the requesting user
#[utoipa::path(
    get,
    path = "/connections",
    security(("bearer_auth" = [])),
    params(UserHeader),
    responses(
        (status = 200, description = "Per-tool connection status", body = StatusResponse),
        (status = 401, description = "Missing or invalid authorization token", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_status(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
) -> Result<Json<StatusResponse>, ApiError> {
    let statuses = state.broker.status(user.0).await?;

    let tools = statuses
        .into_iter()
        .map(|(tool_id, status)| (tool_id, status.into()))
        .collect();

    Ok(Json(StatusResponse { tools }))
}

/// Disconnect a tool for the requesting user
///
/// Idempotent: disconnecting a tool that is not connected succeeds.
#[utoipa::path(
    delete,
    path = "/connect/{tool}",
    security(("bearer_auth" = [])),
    params(
        ("tool" = String, Path, description = "Tool identifier (snake_case, e.g., 'github')"),
        UserHeader
    ),
    responses(
        (status = 204, description = "Connection removed (or was already absent)"),
        (status = 401, description = "Missing or invalid authorization token", body = ApiError),
        (status = 404, description = "Tool not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn disconnect(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<ToolPath>,
) -> Result<StatusCode, ApiError> {
    state.broker.disconnect(user.0, &path.tool).await?;
    Ok(StatusCode::NO_CONTENT)
}
