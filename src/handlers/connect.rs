//! # Connection Flow Handlers
//!
//! Handlers for the two legs of the OAuth authorization round trip:
//! starting a connection for a (user, tool) pair and completing it when the
//! provider redirects back.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::{IntoParams, ToSchema};

use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::broker::ConnectionSummary;
use crate::error::{ApiError, validation_error};
use crate::server::AppState;

/// Request path parameter for tool id
#[derive(Debug, Deserialize, ToSchema)]
pub struct ToolPath {
    /// Tool identifier (snake_case, e.g., "github")
    pub tool: String,
}

/// Request path parameter for provider id on the callback route
#[derive(Debug, Deserialize, ToSchema)]
pub struct ProviderPath {
    /// Provider identifier the redirect URI was registered under
    pub provider: String,
}

/// OAuth authorization URL response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthorizeUrlResponse {
    /// Complete authorization URL for user redirection
    pub authorize_url: String,
    /// Expiry of the embedded state value (RFC 3339)
    pub state_expires_at: String,
}

/// Query parameters the provider sends to the callback route
#[derive(Debug, Deserialize, IntoParams)]
pub struct CallbackQuery {
    /// Signed state value issued at initiate time
    pub state: String,
    /// Authorization code, present on success
    pub code: Option<String>,
    /// Provider error code, present when the user denied authorization
    pub error: Option<String>,
}

/// Non-secret summary of an established connection
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionSummaryResponse {
    /// Tool the connection links to
    pub tool_id: String,
    /// When the connection was first established (RFC 3339)
    pub connected_at: String,
    /// Scopes granted by the provider
    pub scopes: Vec<String>,
}

impl From<ConnectionSummary> for ConnectionSummaryResponse {
    fn from(summary: ConnectionSummary) -> Self {
        Self {
            tool_id: summary.tool_id,
            connected_at: summary.connected_at.to_rfc3339(),
            scopes: summary.scopes,
        }
    }
}

/// Start the OAuth flow for a tool
///
/// Returns a fully formed authorization URL the client redirects the user
/// to. The state value inside it binds the round trip to this user and tool.
#[utoipa::path(
    post,
    path = "/connect/{tool}",
    security(("bearer_auth" = [])),
    params(
        ("tool" = String, Path, description = "Tool identifier (snake_case, e.g., 'github')"),
        UserHeader
    ),
    responses(
        (status = 200, description = "Authorization URL generated", body = AuthorizeUrlResponse),
        (status = 401, description = "Missing or invalid authorization token", body = ApiError),
        (status = 404, description = "Tool not found", body = ApiError),
        (status = 503, description = "Tool not configured in this deployment", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn start_connection(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<ToolPath>,
) -> Result<Json<AuthorizeUrlResponse>, ApiError> {
    let initiated = state.broker.initiate(user.0, &path.tool)?;

    validate_authorize_url(&initiated.authorize_url)?;

    tracing::info!(
        user_id = %user.0,
        tool = %path.tool,
        "OAuth flow initiated"
    );

    Ok(Json(AuthorizeUrlResponse {
        authorize_url: initiated.authorize_url.to_string(),
        state_expires_at: initiated.state_expires_at.to_rfc3339(),
    }))
}

/// Provider redirect target completing the OAuth flow
///
/// Unauthenticated by design: the signed state value is what ties the
/// redirect back to the initiating user. Any state failure renders as a
/// retryable error, never a stack trace.
#[utoipa::path(
    get,
    path = "/oauth/callback/{provider}",
    params(
        ("provider" = String, Path, description = "Provider the redirect URI is registered under"),
        CallbackQuery
    ),
    responses(
        (status = 200, description = "Connection established", body = ConnectionSummaryResponse),
        (status = 400, description = "Invalid or expired state, or authorization denied", body = ApiError),
        (status = 502, description = "Provider exchange failed", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(path): Path<ProviderPath>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<ConnectionSummaryResponse>, ApiError> {
    if let Some(error) = query.error {
        tracing::warn!(
            provider = %path.provider,
            provider_error = %error,
            "Provider redirected back with an error"
        );
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "AUTHORIZATION_DENIED",
            "Authorization was not completed, please retry connecting",
        ));
    }

    let code = query.code.ok_or_else(|| {
        validation_error(
            "Missing authorization code",
            serde_json::json!({ "code": "Required query parameter is missing" }),
        )
    })?;

    let summary = state.broker.handle_callback(&query.state, &code).await?;

    tracing::info!(
        provider = %path.provider,
        tool = %summary.tool_id,
        "OAuth callback completed"
    );

    Ok(Json(summary.into()))
}

/// Validate the generated authorization URL meets OAuth 2.0 requirements
fn validate_authorize_url(url: &Url) -> Result<(), ApiError> {
    if url.scheme() != "https" {
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Generated authorization URL must use HTTPS",
        ));
    }

    // No fragment component per OAuth 2.0 RFC 6749 section 3.1
    if url.fragment().is_some() {
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Generated authorization URL must not include fragment component",
        ));
    }

    if url.as_str().len() > 2048 {
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Generated authorization URL exceeds maximum length of 2048 characters",
        ));
    }

    Ok(())
}
