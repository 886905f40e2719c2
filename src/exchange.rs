//! OAuth token exchange client
//!
//! Performs the two network calls every provider requires: redeeming an
//! authorization code for tokens and redeeming a refresh token for a new
//! access token. Differing provider response shapes are normalized into one
//! [`TokenResult`]. Credential problems (`ExchangeFailed`, `RefreshRejected`)
//! are never retried; a single bounded retry applies only to transport-level
//! failures.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::Client;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::contracts::{ClientCredentials, ProviderContract};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(12);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_millis(250);
const BODY_SNIPPET_MAX_CHARS: usize = 200;

/// Error codes a provider uses to report a refresh token as dead.
const REFRESH_REJECTION_CODES: &[&str] = &[
    "invalid_grant",
    "invalid_token",
    "unauthorized_client",
    "access_denied",
];

/// Normalized result of a token endpoint call.
#[derive(Debug, Clone)]
pub struct TokenResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
    /// Provider-specific extras captured by the contract's normalizer.
    pub metadata: BTreeMap<String, String>,
}

/// Errors from the token endpoint calls.
///
/// Body snippets are retained for server-side diagnostics; `Display` carries
/// only the status so messages stay safe to surface.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("provider token endpoint returned status {status}")]
    ExchangeFailed { status: u16, body: String },

    #[error("provider token response was malformed: {0}")]
    MalformedResponse(String),

    #[error("provider rejected the refresh token (status {status})")]
    RefreshRejected { status: u16, body: String },

    #[error("transport failure talking to provider token endpoint")]
    Transport(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    Refresh,
}

impl Grant {
    fn as_label(self) -> &'static str {
        match self {
            Grant::AuthorizationCode => "authorization_code",
            Grant::Refresh => "refresh_token",
        }
    }
}

/// HTTP client for provider token endpoints.
#[derive(Clone)]
pub struct ExchangeClient {
    http: Client,
}

impl ExchangeClient {
    /// Build a client with bounded timeouts so a hung provider cannot stall
    /// the calling request indefinitely.
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client builds with static configuration");
        Self { http }
    }

    /// Assemble the provider authorize URL with the standard
    /// authorization-code parameters plus the contract's extras.
    pub fn build_authorization_url(
        &self,
        contract: &ProviderContract,
        credentials: &ClientCredentials,
        redirect_uri: &str,
        state: &str,
    ) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(contract.authorize_url)?;
        url.query_pairs_mut()
            .append_pair("client_id", &credentials.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &contract.scope_string())
            .append_pair("state", state)
            .append_pair("response_type", "code");

        for (key, value) in contract.extra_params {
            url.query_pairs_mut().append_pair(key, value);
        }

        debug!(
            provider = contract.provider_id,
            authorize_url = %url,
            "Built authorization URL"
        );

        Ok(url)
    }

    /// Redeem an authorization code at the provider token endpoint.
    pub async fn exchange_code(
        &self,
        contract: &ProviderContract,
        credentials: &ClientCredentials,
        redirect_uri: &str,
        code: &str,
    ) -> Result<TokenResult, ExchangeError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code".to_string());
        params.insert("code", code.to_string());
        params.insert("redirect_uri", redirect_uri.to_string());
        params.insert("client_id", credentials.client_id.clone());
        params.insert("client_secret", credentials.client_secret.clone());

        let body = self
            .token_request(contract, &params, Grant::AuthorizationCode)
            .await?;
        normalize_token_response(contract, &body)
    }

    /// Redeem a refresh token for a fresh access token. A rejection here
    /// means the stored credential is dead and the user must re-authorize.
    pub async fn refresh(
        &self,
        contract: &ProviderContract,
        credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenResult, ExchangeError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token".to_string());
        params.insert("refresh_token", refresh_token.to_string());
        params.insert("client_id", credentials.client_id.clone());
        params.insert("client_secret", credentials.client_secret.clone());

        let body = self.token_request(contract, &params, Grant::Refresh).await?;
        normalize_token_response(contract, &body)
    }

    async fn token_request(
        &self,
        contract: &ProviderContract,
        params: &HashMap<&str, String>,
        grant: Grant,
    ) -> Result<serde_json::Value, ExchangeError> {
        let started = Instant::now();
        let mut retried = false;

        let response = loop {
            let attempt = self
                .http
                .post(contract.token_url)
                .header("Accept", "application/json")
                .form(params)
                .send()
                .await;

            match attempt {
                Ok(response) => break response,
                Err(err) if !retried && (err.is_timeout() || err.is_connect()) => {
                    warn!(
                        provider = contract.provider_id,
                        grant = grant.as_label(),
                        error = %err,
                        "Transport failure on token request, retrying once"
                    );
                    retried = true;
                    sleep(TRANSPORT_RETRY_DELAY).await;
                }
                Err(err) => {
                    record_outcome(contract, grant, "transport_error");
                    return Err(ExchangeError::Transport(err));
                }
            }
        };

        histogram!("oauth_token_request_latency_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        let status = response.status();
        let text = response.text().await.map_err(ExchangeError::Transport)?;

        if !status.is_success() {
            let snippet = truncate_snippet(&text);
            record_outcome(contract, grant, "http_error");
            return Err(classify_failure(grant, status.as_u16(), snippet, None));
        }

        let body: serde_json::Value = serde_json::from_str(&text).map_err(|_| {
            record_outcome(contract, grant, "malformed");
            ExchangeError::MalformedResponse("token response is not JSON".to_string())
        })?;

        // Some providers report failure inside a 200 body.
        if let Some(error_code) = body.get("error").and_then(|v| v.as_str()) {
            record_outcome(contract, grant, "provider_error");
            return Err(classify_failure(
                grant,
                status.as_u16(),
                truncate_snippet(&text),
                Some(error_code),
            ));
        }

        record_outcome(contract, grant, "success");
        Ok(body)
    }
}

impl Default for ExchangeClient {
    fn default() -> Self {
        Self::new()
    }
}

fn record_outcome(contract: &ProviderContract, grant: Grant, outcome: &'static str) {
    let labels = vec![
        ("provider", contract.provider_id.to_string()),
        ("grant", grant.as_label().to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("oauth_token_requests_total", &labels).increment(1);
}

fn classify_failure(
    grant: Grant,
    status: u16,
    body: String,
    error_code: Option<&str>,
) -> ExchangeError {
    if grant == Grant::Refresh {
        let rejected_code = error_code
            .map(|code| REFRESH_REJECTION_CODES.contains(&code))
            .unwrap_or(false);
        if rejected_code || status == 400 || status == 401 {
            return ExchangeError::RefreshRejected { status, body };
        }
    }
    ExchangeError::ExchangeFailed { status, body }
}

fn normalize_token_response(
    contract: &ProviderContract,
    body: &serde_json::Value,
) -> Result<TokenResult, ExchangeError> {
    let access_token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            ExchangeError::MalformedResponse("missing access_token field".to_string())
        })?;

    let refresh_token = body
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .filter(|token| !token.is_empty())
        .map(str::to_string);

    // Providers disagree on numeric vs string expires_in.
    let expires_in = body.get("expires_in").and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    });

    let scope = body
        .get("scope")
        .and_then(|v| v.as_str())
        .filter(|scope| !scope.is_empty())
        .map(str::to_string);

    Ok(TokenResult {
        access_token: access_token.to_string(),
        refresh_token,
        expires_in,
        scope,
        metadata: (contract.normalize_metadata)(body),
    })
}

fn truncate_snippet(body: &str) -> String {
    if body.chars().count() > BODY_SNIPPET_MAX_CHARS {
        let truncated: String = body.chars().take(BODY_SNIPPET_MAX_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ContractRegistry;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn registry() -> ContractRegistry {
        ContractRegistry::builtin().expect("builtin table is valid")
    }

    fn credentials() -> ClientCredentials {
        ClientCredentials {
            client_id: "client-123".to_string(),
            client_secret: "secret-456".to_string(),
        }
    }

    fn empty_metadata(_body: &serde_json::Value) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn authorize_url_carries_standard_parameters() {
        let registry = registry();
        let contract = registry.resolve("github").unwrap();
        let client = ExchangeClient::new();

        let url = client
            .build_authorization_url(
                contract,
                &credentials(),
                "https://app.example.com/oauth/callback/github",
                "state-token",
            )
            .unwrap();

        let pairs: StdHashMap<_, _> = url.query_pairs().collect();
        assert_eq!(pairs.get("client_id").unwrap(), "client-123");
        assert_eq!(
            pairs.get("redirect_uri").unwrap(),
            "https://app.example.com/oauth/callback/github"
        );
        assert_eq!(pairs.get("scope").unwrap(), "repo read:org");
        assert_eq!(pairs.get("state").unwrap(), "state-token");
        assert_eq!(pairs.get("response_type").unwrap(), "code");
        assert!(url.fragment().is_none());
    }

    #[test]
    fn authorize_url_applies_contract_extras() {
        let registry = registry();
        let contract = registry.resolve("jira").unwrap();
        let client = ExchangeClient::new();

        let url = client
            .build_authorization_url(
                contract,
                &credentials(),
                "https://app.example.com/oauth/callback/atlassian",
                "state-token",
            )
            .unwrap();

        let pairs: StdHashMap<_, _> = url.query_pairs().collect();
        assert_eq!(pairs.get("audience").unwrap(), "api.atlassian.com");
        assert_eq!(pairs.get("prompt").unwrap(), "consent");
        assert!(pairs.get("scope").unwrap().contains("offline_access"));
    }

    #[test]
    fn normalize_requires_access_token() {
        let registry = registry();
        let contract = registry.resolve("github").unwrap();

        let err = normalize_token_response(contract, &json!({ "token_type": "bearer" }))
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedResponse(_)));

        let err =
            normalize_token_response(contract, &json!({ "access_token": "" })).unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedResponse(_)));
    }

    #[test]
    fn normalize_accepts_string_expires_in() {
        let registry = registry();
        let contract = registry.resolve("github").unwrap();

        let result = normalize_token_response(
            contract,
            &json!({ "access_token": "t", "expires_in": "3600" }),
        )
        .unwrap();
        assert_eq!(result.expires_in, Some(3600));

        let result = normalize_token_response(
            contract,
            &json!({ "access_token": "t", "expires_in": 7200 }),
        )
        .unwrap();
        assert_eq!(result.expires_in, Some(7200));
    }

    #[test]
    fn normalize_captures_contract_metadata() {
        let registry = registry();
        let contract = registry.resolve("slack").unwrap();

        let result = normalize_token_response(
            contract,
            &json!({
                "ok": true,
                "access_token": "xoxb-1",
                "team": { "id": "T0123", "name": "Acme" }
            }),
        )
        .unwrap();

        assert_eq!(result.metadata.get("team_id").map(String::as_str), Some("T0123"));
    }

    #[test]
    fn refresh_rejection_classification() {
        let rejected = classify_failure(Grant::Refresh, 400, "body".to_string(), None);
        assert!(matches!(rejected, ExchangeError::RefreshRejected { .. }));

        let rejected =
            classify_failure(Grant::Refresh, 200, "body".to_string(), Some("invalid_grant"));
        assert!(matches!(rejected, ExchangeError::RefreshRejected { .. }));

        let transient = classify_failure(Grant::Refresh, 503, "body".to_string(), None);
        assert!(matches!(transient, ExchangeError::ExchangeFailed { .. }));

        let exchange = classify_failure(Grant::AuthorizationCode, 400, "body".to_string(), None);
        assert!(matches!(exchange, ExchangeError::ExchangeFailed { .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        // Port 1 refuses connections; the client retries once and then
        // reports the failure as transport-level, not a provider error.
        static DEAD_ENDPOINT: &[ProviderContract] = &[ProviderContract {
            provider_id: "dead",
            authorize_url: "http://127.0.0.1:1/authorize",
            token_url: "http://127.0.0.1:1/token",
            client_id_env: "DEAD_CLIENT_ID",
            client_secret_env: "DEAD_CLIENT_SECRET",
            redirect_path: "/oauth/callback/dead",
            scopes: &["read"],
            scope_delimiter: " ",
            tool_ids: &["dead"],
            extra_params: &[],
            normalize_metadata: empty_metadata,
            display_metadata_keys: &[],
        }];

        let client = ExchangeClient::new();
        let err = client
            .exchange_code(
                &DEAD_ENDPOINT[0],
                &credentials(),
                "https://app.example.com/oauth/callback/dead",
                "code",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExchangeError::Transport(_)));
    }

    #[test]
    fn snippet_truncation_is_char_safe() {
        let long = "ü".repeat(500);
        let snippet = truncate_snippet(&long);
        assert!(snippet.chars().count() <= BODY_SNIPPET_MAX_CHARS + 3);
        assert!(snippet.ends_with("..."));

        assert_eq!(truncate_snippet("short"), "short");
    }
}
