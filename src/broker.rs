//! OAuth broker
//!
//! Orchestrates the contract registry, state codec, credential cipher,
//! exchange client and connection store into the five operations the
//! controller layer consumes: initiate, callback, token retrieval (with lazy
//! refresh), disconnect and status.
//!
//! The broker is stateless across requests; the connection store is the only
//! shared mutable resource, and its atomic per-row upsert is what makes
//! concurrent callbacks and refreshes converge without in-process locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::contracts::{
    ClientCredentials, ContractError, ContractRegistry, ProviderContract, ProviderEnv,
};
use crate::crypto::{self, CryptoKey};
use crate::exchange::{ExchangeClient, ExchangeError, TokenResult};
use crate::models::connection;
use crate::state_token::StateCodec;
use crate::store::{ConnectionStore, NewConnection, StoreError};

/// Refresh ahead of expiry rather than after it, so in-flight API calls do
/// not race a token that dies mid-request.
pub const REFRESH_MARGIN_SECONDS: i64 = 60;

/// Broker error taxonomy. `ReauthorizationRequired` folds together every
/// condition under which the stored credential cannot be trusted (rejected
/// refresh, undecryptable ciphertext, missing refresh token) — callers handle
/// them identically: drop the stale connection and prompt a reconnect.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("tool '{0}' is not configured in this deployment")]
    ToolUnavailable(String),

    #[error("state value was rejected")]
    InvalidState,

    #[error(transparent)]
    Exchange(ExchangeError),

    #[error("no connection exists for this user and tool")]
    NotConnected,

    #[error("stored credential is no longer usable; the tool must be reconnected")]
    ReauthorizationRequired,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal broker error")]
    Internal(#[source] anyhow::Error),
}

impl From<ContractError> for BrokerError {
    fn from(err: ContractError) -> Self {
        match err {
            ContractError::UnknownTool(tool) => BrokerError::UnknownTool(tool),
            other => BrokerError::Internal(anyhow::Error::new(other)),
        }
    }
}

/// Result of a successful `initiate` call.
#[derive(Debug, Clone)]
pub struct InitiatedAuthorization {
    pub authorize_url: Url,
    pub state_expires_at: DateTime<Utc>,
}

/// Non-secret projection of an established connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub tool_id: String,
    pub connected_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

/// Per-tool status entry; never carries token material.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

/// The public-facing broker component.
#[derive(Clone)]
pub struct OAuthBroker {
    registry: ContractRegistry,
    provider_env: ProviderEnv,
    codec: StateCodec,
    crypto_key: CryptoKey,
    exchange: ExchangeClient,
    store: Arc<dyn ConnectionStore>,
    public_base_url: String,
}

impl OAuthBroker {
    pub fn new(
        registry: ContractRegistry,
        provider_env: ProviderEnv,
        crypto_key: CryptoKey,
        exchange: ExchangeClient,
        store: Arc<dyn ConnectionStore>,
        public_base_url: String,
    ) -> Self {
        let codec = StateCodec::new(crypto_key.clone());
        Self {
            registry,
            provider_env,
            codec,
            crypto_key,
            exchange,
            store,
            public_base_url,
        }
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    /// Tools whose provider app is configured in this deployment.
    pub fn available_tools(&self) -> Vec<&'static str> {
        self.registry.list_available(&self.provider_env)
    }

    /// Begin the authorization round trip for (user, tool). Returns the URL
    /// the controller redirects the user to.
    pub fn initiate(
        &self,
        user_id: Uuid,
        tool_id: &str,
    ) -> Result<InitiatedAuthorization, BrokerError> {
        let (contract, credentials) = self.resolve_available(tool_id)?;

        let (state, state_expires_at) = self.codec.issue(user_id, tool_id);
        let authorize_url = self
            .exchange
            .build_authorization_url(contract, &credentials, &self.redirect_uri(contract), &state)
            .map_err(|err| BrokerError::Internal(anyhow::Error::new(err)))?;

        info!(
            user_id = %user_id,
            tool = tool_id,
            provider = contract.provider_id,
            "Initiated OAuth authorization"
        );

        Ok(InitiatedAuthorization {
            authorize_url,
            state_expires_at,
        })
    }

    /// Complete the round trip: verify the state value, exchange the code,
    /// and persist the encrypted connection. The upsert keyed by (user, tool)
    /// is also what bounds state replay — running the same callback twice
    /// re-establishes the same connection instead of duplicating it.
    pub async fn handle_callback(
        &self,
        state: &str,
        code: &str,
    ) -> Result<ConnectionSummary, BrokerError> {
        let payload = self.codec.verify(state).map_err(|err| {
            warn!(error = %err, "Rejected OAuth callback state");
            BrokerError::InvalidState
        })?;

        let (contract, credentials) = self.resolve_available(&payload.tool_id)?;

        let tokens = self
            .exchange
            .exchange_code(contract, &credentials, &self.redirect_uri(contract), code)
            .await
            .map_err(BrokerError::Exchange)?;

        let row = self
            .persist_tokens(payload.user_id, &payload.tool_id, contract, tokens, None)
            .await?;

        let labels = vec![("provider", contract.provider_id.to_string())];
        counter!("oauth_connections_established_total", &labels).increment(1);

        info!(
            user_id = %payload.user_id,
            tool = %payload.tool_id,
            provider = contract.provider_id,
            "Connection established"
        );

        Ok(ConnectionSummary {
            tool_id: row.tool_id.clone(),
            connected_at: row.created_at.with_timezone(&Utc),
            scopes: row.scope_list(),
        })
    }

    /// Return a usable access token for (user, tool), transparently
    /// refreshing when within the safety margin of expiry. Refresh is purely
    /// lazy; there is no background scheduler.
    pub async fn get_valid_token(
        &self,
        user_id: Uuid,
        tool_id: &str,
    ) -> Result<String, BrokerError> {
        let row = self
            .store
            .get_connection(user_id, tool_id)
            .await?
            .ok_or(BrokerError::NotConnected)?;

        let aad = crypto::connection_aad(user_id, tool_id);

        let refresh_due = row
            .expires_at
            .map(|expires_at| {
                expires_at.with_timezone(&Utc) - Duration::seconds(REFRESH_MARGIN_SECONDS)
                    <= Utc::now()
            })
            .unwrap_or(false);

        if !refresh_due {
            return crypto::decrypt_token(
                &self.crypto_key,
                aad.as_bytes(),
                &row.access_token_ciphertext,
            )
            .map_err(|_| {
                warn!(
                    user_id = %user_id,
                    tool = tool_id,
                    "Stored access token failed decryption; connection is stale"
                );
                BrokerError::ReauthorizationRequired
            });
        }

        let (contract, credentials) = self.resolve_available(tool_id)?;

        let refresh_cipher = row
            .refresh_token_ciphertext
            .as_ref()
            .ok_or(BrokerError::ReauthorizationRequired)?;
        let refresh_token =
            crypto::decrypt_token(&self.crypto_key, aad.as_bytes(), refresh_cipher).map_err(
                |_| {
                    warn!(
                        user_id = %user_id,
                        tool = tool_id,
                        "Stored refresh token failed decryption; connection is stale"
                    );
                    BrokerError::ReauthorizationRequired
                },
            )?;

        let tokens = match self
            .exchange
            .refresh(contract, &credentials, &refresh_token)
            .await
        {
            Ok(tokens) => tokens,
            Err(ExchangeError::RefreshRejected { status, .. }) => {
                warn!(
                    user_id = %user_id,
                    tool = tool_id,
                    provider = contract.provider_id,
                    status,
                    "Refresh token rejected upstream; connection requires re-authorization"
                );
                let labels = vec![("provider", contract.provider_id.to_string())];
                counter!("oauth_refresh_rejected_total", &labels).increment(1);
                return Err(BrokerError::ReauthorizationRequired);
            }
            Err(other) => return Err(BrokerError::Exchange(other)),
        };

        let access_token = tokens.access_token.clone();
        self.persist_tokens(user_id, tool_id, contract, tokens, Some(&row))
            .await?;

        debug!(user_id = %user_id, tool = tool_id, "Access token refreshed");
        Ok(access_token)
    }

    /// Remove the connection. Idempotent: disconnecting an already
    /// disconnected tool succeeds.
    pub async fn disconnect(&self, user_id: Uuid, tool_id: &str) -> Result<(), BrokerError> {
        self.registry.resolve(tool_id)?;

        let removed = self.store.delete_connection(user_id, tool_id).await?;
        if removed {
            info!(user_id = %user_id, tool = tool_id, "Connection removed");
        } else {
            debug!(user_id = %user_id, tool = tool_id, "Disconnect of absent connection");
        }
        Ok(())
    }

    /// Read-only per-tool projection for a user, across every registered
    /// tool. Only display-safe metadata keys leave this method.
    pub async fn status(
        &self,
        user_id: Uuid,
    ) -> Result<BTreeMap<String, ToolStatus>, BrokerError> {
        let rows = self.store.list_connections(user_id).await?;
        let by_tool: HashMap<&str, &connection::Model> = rows
            .iter()
            .map(|row| (row.tool_id.as_str(), row))
            .collect();

        let mut statuses = BTreeMap::new();
        for tool_id in self.registry.all_tools() {
            let contract = self.registry.resolve(tool_id)?;
            let status = match by_tool.get(tool_id) {
                Some(row) => {
                    let mut metadata = row.metadata_map();
                    metadata.retain(|key, _| {
                        contract.display_metadata_keys.contains(&key.as_str())
                    });
                    ToolStatus {
                        connected: true,
                        connected_at: Some(row.created_at.with_timezone(&Utc)),
                        scopes: row.scope_list(),
                        metadata,
                    }
                }
                None => ToolStatus {
                    connected: false,
                    connected_at: None,
                    scopes: Vec::new(),
                    metadata: BTreeMap::new(),
                },
            };
            statuses.insert(tool_id.to_string(), status);
        }

        Ok(statuses)
    }

    fn resolve_available(
        &self,
        tool_id: &str,
    ) -> Result<(&'static ProviderContract, ClientCredentials), BrokerError> {
        let contract = self.registry.resolve(tool_id)?;
        let credentials = self
            .registry
            .credentials(contract, &self.provider_env)
            .ok_or_else(|| BrokerError::ToolUnavailable(tool_id.to_string()))?;
        Ok((contract, credentials))
    }

    fn redirect_uri(&self, contract: &ProviderContract) -> String {
        format!(
            "{}{}",
            self.public_base_url.trim_end_matches('/'),
            contract.redirect_path
        )
    }

    /// Encrypt and upsert one token result. When the provider did not rotate
    /// the refresh token, the previously stored ciphertext is carried over;
    /// scopes fall back from the provider's report to the prior grant to the
    /// contract's request.
    async fn persist_tokens(
        &self,
        user_id: Uuid,
        tool_id: &str,
        contract: &ProviderContract,
        tokens: TokenResult,
        existing: Option<&connection::Model>,
    ) -> Result<connection::Model, BrokerError> {
        let aad = crypto::connection_aad(user_id, tool_id);

        let access_cipher = crypto::encrypt_bytes(
            &self.crypto_key,
            aad.as_bytes(),
            tokens.access_token.as_bytes(),
        )
        .map_err(|err| BrokerError::Internal(anyhow::Error::new(err)))?;

        let refresh_cipher = match tokens.refresh_token.as_deref() {
            Some(token) => Some(
                crypto::encrypt_bytes(&self.crypto_key, aad.as_bytes(), token.as_bytes())
                    .map_err(|err| BrokerError::Internal(anyhow::Error::new(err)))?,
            ),
            None => existing.and_then(|row| row.refresh_token_ciphertext.clone()),
        };

        let expires_at = tokens
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds as i64));

        let scopes = tokens
            .scope
            .as_deref()
            .map(split_scopes)
            .filter(|scopes| !scopes.is_empty())
            .or_else(|| {
                existing
                    .map(|row| row.scope_list())
                    .filter(|scopes| !scopes.is_empty())
            })
            .unwrap_or_else(|| contract.scopes.iter().map(|s| s.to_string()).collect());

        let mut metadata = existing.map(|row| row.metadata_map()).unwrap_or_default();
        metadata.extend(tokens.metadata);

        Ok(self
            .store
            .upsert_connection(NewConnection {
                user_id,
                tool_id: tool_id.to_string(),
                access_token_ciphertext: access_cipher,
                refresh_token_ciphertext: refresh_cipher,
                expires_at,
                scopes,
                metadata,
            })
            .await?)
    }
}

/// Providers report granted scopes space- or comma-delimited.
fn split_scopes(scope: &str) -> Vec<String> {
    scope
        .split([' ', ','])
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn broker_with_env(env: ProviderEnv) -> OAuthBroker {
        OAuthBroker::new(
            ContractRegistry::builtin().expect("builtin table is valid"),
            env,
            CryptoKey::new(vec![0x11; 32]).expect("valid test key"),
            ExchangeClient::new(),
            Arc::new(MemoryStore::new()),
            "https://app.example.com".to_string(),
        )
    }

    fn github_env() -> ProviderEnv {
        let mut env = ProviderEnv::new();
        env.insert("GITHUB_CLIENT_ID", "client-id");
        env.insert("GITHUB_CLIENT_SECRET", "client-secret");
        env
    }

    #[test]
    fn initiate_without_configuration_is_unavailable() {
        let broker = broker_with_env(ProviderEnv::new());
        let err = broker.initiate(Uuid::new_v4(), "github").unwrap_err();
        assert!(matches!(err, BrokerError::ToolUnavailable(tool) if tool == "github"));
    }

    #[test]
    fn initiate_with_unknown_tool_fails() {
        let broker = broker_with_env(github_env());
        let err = broker.initiate(Uuid::new_v4(), "linear").unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTool(_)));
    }

    #[test]
    fn initiate_builds_standard_authorize_url() {
        let broker = broker_with_env(github_env());
        let initiated = broker.initiate(Uuid::new_v4(), "github").unwrap();

        let pairs: HashMap<_, _> = initiated.authorize_url.query_pairs().collect();
        assert_eq!(pairs.get("client_id").unwrap(), "client-id");
        assert_eq!(
            pairs.get("redirect_uri").unwrap(),
            "https://app.example.com/oauth/callback/github"
        );
        assert_eq!(pairs.get("response_type").unwrap(), "code");
        assert!(pairs.contains_key("scope"));
        assert!(pairs.contains_key("state"));
        assert!(initiated.state_expires_at > Utc::now());
    }

    #[tokio::test]
    async fn callback_with_garbage_state_is_invalid() {
        let broker = broker_with_env(github_env());
        let err = broker
            .handle_callback("not-a-state", "some-code")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState));
    }

    #[tokio::test]
    async fn token_for_unconnected_tool_is_not_connected() {
        let broker = broker_with_env(github_env());
        let err = broker
            .get_valid_token(Uuid::new_v4(), "github")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_reflected_in_status() {
        let broker = broker_with_env(github_env());
        let user_id = Uuid::new_v4();

        broker.disconnect(user_id, "github").await.unwrap();
        broker.disconnect(user_id, "github").await.unwrap();

        let statuses = broker.status(user_id).await.unwrap();
        let github = statuses.get("github").unwrap();
        assert!(!github.connected);
        assert!(github.connected_at.is_none());
    }

    #[tokio::test]
    async fn disconnect_of_unknown_tool_fails() {
        let broker = broker_with_env(github_env());
        let err = broker
            .disconnect(Uuid::new_v4(), "linear")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn status_lists_every_registered_tool() {
        let broker = broker_with_env(github_env());
        let statuses = broker.status(Uuid::new_v4()).await.unwrap();

        for tool in ["github", "jira", "confluence", "google_calendar", "gmail", "slack", "figma"]
        {
            assert!(statuses.contains_key(tool), "missing tool '{}'", tool);
            assert!(!statuses.get(tool).unwrap().connected);
        }
    }

    #[test]
    fn split_scopes_handles_both_delimiters() {
        assert_eq!(split_scopes("repo read:org"), vec!["repo", "read:org"]);
        assert_eq!(
            split_scopes("channels:read,chat:write"),
            vec!["channels:read", "chat:write"]
        );
        assert!(split_scopes("").is_empty());
    }
}
