//! Provider contract registry
//!
//! Static, compiled-in table of OAuth provider definitions: endpoint URLs,
//! the env-key names holding the shared app credentials, requested scopes,
//! and the logical tools each app registration serves. Pure data plus
//! validation; no I/O happens here.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Per-provider normalization hook that lifts non-secret extras (workspace or
/// cloud-tenant identifiers) out of a token response into connection metadata.
pub type MetadataFn = fn(&serde_json::Value) -> BTreeMap<String, String>;

/// Static definition of one OAuth provider app registration.
#[derive(Debug, Clone)]
pub struct ProviderContract {
    /// Provider identifier (snake_case, e.g., "github")
    pub provider_id: &'static str,
    /// Authorization endpoint the user is redirected to
    pub authorize_url: &'static str,
    /// Token endpoint for code exchange and refresh grants
    pub token_url: &'static str,
    /// Env key holding the shared app client id
    pub client_id_env: &'static str,
    /// Env key holding the shared app client secret
    pub client_secret_env: &'static str,
    /// Fixed redirect path appended to the public base URL
    pub redirect_path: &'static str,
    /// Requested scopes, in the order the provider documents them
    pub scopes: &'static [&'static str],
    /// Delimiter the provider expects between scopes
    pub scope_delimiter: &'static str,
    /// Logical tools served by this app registration (one or more)
    pub tool_ids: &'static [&'static str],
    /// Provider-specific extras appended to the authorize URL
    pub extra_params: &'static [(&'static str, &'static str)],
    /// Normalizer for provider-specific token response extras
    pub normalize_metadata: MetadataFn,
    /// Metadata keys safe to expose in status output
    pub display_metadata_keys: &'static [&'static str],
}

impl ProviderContract {
    /// Scopes joined with the provider's delimiter, for the `scope` parameter.
    pub fn scope_string(&self) -> String {
        self.scopes.join(self.scope_delimiter)
    }
}

fn no_metadata(_body: &serde_json::Value) -> BTreeMap<String, String> {
    BTreeMap::new()
}

/// Slack returns the workspace identity alongside the tokens; every
/// subsequent API call is scoped by it.
fn slack_metadata(body: &serde_json::Value) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    if let Some(team) = body.get("team") {
        if let Some(id) = team.get("id").and_then(|v| v.as_str()) {
            metadata.insert("team_id".to_string(), id.to_string());
        }
        if let Some(name) = team.get("name").and_then(|v| v.as_str()) {
            metadata.insert("team_name".to_string(), name.to_string());
        }
    }
    metadata
}

/// Atlassian scopes the granted site through `accessible-resources`; when the
/// token response carries a cloud id hint (some tenants do), keep it.
fn atlassian_metadata(body: &serde_json::Value) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    if let Some(cloud_id) = body.get("cloud_id").and_then(|v| v.as_str()) {
        metadata.insert("cloud_id".to_string(), cloud_id.to_string());
    }
    metadata
}

/// The compiled-in provider table. One entry per app registration; a single
/// registration may serve several logical tools (Atlassian serves Jira and
/// Confluence under one set of scopes, Google serves Calendar and Gmail).
pub static CONTRACTS: &[ProviderContract] = &[
    ProviderContract {
        provider_id: "github",
        authorize_url: "https://github.com/login/oauth/authorize",
        token_url: "https://github.com/login/oauth/access_token",
        client_id_env: "GITHUB_CLIENT_ID",
        client_secret_env: "GITHUB_CLIENT_SECRET",
        redirect_path: "/oauth/callback/github",
        scopes: &["repo", "read:org"],
        scope_delimiter: " ",
        tool_ids: &["github"],
        extra_params: &[],
        normalize_metadata: no_metadata,
        display_metadata_keys: &[],
    },
    ProviderContract {
        provider_id: "atlassian",
        authorize_url: "https://auth.atlassian.com/authorize",
        token_url: "https://auth.atlassian.com/oauth/token",
        client_id_env: "ATLASSIAN_CLIENT_ID",
        client_secret_env: "ATLASSIAN_CLIENT_SECRET",
        redirect_path: "/oauth/callback/atlassian",
        scopes: &[
            "read:jira-work",
            "read:jira-user",
            "read:confluence-content.all",
            "offline_access",
        ],
        scope_delimiter: " ",
        tool_ids: &["jira", "confluence"],
        extra_params: &[
            ("audience", "api.atlassian.com"),
            ("prompt", "consent"),
        ],
        normalize_metadata: atlassian_metadata,
        display_metadata_keys: &["cloud_id"],
    },
    ProviderContract {
        provider_id: "google",
        authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
        token_url: "https://oauth2.googleapis.com/token",
        client_id_env: "GOOGLE_CLIENT_ID",
        client_secret_env: "GOOGLE_CLIENT_SECRET",
        redirect_path: "/oauth/callback/google",
        scopes: &[
            "https://www.googleapis.com/auth/calendar.readonly",
            "https://www.googleapis.com/auth/gmail.readonly",
        ],
        scope_delimiter: " ",
        tool_ids: &["google_calendar", "gmail"],
        extra_params: &[("access_type", "offline"), ("prompt", "consent")],
        normalize_metadata: no_metadata,
        display_metadata_keys: &[],
    },
    ProviderContract {
        provider_id: "slack",
        authorize_url: "https://slack.com/oauth/v2/authorize",
        token_url: "https://slack.com/api/oauth.v2.access",
        client_id_env: "SLACK_CLIENT_ID",
        client_secret_env: "SLACK_CLIENT_SECRET",
        redirect_path: "/oauth/callback/slack",
        scopes: &["channels:read", "chat:write"],
        scope_delimiter: ",",
        tool_ids: &["slack"],
        extra_params: &[],
        normalize_metadata: slack_metadata,
        display_metadata_keys: &["team_id", "team_name"],
    },
    ProviderContract {
        provider_id: "figma",
        authorize_url: "https://www.figma.com/oauth",
        token_url: "https://api.figma.com/v1/oauth/token",
        client_id_env: "FIGMA_CLIENT_ID",
        client_secret_env: "FIGMA_CLIENT_SECRET",
        redirect_path: "/oauth/callback/figma",
        scopes: &["file_read"],
        scope_delimiter: " ",
        tool_ids: &["figma"],
        extra_params: &[],
        normalize_metadata: no_metadata,
        display_metadata_keys: &[],
    },
];

/// Snapshot of the provider-credential environment taken at configuration
/// load time. Availability checks read this snapshot, never the process
/// environment, so an empty snapshot makes every tool unavailable in tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ProviderEnv(BTreeMap<String, String>);

impl ProviderEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the configured value; empty strings count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key/value view with secret-bearing values replaced, for config dumps.
    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(key, value)| {
                let shown = if key.ends_with("_CLIENT_SECRET") {
                    "[REDACTED]".to_string()
                } else {
                    value.clone()
                };
                (key.clone(), shown)
            })
            .collect()
    }
}

/// Client id/secret pair resolved for one provider app.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Errors raised by contract lookup and table validation.
#[derive(Debug, Clone, Error)]
pub enum ContractError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("tool '{tool}' is declared by both '{first}' and '{second}'")]
    DuplicateTool {
        tool: String,
        first: String,
        second: String,
    },
    #[error("provider '{0}' declares no tools")]
    EmptyToolSet(String),
    #[error("provider '{provider}' endpoint '{url}' is not a valid https URL")]
    InvalidEndpoint { provider: String, url: String },
}

/// Providers must be reached over https; plain http is tolerated only for
/// loopback mock servers.
fn is_acceptable_endpoint(url: &Url) -> bool {
    match url.scheme() {
        "https" => true,
        "http" => matches!(url.host_str(), Some("127.0.0.1") | Some("localhost")),
        _ => false,
    }
}

/// Lookup structure over a contract table, keyed by tool id.
#[derive(Debug, Clone)]
pub struct ContractRegistry {
    contracts: &'static [ProviderContract],
    by_tool: HashMap<&'static str, usize>,
}

impl ContractRegistry {
    /// Builds a registry over the given table, validating its invariants:
    /// every tool maps to exactly one provider, tool sets are non-empty,
    /// endpoints are https URLs.
    pub fn new(contracts: &'static [ProviderContract]) -> Result<Self, ContractError> {
        let mut by_tool: HashMap<&'static str, usize> = HashMap::new();

        for (index, contract) in contracts.iter().enumerate() {
            if contract.tool_ids.is_empty() {
                return Err(ContractError::EmptyToolSet(contract.provider_id.to_string()));
            }

            for endpoint in [contract.authorize_url, contract.token_url] {
                let valid = Url::parse(endpoint)
                    .map(|url| is_acceptable_endpoint(&url))
                    .unwrap_or(false);
                if !valid {
                    return Err(ContractError::InvalidEndpoint {
                        provider: contract.provider_id.to_string(),
                        url: endpoint.to_string(),
                    });
                }
            }

            for tool_id in contract.tool_ids.iter().copied() {
                if let Some(existing) = by_tool.insert(tool_id, index) {
                    return Err(ContractError::DuplicateTool {
                        tool: tool_id.to_string(),
                        first: contracts[existing].provider_id.to_string(),
                        second: contract.provider_id.to_string(),
                    });
                }
            }
        }

        Ok(Self { contracts, by_tool })
    }

    /// Registry over the compiled-in provider table.
    pub fn builtin() -> Result<Self, ContractError> {
        Self::new(CONTRACTS)
    }

    /// Resolves the contract serving the given tool.
    pub fn resolve(&self, tool_id: &str) -> Result<&'static ProviderContract, ContractError> {
        self.by_tool
            .get(tool_id)
            .map(|index| &self.contracts[*index])
            .ok_or_else(|| ContractError::UnknownTool(tool_id.to_string()))
    }

    /// Resolves a contract by provider id (for callback routing diagnostics).
    pub fn resolve_provider(
        &self,
        provider_id: &str,
    ) -> Result<&'static ProviderContract, ContractError> {
        self.contracts
            .iter()
            .find(|contract| contract.provider_id == provider_id)
            .ok_or_else(|| ContractError::UnknownProvider(provider_id.to_string()))
    }

    /// Resolves the app credentials for a contract from the env snapshot.
    /// `None` means the provider app is not configured in this deployment.
    pub fn credentials(
        &self,
        contract: &ProviderContract,
        env: &ProviderEnv,
    ) -> Option<ClientCredentials> {
        let client_id = env.get(contract.client_id_env)?;
        let client_secret = env.get(contract.client_secret_env)?;
        Some(ClientCredentials {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Tools whose provider app credentials are present in the snapshot.
    /// Absence is a deployment choice, not an error.
    pub fn list_available(&self, env: &ProviderEnv) -> Vec<&'static str> {
        let mut tools: Vec<&'static str> = self
            .contracts
            .iter()
            .filter(|contract| self.credentials(contract, env).is_some())
            .flat_map(|contract| contract.tool_ids.iter().copied())
            .collect();
        tools.sort_unstable();
        tools
    }

    /// Every registered tool id, sorted for stable output.
    pub fn all_tools(&self) -> Vec<&'static str> {
        let mut tools: Vec<&'static str> = self.by_tool.keys().copied().collect();
        tools.sort_unstable();
        tools
    }

    /// Env keys a provider needs before its tools become available.
    pub fn required_env_keys(
        &self,
        provider_id: &str,
    ) -> Result<[&'static str; 2], ContractError> {
        let contract = self.resolve_provider(provider_id)?;
        Ok([contract.client_id_env, contract.client_secret_env])
    }

    /// The underlying table (used by the config loader to know which env
    /// keys to snapshot).
    pub fn contracts(&self) -> &'static [ProviderContract] {
        self.contracts
    }
}
