//! Connection entity model
//!
//! SeaORM entity for the connections table: one row per (user, tool) link to
//! an external provider. Token material is stored only as AES-GCM ciphertext.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Connection entity representing a user's link to one logical tool
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Logical tool this connection links to (e.g., "github", "jira")
    pub tool_id: String,

    /// Encrypted access token
    pub access_token_ciphertext: Vec<u8>,

    /// Encrypted refresh token; not every provider issues one
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry; absent for non-expiring tokens
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Granted OAuth scopes, stored as a JSON array
    #[sea_orm(column_type = "JsonBinary")]
    pub scopes: Option<JsonValue>,

    /// Provider-specific extras (e.g., a workspace or cloud-tenant id)
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    /// Timestamp when the connection was first established
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the connection was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Granted scopes as a plain string list.
    pub fn scope_list(&self) -> Vec<String> {
        self.scopes
            .as_ref()
            .and_then(|value| value.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Metadata as a plain string map.
    pub fn metadata_map(&self) -> std::collections::BTreeMap<String, String> {
        self.metadata
            .as_ref()
            .and_then(|value| value.as_object())
            .map(|object| {
                object
                    .iter()
                    .filter_map(|(key, v)| {
                        v.as_str().map(|value| (key.clone(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
