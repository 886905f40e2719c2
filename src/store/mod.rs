//! Credential store boundary
//!
//! [`ConnectionStore`] is the persistence seam for encrypted connection rows,
//! keyed by the unique (user, tool) pair. The broker only ever talks to this
//! trait; production wires in the SeaORM-backed [`DatabaseStore`], tests and
//! the local profile can use [`MemoryStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::connection;

mod database;
mod memory;

pub use database::DatabaseStore;
pub use memory::MemoryStore;

/// Errors from the persistence boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] sea_orm::DbErr),

    #[error("connection row not visible after upsert")]
    NotPersisted,
}

/// Replacement state for a (user, tool) connection row. Upserting supersedes
/// any prior row; there is never more than one per pair.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub user_id: Uuid,
    pub tool_id: String,
    pub access_token_ciphertext: Vec<u8>,
    pub refresh_token_ciphertext: Option<Vec<u8>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Persistence operations for encrypted connection rows.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Writes the row for (user, tool), superseding any prior row. The write
    /// is atomic: concurrent upserts converge to the last writer, and no
    /// half-written row is ever visible.
    async fn upsert_connection(
        &self,
        record: NewConnection,
    ) -> Result<connection::Model, StoreError>;

    /// Loads the row for (user, tool), if any.
    async fn get_connection(
        &self,
        user_id: Uuid,
        tool_id: &str,
    ) -> Result<Option<connection::Model>, StoreError>;

    /// Deletes the row for (user, tool). Returns whether a row existed;
    /// deleting an absent row is not an error.
    async fn delete_connection(&self, user_id: Uuid, tool_id: &str) -> Result<bool, StoreError>;

    /// Lists all rows belonging to a user.
    async fn list_connections(&self, user_id: Uuid) -> Result<Vec<connection::Model>, StoreError>;

    /// Lists every row in the store (administrative sweeps).
    async fn list_all_connections(&self) -> Result<Vec<connection::Model>, StoreError>;
}
