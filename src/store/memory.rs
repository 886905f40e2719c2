//! In-memory connection store
//!
//! [`ConnectionStore`] over a map, for tests and the local profile. Mirrors
//! the database store's upsert semantics: one row per (user, tool), the
//! existing row's identity and creation time survive an upsert.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::connection;
use crate::store::{ConnectionStore, NewConnection, StoreError};

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    rows: Arc<RwLock<HashMap<(Uuid, String), connection::Model>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn upsert_connection(
        &self,
        record: NewConnection,
    ) -> Result<connection::Model, StoreError> {
        let mut rows = self.rows.write().await;
        let key = (record.user_id, record.tool_id.clone());
        let now = Utc::now().into();

        let (id, created_at) = match rows.get(&key) {
            Some(existing) => (existing.id, existing.created_at),
            None => (Uuid::new_v4(), now),
        };

        let row = connection::Model {
            id,
            user_id: record.user_id,
            tool_id: record.tool_id,
            access_token_ciphertext: record.access_token_ciphertext,
            refresh_token_ciphertext: record.refresh_token_ciphertext,
            expires_at: record.expires_at.map(Into::into),
            scopes: Some(serde_json::json!(record.scopes)),
            metadata: Some(serde_json::json!(record.metadata)),
            created_at,
            updated_at: now,
        };

        rows.insert(key, row.clone());
        Ok(row)
    }

    async fn get_connection(
        &self,
        user_id: Uuid,
        tool_id: &str,
    ) -> Result<Option<connection::Model>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows.get(&(user_id, tool_id.to_string())).cloned())
    }

    async fn delete_connection(&self, user_id: Uuid, tool_id: &str) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;
        Ok(rows.remove(&(user_id, tool_id.to_string())).is_some())
    }

    async fn list_connections(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<connection::Model>, StoreError> {
        let rows = self.rows.read().await;
        let mut result: Vec<connection::Model> = rows
            .values()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        Ok(result)
    }

    async fn list_all_connections(&self) -> Result<Vec<connection::Model>, StoreError> {
        let rows = self.rows.read().await;
        let mut result: Vec<connection::Model> = rows.values().cloned().collect();
        result.sort_by(|a, b| (a.user_id, &a.tool_id).cmp(&(b.user_id, &b.tool_id)));
        Ok(result)
    }
}
