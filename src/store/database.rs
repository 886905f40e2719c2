//! SeaORM-backed connection store
//!
//! Production implementation of [`ConnectionStore`] over the connections
//! table. The unique (user_id, tool_id) index plus `ON CONFLICT DO UPDATE`
//! makes the upsert a single atomic statement, so last-writer-wins holds for
//! concurrent callback retries and refreshes without in-process locks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::models::connection::{self, Entity as Connection};
use crate::store::{ConnectionStore, NewConnection, StoreError};

/// Repository over the connections table
#[derive(Debug, Clone)]
pub struct DatabaseStore {
    db: Arc<DatabaseConnection>,
}

impl DatabaseStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConnectionStore for DatabaseStore {
    async fn upsert_connection(
        &self,
        record: NewConnection,
    ) -> Result<connection::Model, StoreError> {
        let now: DateTimeWithTimeZone = Utc::now().into();

        let active = connection::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(record.user_id),
            tool_id: Set(record.tool_id.clone()),
            access_token_ciphertext: Set(record.access_token_ciphertext),
            refresh_token_ciphertext: Set(record.refresh_token_ciphertext),
            expires_at: Set(record.expires_at.map(Into::into)),
            scopes: Set(Some(serde_json::json!(record.scopes))),
            metadata: Set(Some(serde_json::json!(record.metadata))),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Connection::insert(active)
            .on_conflict(
                OnConflict::columns([connection::Column::UserId, connection::Column::ToolId])
                    .update_columns([
                        connection::Column::AccessTokenCiphertext,
                        connection::Column::RefreshTokenCiphertext,
                        connection::Column::ExpiresAt,
                        connection::Column::Scopes,
                        connection::Column::Metadata,
                        connection::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        // Re-read by the unique key; the insert id is not reliable across
        // backends when the conflict branch ran.
        let row = Connection::find()
            .filter(connection::Column::UserId.eq(record.user_id))
            .filter(connection::Column::ToolId.eq(record.tool_id.as_str()))
            .one(&*self.db)
            .await?;

        row.ok_or(StoreError::NotPersisted)
    }

    async fn get_connection(
        &self,
        user_id: Uuid,
        tool_id: &str,
    ) -> Result<Option<connection::Model>, StoreError> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(user_id))
            .filter(connection::Column::ToolId.eq(tool_id))
            .one(&*self.db)
            .await?)
    }

    async fn delete_connection(&self, user_id: Uuid, tool_id: &str) -> Result<bool, StoreError> {
        let result = Connection::delete_many()
            .filter(connection::Column::UserId.eq(user_id))
            .filter(connection::Column::ToolId.eq(tool_id))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    async fn list_connections(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<connection::Model>, StoreError> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(user_id))
            .order_by_asc(connection::Column::ToolId)
            .all(&*self.db)
            .await?)
    }

    async fn list_all_connections(&self) -> Result<Vec<connection::Model>, StoreError> {
        Ok(Connection::find()
            .order_by_asc(connection::Column::UserId)
            .order_by_asc(connection::Column::ToolId)
            .all(&*self.db)
            .await?)
    }
}
