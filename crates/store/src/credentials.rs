//! Credential storage, encrypted at rest.
//!
//! Field maps are AES-256-GCM encrypted before they reach the database and
//! come back wrapped in `Sensitive` so they cannot serialize in the clear.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use floe_core::sensitive::Sensitive;

use crate::api::{Credential, CredentialResolver};
use crate::crypto::Encryptor;
use crate::error::{StoreError, StoreResult};
use crate::pool::DbPool;

/// Credential metadata, safe to list.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CredentialInfo {
    pub name: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Encrypted credential store over PostgreSQL.
#[derive(Clone)]
pub struct CredentialStore {
    pool: DbPool,
    encryptor: Encryptor,
}

impl CredentialStore {
    /// Create a store with a base64-encoded 32-byte key.
    pub fn new(pool: DbPool, key_base64: &str) -> StoreResult<Self> {
        Ok(Self {
            pool,
            encryptor: Encryptor::from_base64(key_base64)?,
        })
    }

    /// Insert or replace a credential.
    pub async fn put(
        &self,
        name: &str,
        kind: &str,
        fields: &HashMap<String, String>,
    ) -> StoreResult<()> {
        let payload = self.encryptor.encrypt_json(&serde_json::to_value(fields)?)?;

        sqlx::query(
            r#"
            INSERT INTO floe.credential (name, kind, payload, created_at, updated_at)
            VALUES ($1, $2, $3, now(), now())
            ON CONFLICT (name) DO UPDATE SET
                kind = EXCLUDED.kind,
                payload = EXCLUDED.payload,
                updated_at = now()
            "#,
        )
        .bind(name)
        .bind(kind)
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a credential.
    pub async fn delete(&self, name: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM floe.credential WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("credential {}", name)));
        }
        Ok(())
    }

    /// List credential metadata (no secret material).
    pub async fn list(&self) -> StoreResult<Vec<CredentialInfo>> {
        let rows: Vec<(String, String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT name, kind, created_at, updated_at FROM floe.credential ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, kind, created_at, updated_at)| CredentialInfo {
                name,
                kind,
                created_at,
                updated_at,
            })
            .collect())
    }
}

#[async_trait]
impl CredentialResolver for CredentialStore {
    async fn resolve(&self, key: &str) -> StoreResult<Option<Credential>> {
        let row: Option<(String, Vec<u8>)> =
            sqlx::query_as("SELECT kind, payload FROM floe.credential WHERE name = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        let (kind, payload) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let decrypted = self.encryptor.decrypt_json(&payload)?;
        let fields: HashMap<String, String> = serde_json::from_value(decrypted)?;

        Ok(Some(Credential {
            kind,
            fields: fields
                .into_iter()
                .map(|(field, value)| (field, Sensitive::new(value)))
                .collect(),
        }))
    }
}
