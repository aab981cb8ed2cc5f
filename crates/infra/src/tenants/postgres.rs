//! Postgres-backed tenant config source.
//!
//! Reads `va_provider_configs (va_id, provider_type, config_data, is_active, updated_at)`.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pirepsync_core::TenantId;

use super::{ProviderConfig, TenantConfigError, TenantConfigSource};

#[derive(Debug, Clone)]
pub struct PostgresTenantConfigSource {
    pool: PgPool,
}

impl PostgresTenantConfigSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(e: sqlx::Error) -> TenantConfigError {
    TenantConfigError::Storage(e.to_string())
}

#[async_trait]
impl TenantConfigSource for PostgresTenantConfigSource {
    async fn active_tenants(
        &self,
        provider_type: &str,
    ) -> Result<Vec<TenantId>, TenantConfigError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT va_id
            FROM va_provider_configs
            WHERE provider_type = $1 AND is_active
            ORDER BY va_id
            "#,
        )
        .bind(provider_type)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|r| {
                r.try_get::<Uuid, _>("va_id")
                    .map(TenantId::from_uuid)
                    .map_err(storage)
            })
            .collect()
    }

    async fn active_config(
        &self,
        tenant_id: TenantId,
        provider_type: &str,
    ) -> Result<Option<ProviderConfig>, TenantConfigError> {
        let row = sqlx::query(
            r#"
            SELECT provider_type, config_data
            FROM va_provider_configs
            WHERE va_id = $1 AND provider_type = $2 AND is_active
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(provider_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ProviderConfig {
            tenant_id,
            provider_type: row.try_get("provider_type").map_err(storage)?,
            config_data: row
                .try_get::<serde_json::Value, _>("config_data")
                .map_err(storage)?,
        }))
    }
}
