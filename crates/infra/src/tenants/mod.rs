//! Tenant provider configuration (which VAs are active, and how their source
//! columns map onto canonical attributes).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pirepsync_core::TenantId;

pub mod postgres;

pub use postgres::PostgresTenantConfigSource;

/// Provider type whose configs carry PIREP schemas.
pub const AIRTABLE_PROVIDER: &str = "airtable";

#[derive(Debug, Clone, thiserror::Error)]
pub enum TenantConfigError {
    #[error("invalid provider config for tenant {tenant_id}: {reason}")]
    Invalid { tenant_id: TenantId, reason: String },

    #[error("config storage error: {0}")]
    Storage(String),
}

/// One tenant's active configuration for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub tenant_id: TenantId,
    pub provider_type: String,
    pub config_data: serde_json::Value,
}

/// Canonical name → external column name for one record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl TableSchema {
    /// External field name mapped to `canonical`, if any.
    pub fn field_mapping(&self, canonical: &str) -> Option<&str> {
        self.fields
            .get(canonical)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Parsed `config_data`: schemas keyed by record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSchemas {
    #[serde(default)]
    pub base_id: Option<String>,
    #[serde(default)]
    pub schemas: HashMap<String, TableSchema>,
}

impl ProviderSchemas {
    pub fn schema(&self, kind: &str) -> Option<&TableSchema> {
        self.schemas.get(kind)
    }
}

impl ProviderConfig {
    pub fn new(
        tenant_id: TenantId,
        provider_type: impl Into<String>,
        config_data: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            provider_type: provider_type.into(),
            config_data,
        }
    }

    /// Parse `config_data`. A JSON string holding the document is accepted too.
    pub fn parse_config_data(&self) -> Result<ProviderSchemas, TenantConfigError> {
        let invalid = |reason: String| TenantConfigError::Invalid {
            tenant_id: self.tenant_id,
            reason,
        };

        match &self.config_data {
            serde_json::Value::String(raw) => {
                serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))
            }
            value => serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string())),
        }
    }
}

/// Source of tenant provider configuration.
#[async_trait]
pub trait TenantConfigSource: Send + Sync {
    /// Tenants with an active config for `provider_type`.
    async fn active_tenants(
        &self,
        provider_type: &str,
    ) -> Result<Vec<TenantId>, TenantConfigError>;

    async fn active_config(
        &self,
        tenant_id: TenantId,
        provider_type: &str,
    ) -> Result<Option<ProviderConfig>, TenantConfigError>;
}

/// In-memory config source for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTenantConfigSource {
    inner: RwLock<HashMap<(TenantId, String), (ProviderConfig, bool)>>,
}

impl InMemoryTenantConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a config and mark it active.
    pub fn upsert(&self, config: ProviderConfig) {
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        map.insert((config.tenant_id, config.provider_type.clone()), (config, true));
    }

    pub fn deactivate(&self, tenant_id: TenantId, provider_type: &str) {
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some((_, active)) = map.get_mut(&(tenant_id, provider_type.to_string())) {
            *active = false;
        }
    }
}

#[async_trait]
impl TenantConfigSource for InMemoryTenantConfigSource {
    async fn active_tenants(
        &self,
        provider_type: &str,
    ) -> Result<Vec<TenantId>, TenantConfigError> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut tenants: Vec<TenantId> = map
            .iter()
            .filter(|((_, p), (_, active))| p == provider_type && *active)
            .map(|((t, _), _)| *t)
            .collect();
        tenants.sort_unstable();
        Ok(tenants)
    }

    async fn active_config(
        &self,
        tenant_id: TenantId,
        provider_type: &str,
    ) -> Result<Option<ProviderConfig>, TenantConfigError> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        Ok(map
            .get(&(tenant_id, provider_type.to_string()))
            .filter(|(_, active)| *active)
            .map(|(c, _)| c.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(tenant_id: TenantId, data: serde_json::Value) -> ProviderConfig {
        ProviderConfig::new(tenant_id, AIRTABLE_PROVIDER, data)
    }

    #[test]
    fn parses_schemas_by_kind() {
        let cfg = config(
            TenantId::new(),
            json!({
                "base_id": "appXYZ",
                "schemas": {
                    "pireps": {
                        "table_name": "PIREPs",
                        "fields": {"route": "Route", "flight_time": "FlightTime", "livery": ""}
                    }
                }
            }),
        );

        let schemas = cfg.parse_config_data().unwrap();
        let pireps = schemas.schema("pireps").unwrap();
        assert_eq!(pireps.table_name, "PIREPs");
        assert_eq!(pireps.field_mapping("route"), Some("Route"));
        assert_eq!(pireps.field_mapping("livery"), None);
        assert_eq!(pireps.field_mapping("aircraft"), None);
        assert!(schemas.schema("pilots").is_none());
    }

    #[test]
    fn accepts_config_stored_as_json_string() {
        let cfg = config(
            TenantId::new(),
            json!(r#"{"schemas":{"pireps":{"fields":{"route":"Route"}}}}"#),
        );
        let schemas = cfg.parse_config_data().unwrap();
        assert_eq!(schemas.schema("pireps").unwrap().field_mapping("route"), Some("Route"));
    }

    #[test]
    fn rejects_malformed_config() {
        let cfg = config(TenantId::new(), json!({"schemas": ["not", "a", "map"]}));
        assert!(matches!(
            cfg.parse_config_data(),
            Err(TenantConfigError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn in_memory_source_lists_only_active_tenants() {
        let source = InMemoryTenantConfigSource::new();
        let a = TenantId::new();
        let b = TenantId::new();
        source.upsert(config(a, json!({})));
        source.upsert(config(b, json!({})));
        source.upsert(ProviderConfig::new(TenantId::new(), "sheets", json!({})));
        source.deactivate(b, AIRTABLE_PROVIDER);

        let active = source.active_tenants(AIRTABLE_PROVIDER).await.unwrap();
        assert_eq!(active, vec![a]);
        assert!(source.active_config(b, AIRTABLE_PROVIDER).await.unwrap().is_none());
        assert!(source.active_config(a, AIRTABLE_PROVIDER).await.unwrap().is_some());
    }
}
