//! Schema-driven transform of a raw queue item into a canonical PIREP upsert.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use pirepsync_core::{
    DomainError, FieldValue, PirepField, PirepFields, PirepRecord, TenantId, PIREP_RECORD_KIND,
};
use pirepsync_queue::QueueItem;

use crate::cache::{CacheError, CacheProvider};
use crate::records::{RecordStore, StoreError};
use crate::tenants::{TableSchema, TenantConfigError, TenantConfigSource, AIRTABLE_PROVIDER};

/// Default lifetime of a cached tenant schema.
pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    /// Missing, unparsable, or incomplete tenant configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid record: {0}")]
    InvalidRecord(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<TenantConfigError> for ProcessError {
    fn from(e: TenantConfigError) -> Self {
        ProcessError::Configuration(e.to_string())
    }
}

/// Cache key for a tenant's resolved schema of one record kind.
pub fn schema_cache_key(tenant_id: TenantId, kind: &str) -> String {
    format!("schema:{tenant_id}:{kind}")
}

/// Canonical attributes pulled out of one raw item, before keying.
pub type ExtractedPirep = PirepFields;

/// Map raw source fields through `schema` onto canonical attributes.
///
/// Unmapped attributes and values that fail coercion stay unset. Never fails.
pub fn extract(raw: &HashMap<String, FieldValue>, schema: &TableSchema) -> ExtractedPirep {
    let mut fields = PirepFields::default();

    for field in PirepField::ALL {
        let Some(column) = schema.field_mapping(field.canonical_name()) else {
            continue;
        };
        let Some(value) = raw.get(column) else {
            continue;
        };

        if let Err(e) = fields.apply(field, value) {
            debug!(
                field = field.canonical_name(),
                column,
                kind = %field.kind(),
                error = %e,
                "field coercion failed; leaving unset"
            );
        }
    }

    fields
}

/// Turns queue items into canonical records and stores them.
pub struct RecordProcessor {
    configs: Arc<dyn TenantConfigSource>,
    records: Arc<dyn RecordStore>,
    cache: CacheProvider,
    schema_ttl: Duration,
}

impl RecordProcessor {
    pub fn new(
        configs: Arc<dyn TenantConfigSource>,
        records: Arc<dyn RecordStore>,
        cache: CacheProvider,
    ) -> Self {
        Self {
            configs,
            records,
            cache,
            schema_ttl: DEFAULT_SCHEMA_TTL,
        }
    }

    pub fn with_schema_ttl(mut self, ttl: Duration) -> Self {
        self.schema_ttl = ttl;
        self
    }

    /// The tenant's field mapping for `kind`, read through the schema cache.
    pub async fn resolve(
        &self,
        tenant_id: TenantId,
        kind: &str,
    ) -> Result<TableSchema, ProcessError> {
        let key = schema_cache_key(tenant_id, kind);
        self.cache
            .get_or_load(&key, self.schema_ttl, || self.load_schema(tenant_id, kind))
            .await
    }

    async fn load_schema(
        &self,
        tenant_id: TenantId,
        kind: &str,
    ) -> Result<TableSchema, ProcessError> {
        let config = self
            .configs
            .active_config(tenant_id, AIRTABLE_PROVIDER)
            .await?
            .ok_or_else(|| {
                ProcessError::Configuration(format!(
                    "no active {AIRTABLE_PROVIDER} config for tenant {tenant_id}"
                ))
            })?;

        let schemas = config.parse_config_data()?;
        schemas.schema(kind).cloned().ok_or_else(|| {
            ProcessError::Configuration(format!(
                "tenant {tenant_id} has no schema for record kind {kind:?}"
            ))
        })
    }

    /// Drop the cached schema so the next `resolve` reloads it.
    pub async fn invalidate_schema(
        &self,
        tenant_id: TenantId,
        kind: &str,
    ) -> Result<(), ProcessError> {
        self.cache.delete(&schema_cache_key(tenant_id, kind)).await?;
        Ok(())
    }

    /// Build the canonical record for `item` under `schema`.
    ///
    /// When the schema leaves `created_time` unset, the item's own creation
    /// time is used if it parses.
    pub fn build_record(
        &self,
        item: &QueueItem,
        schema: &TableSchema,
    ) -> Result<PirepRecord, ProcessError> {
        let mut fields = extract(&item.fields, schema);

        if !fields.is_set(PirepField::CreatedTime) && !item.created_time.trim().is_empty() {
            let fallback = FieldValue::Text(item.created_time.clone());
            if let Err(e) = fields.apply(PirepField::CreatedTime, &fallback) {
                debug!(
                    tenant_id = %item.va_id,
                    record_id = %item.airtable_record_id,
                    error = %e,
                    "item created_time unusable"
                );
            }
        }

        Ok(PirepRecord::new(item.va_id, item.airtable_record_id.as_str(), fields)?)
    }

    /// Insert-or-update keyed by `(tenant, external id)`.
    pub async fn upsert(&self, record: &PirepRecord) -> Result<(), ProcessError> {
        self.records.upsert(record).await?;
        Ok(())
    }

    /// Resolve, extract, build, upsert.
    pub async fn process(&self, item: &QueueItem) -> Result<PirepRecord, ProcessError> {
        let schema = self.resolve(item.va_id, PIREP_RECORD_KIND).await?;
        let record = self.build_record(item, &schema)?;
        self.upsert(&record).await?;

        debug!(
            tenant_id = %item.va_id,
            record_id = %item.airtable_record_id,
            "pirep upserted"
        );
        Ok(record)
    }
}
