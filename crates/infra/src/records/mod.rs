//! Canonical PIREP storage, keyed by `(va_id, airtable_record_id)`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use pirepsync_core::{PirepRecord, TenantId};

pub mod postgres;

pub use postgres::PostgresRecordStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored row is invalid: {0}")]
    Corrupt(String),
}

/// Insert-or-update store for canonical records.
///
/// `upsert` never clears a stored attribute: fields that are `None` on the
/// incoming record keep their prior values. `backfill_status` is only written
/// on insert.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, record: &PirepRecord) -> Result<(), StoreError>;

    async fn get(
        &self,
        tenant_id: TenantId,
        external_id: &str,
    ) -> Result<Option<PirepRecord>, StoreError>;

    async fn count(&self, tenant_id: TenantId) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn upsert(&self, record: &PirepRecord) -> Result<(), StoreError> {
        (**self).upsert(record).await
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        external_id: &str,
    ) -> Result<Option<PirepRecord>, StoreError> {
        (**self).get(tenant_id, external_id).await
    }

    async fn count(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        (**self).count(tenant_id).await
    }
}

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    inner: RwLock<HashMap<(TenantId, String), PirepRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert(&self, record: &PirepRecord) -> Result<(), StoreError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| StoreError::Backend("record map poisoned".into()))?;

        let key = (record.tenant_id(), record.external_id().to_string());
        match map.get_mut(&key) {
            Some(stored) => stored.merge_from(record),
            None => {
                let mut fresh = record.clone();
                fresh.backfill_status = Default::default();
                map.insert(key, fresh);
            }
        }
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        external_id: &str,
    ) -> Result<Option<PirepRecord>, StoreError> {
        let map = self
            .inner
            .read()
            .map_err(|_| StoreError::Backend("record map poisoned".into()))?;
        Ok(map.get(&(tenant_id, external_id.to_string())).cloned())
    }

    async fn count(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        let map = self
            .inner
            .read()
            .map_err(|_| StoreError::Backend("record map poisoned".into()))?;
        Ok(map.keys().filter(|(t, _)| *t == tenant_id).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pirepsync_core::{BackfillStatus, PirepFields};

    fn record(tenant_id: TenantId, fields: PirepFields) -> PirepRecord {
        PirepRecord::new(tenant_id, "rec1", fields).unwrap()
    }

    #[tokio::test]
    async fn repeated_upsert_leaves_one_identical_row() {
        let store = InMemoryRecordStore::new();
        let t = TenantId::new();
        let r = record(
            t,
            PirepFields {
                route: Some("KSEA-KLAX".into()),
                flight_time: Some(125.5),
                ..Default::default()
            },
        );

        store.upsert(&r).await.unwrap();
        let first = store.get(t, "rec1").await.unwrap();
        store.upsert(&r).await.unwrap();

        assert_eq!(store.count(t).await.unwrap(), 1);
        assert_eq!(store.get(t, "rec1").await.unwrap(), first);
    }

    #[tokio::test]
    async fn unset_fields_keep_stored_values() {
        let store = InMemoryRecordStore::new();
        let t = TenantId::new();
        store
            .upsert(&record(
                t,
                PirepFields {
                    route: Some("KSEA-KLAX".into()),
                    aircraft: Some("B738".into()),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        store
            .upsert(&record(
                t,
                PirepFields {
                    aircraft: Some("A321".into()),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        let stored = store.get(t, "rec1").await.unwrap().unwrap();
        assert_eq!(stored.fields.route.as_deref(), Some("KSEA-KLAX"));
        assert_eq!(stored.fields.aircraft.as_deref(), Some("A321"));
        assert_eq!(stored.backfill_status, BackfillStatus::Pending);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = InMemoryRecordStore::new();
        let a = TenantId::new();
        let b = TenantId::new();
        store.upsert(&record(a, PirepFields::default())).await.unwrap();

        assert_eq!(store.count(a).await.unwrap(), 1);
        assert_eq!(store.count(b).await.unwrap(), 0);
        assert!(store.get(b, "rec1").await.unwrap().is_none());
    }
}
