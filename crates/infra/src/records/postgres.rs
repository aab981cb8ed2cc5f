//! Postgres-backed record store.
//!
//! Every query is scoped by `va_id`. Updates go through `COALESCE` so a NULL
//! in the incoming row never overwrites a stored value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use pirepsync_core::{BackfillStatus, PirepFields, PirepRecord, TenantId};

use super::{RecordStore, StoreError};

#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn decode_row(tenant_id: TenantId, row: &PgRow) -> Result<PirepRecord, StoreError> {
    let corrupt = |e: sqlx::Error| StoreError::Corrupt(e.to_string());

    let fields = PirepFields {
        route: row.try_get("route").map_err(corrupt)?,
        flight_mode: row.try_get("flight_mode").map_err(corrupt)?,
        flight_time: row.try_get("flight_time").map_err(corrupt)?,
        pilot_callsign: row.try_get("pilot_callsign").map_err(corrupt)?,
        aircraft: row.try_get("aircraft").map_err(corrupt)?,
        livery: row.try_get("livery").map_err(corrupt)?,
        pilot_at_id: row.try_get("pilot_at_id").map_err(corrupt)?,
        aircraft_at_id: row.try_get("aircraft_at_id").map_err(corrupt)?,
        external_created_at: row
            .try_get::<Option<DateTime<Utc>>, _>("external_created_at")
            .map_err(corrupt)?,
    };
    let external_id: String = row.try_get("airtable_record_id").map_err(corrupt)?;
    let status: String = row.try_get("backfill_status").map_err(corrupt)?;

    let mut record = PirepRecord::new(tenant_id, external_id, fields)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    record.backfill_status = status
        .parse::<BackfillStatus>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(record)
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn upsert(&self, record: &PirepRecord) -> Result<(), StoreError> {
        let f = &record.fields;

        sqlx::query(
            r#"
            INSERT INTO pireps (
                va_id,
                airtable_record_id,
                route,
                flight_mode,
                flight_time,
                pilot_callsign,
                aircraft,
                livery,
                pilot_at_id,
                aircraft_at_id,
                external_created_at,
                backfill_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (va_id, airtable_record_id)
            DO UPDATE SET
                route = COALESCE(EXCLUDED.route, pireps.route),
                flight_mode = COALESCE(EXCLUDED.flight_mode, pireps.flight_mode),
                flight_time = COALESCE(EXCLUDED.flight_time, pireps.flight_time),
                pilot_callsign = COALESCE(EXCLUDED.pilot_callsign, pireps.pilot_callsign),
                aircraft = COALESCE(EXCLUDED.aircraft, pireps.aircraft),
                livery = COALESCE(EXCLUDED.livery, pireps.livery),
                pilot_at_id = COALESCE(EXCLUDED.pilot_at_id, pireps.pilot_at_id),
                aircraft_at_id = COALESCE(EXCLUDED.aircraft_at_id, pireps.aircraft_at_id),
                external_created_at = COALESCE(EXCLUDED.external_created_at, pireps.external_created_at),
                updated_at = NOW()
            "#,
        )
        .bind(*record.tenant_id().as_uuid())
        .bind(record.external_id())
        .bind(f.route.as_deref())
        .bind(f.flight_mode.as_deref())
        .bind(f.flight_time)
        .bind(f.pilot_callsign.as_deref())
        .bind(f.aircraft.as_deref())
        .bind(f.livery.as_deref())
        .bind(f.pilot_at_id.as_deref())
        .bind(f.aircraft_at_id.as_deref())
        .bind(f.external_created_at)
        .bind(BackfillStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        external_id: &str,
    ) -> Result<Option<PirepRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                airtable_record_id,
                route,
                flight_mode,
                flight_time,
                pilot_callsign,
                aircraft,
                livery,
                pilot_at_id,
                aircraft_at_id,
                external_created_at,
                backfill_status
            FROM pireps
            WHERE va_id = $1 AND airtable_record_id = $2
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|r| decode_row(tenant_id, &r)).transpose()
    }

    async fn count(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pireps WHERE va_id = $1")
            .bind(*tenant_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;

        let n: i64 = row.try_get("n").map_err(backend)?;
        Ok(n.max(0) as u64)
    }
}
