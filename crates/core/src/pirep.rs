//! Canonical PIREP record and its attribute catalogue.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::field::{CoercionError, FieldKind, FieldValue};
use crate::id::TenantId;

/// Record kind under which PIREP schemas are registered in provider configs.
pub const PIREP_RECORD_KIND: &str = "pireps";

/// Whether related records (pilot, aircraft) have been back-filled yet.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Pending => "pending",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
        }
    }
}

impl FromStr for BackfillStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackfillStatus::Pending),
            "completed" => Ok(BackfillStatus::Completed),
            "failed" => Ok(BackfillStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown backfill status: {other}"
            ))),
        }
    }
}

/// Canonical attributes a tenant schema can map.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PirepField {
    Route,
    FlightMode,
    FlightTime,
    PilotCallsign,
    Aircraft,
    Livery,
    PilotAtId,
    AircraftAtId,
    CreatedTime,
}

impl PirepField {
    pub const ALL: [PirepField; 9] = [
        PirepField::Route,
        PirepField::FlightMode,
        PirepField::FlightTime,
        PirepField::PilotCallsign,
        PirepField::Aircraft,
        PirepField::Livery,
        PirepField::PilotAtId,
        PirepField::AircraftAtId,
        PirepField::CreatedTime,
    ];

    /// Name used as the key in tenant schema `fields` maps.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            PirepField::Route => "route",
            PirepField::FlightMode => "flight_mode",
            PirepField::FlightTime => "flight_time",
            PirepField::PilotCallsign => "pilot_callsign",
            PirepField::Aircraft => "aircraft",
            PirepField::Livery => "livery",
            PirepField::PilotAtId => "pilot_at_id",
            PirepField::AircraftAtId => "aircraft_at_id",
            PirepField::CreatedTime => "created_time",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            PirepField::FlightTime => FieldKind::Number,
            PirepField::PilotAtId | PirepField::AircraftAtId => FieldKind::Reference,
            PirepField::CreatedTime => FieldKind::Timestamp,
            _ => FieldKind::Text,
        }
    }
}

/// Mapped attributes of a PIREP. `None` means "not provided in this payload".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PirepFields {
    pub route: Option<String>,
    pub flight_mode: Option<String>,
    pub flight_time: Option<f64>,
    pub pilot_callsign: Option<String>,
    pub aircraft: Option<String>,
    pub livery: Option<String>,
    pub pilot_at_id: Option<String>,
    pub aircraft_at_id: Option<String>,
    pub external_created_at: Option<DateTime<Utc>>,
}

impl PirepFields {
    /// Coerce `raw` according to the attribute's kind and store it.
    ///
    /// On error the attribute is left exactly as it was.
    pub fn apply(&mut self, field: PirepField, raw: &FieldValue) -> Result<(), CoercionError> {
        match field {
            PirepField::Route => self.route = raw.to_text()?,
            PirepField::FlightMode => self.flight_mode = raw.to_text()?,
            PirepField::FlightTime => self.flight_time = raw.to_number()?,
            PirepField::PilotCallsign => self.pilot_callsign = raw.to_text()?,
            PirepField::Aircraft => self.aircraft = raw.to_text()?,
            PirepField::Livery => self.livery = raw.to_text()?,
            PirepField::PilotAtId => self.pilot_at_id = raw.to_reference()?,
            PirepField::AircraftAtId => self.aircraft_at_id = raw.to_reference()?,
            PirepField::CreatedTime => self.external_created_at = raw.to_timestamp()?,
        }
        Ok(())
    }

    pub fn is_set(&self, field: PirepField) -> bool {
        match field {
            PirepField::Route => self.route.is_some(),
            PirepField::FlightMode => self.flight_mode.is_some(),
            PirepField::FlightTime => self.flight_time.is_some(),
            PirepField::PilotCallsign => self.pilot_callsign.is_some(),
            PirepField::Aircraft => self.aircraft.is_some(),
            PirepField::Livery => self.livery.is_some(),
            PirepField::PilotAtId => self.pilot_at_id.is_some(),
            PirepField::AircraftAtId => self.aircraft_at_id.is_some(),
            PirepField::CreatedTime => self.external_created_at.is_some(),
        }
    }

    /// Overlay `incoming` onto `self`, keeping current values where `incoming`
    /// has nothing.
    pub fn merge_from(&mut self, incoming: &PirepFields) {
        fn keep<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
            if let Some(v) = incoming {
                *slot = Some(v.clone());
            }
        }

        keep(&mut self.route, &incoming.route);
        keep(&mut self.flight_mode, &incoming.flight_mode);
        keep(&mut self.flight_time, &incoming.flight_time);
        keep(&mut self.pilot_callsign, &incoming.pilot_callsign);
        keep(&mut self.aircraft, &incoming.aircraft);
        keep(&mut self.livery, &incoming.livery);
        keep(&mut self.pilot_at_id, &incoming.pilot_at_id);
        keep(&mut self.aircraft_at_id, &incoming.aircraft_at_id);
        keep(&mut self.external_created_at, &incoming.external_created_at);
    }
}

/// Canonical stored PIREP, keyed by `(tenant_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PirepRecord {
    tenant_id: TenantId,
    external_id: String,
    pub fields: PirepFields,
    pub backfill_status: BackfillStatus,
}

impl PirepRecord {
    pub fn new(
        tenant_id: TenantId,
        external_id: impl Into<String>,
        fields: PirepFields,
    ) -> DomainResult<Self> {
        let external_id = external_id.into().trim().to_string();
        if external_id.is_empty() {
            return Err(DomainError::validation("external record id is empty"));
        }

        Ok(Self {
            tenant_id,
            external_id,
            fields,
            backfill_status: BackfillStatus::Pending,
        })
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// Natural key.
    pub fn key(&self) -> (TenantId, &str) {
        (self.tenant_id, &self.external_id)
    }

    /// Apply a later delivery of the same key (skip-on-unset).
    ///
    /// Backfill status belongs to the stored row and is not touched.
    pub fn merge_from(&mut self, incoming: &PirepRecord) {
        debug_assert_eq!(self.key(), incoming.key());
        self.fields.merge_from(&incoming.fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new()
    }

    #[test]
    fn new_rejects_blank_external_id() {
        let err = PirepRecord::new(tenant(), "   ", PirepFields::default()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn apply_leaves_field_untouched_on_mismatch() {
        let mut fields = PirepFields {
            flight_time: Some(90.0),
            ..Default::default()
        };
        let err = fields.apply(PirepField::FlightTime, &FieldValue::from("ninety"));
        assert!(err.is_err());
        assert_eq!(fields.flight_time, Some(90.0));
    }

    #[test]
    fn merge_keeps_prior_values_for_unset_fields() {
        let t = tenant();
        let mut stored = PirepRecord::new(
            t,
            "rec1",
            PirepFields {
                route: Some("KSEA-KLAX".into()),
                livery: Some("House".into()),
                ..Default::default()
            },
        )
        .unwrap();
        stored.backfill_status = BackfillStatus::Completed;

        let incoming = PirepRecord::new(
            t,
            "rec1",
            PirepFields {
                route: Some("KSEA-KSFO".into()),
                flight_time: Some(2.1),
                ..Default::default()
            },
        )
        .unwrap();

        stored.merge_from(&incoming);

        assert_eq!(stored.fields.route.as_deref(), Some("KSEA-KSFO"));
        assert_eq!(stored.fields.livery.as_deref(), Some("House"));
        assert_eq!(stored.fields.flight_time, Some(2.1));
        assert_eq!(stored.backfill_status, BackfillStatus::Completed);
    }

    #[test]
    fn every_field_has_a_distinct_canonical_name() {
        let mut names: Vec<_> = PirepField::ALL.iter().map(|f| f.canonical_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PirepField::ALL.len());
    }

    #[test]
    fn backfill_status_round_trips_through_str() {
        for s in [BackfillStatus::Pending, BackfillStatus::Completed, BackfillStatus::Failed] {
            assert_eq!(s.as_str().parse::<BackfillStatus>().unwrap(), s);
        }
    }
}
