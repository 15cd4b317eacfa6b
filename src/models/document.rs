//! Raw store documents and their normalisation into [`Load`].
//!
//! The store schema has carried two names for some fields over time. Reads
//! accept every known name (canonical first); writes only ever use the
//! canonical one.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::LoadError;
use crate::models::load::{
    DriverId, Geofence, Load, LoadId, LoadKind, LoadStatus, LoadTimestamps, Place,
};
use crate::models::route::RouteStep;

pub type Document = Map<String, Value>;

/// Canonical field names.
pub mod fields {
    pub const STATUS: &str = "status";
    pub const KIND: &str = "kind";
    pub const ASSIGNED_DRIVER: &str = "assignedDriverId";
    pub const CARGO_WEIGHT: &str = "cargoWeightKg";
    pub const ORIGIN_CLIENT: &str = "origemCliente";
    pub const ORIGIN_CITY: &str = "origemCidade";
    pub const DESTINATION_CLIENT: &str = "destinoCliente";
    pub const DESTINATION_CITY: &str = "destinoCidade";
    pub const GEOFENCE: &str = "geofence";
    pub const ROUTE: &str = "route";
    pub const CREATED_AT: &str = "createdAt";
    pub const ACCEPTED_AT: &str = "acceptedAt";
    pub const TRIP_STARTED_AT: &str = "tripStartedAt";
    pub const ARRIVAL_REQUESTED_AT: &str = "arrivalConfirmationRequestedAt";
    pub const COMPLETED_AT: &str = "completedAt";
    pub const REFUSED_AT: &str = "refusedAt";
    pub const REFUSAL_REASON: &str = "refusalReason";

    /// Write-once timestamp fields.
    pub const TIMESTAMPS: [&str; 6] = [
        CREATED_AT,
        ACCEPTED_AT,
        TRIP_STARTED_AT,
        ARRIVAL_REQUESTED_AT,
        COMPLETED_AT,
        REFUSED_AT,
    ];
}

const DESTINATION_CLIENT: [&str; 3] = [fields::DESTINATION_CLIENT, "clienteEntrega", "cliente_destino"];
const DESTINATION_CITY: [&str; 2] = [fields::DESTINATION_CITY, "destino"];
const ORIGIN_CLIENT: [&str; 2] = [fields::ORIGIN_CLIENT, "cliente_origem"];
const ORIGIN_CITY: [&str; 2] = [fields::ORIGIN_CITY, "origem"];

/// Reads the raw status without validating the rest of the document.
pub fn raw_status(doc: &Document) -> Option<LoadStatus> {
    doc.get(fields::STATUS)
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
}

pub fn assigned_driver(doc: &Document) -> Option<&str> {
    doc.get(fields::ASSIGNED_DRIVER).and_then(Value::as_str)
}

pub fn normalize(load_id: &LoadId, doc: &Document) -> Result<Load, LoadError> {
    let malformed = |reason: String| LoadError::MalformedDocument {
        load_id: load_id.clone(),
        reason,
    };

    let status = match doc.get(fields::STATUS) {
        Some(Value::String(raw)) => raw.parse::<LoadStatus>().map_err(malformed)?,
        Some(other) => return Err(malformed(format!("status is not a string: {other}"))),
        None => return Err(malformed("missing status".to_string())),
    };

    let assigned_driver_id = text(doc, &[fields::ASSIGNED_DRIVER])
        .map(DriverId::new)
        .ok_or_else(|| malformed("missing assignedDriverId".to_string()))?;

    let kind = match text(doc, &[fields::KIND]).as_deref() {
        Some("EMPTY_RUN") => {
            if doc.get(fields::CARGO_WEIGHT).is_some_and(|v| !v.is_null()) {
                debug!(load_id = %load_id, "ignoring cargo weight on empty run");
            }
            LoadKind::EmptyRun
        }
        Some("LOADED_RUN") => LoadKind::LoadedRun {
            weight_kg: doc.get(fields::CARGO_WEIGHT).and_then(Value::as_f64),
        },
        Some(other) => return Err(malformed(format!("unknown kind {other:?}"))),
        None => return Err(malformed("missing kind".to_string())),
    };

    let destination = Place {
        client: text(doc, &DESTINATION_CLIENT),
        city: text(doc, &DESTINATION_CITY),
    };

    if status != LoadStatus::AwaitingScheduling && destination.client.is_none() {
        return Err(malformed(format!("{status} load without a destination")));
    }

    let origin = Place {
        client: text(doc, &ORIGIN_CLIENT),
        city: text(doc, &ORIGIN_CITY),
    };

    let geofence: Option<Geofence> = typed(doc, fields::GEOFENCE).map_err(malformed)?;
    let route: Option<Vec<RouteStep>> = typed(doc, fields::ROUTE).map_err(malformed)?;

    let timestamps = LoadTimestamps {
        created_at: timestamp(doc, fields::CREATED_AT).map_err(malformed)?,
        accepted_at: timestamp(doc, fields::ACCEPTED_AT).map_err(malformed)?,
        trip_started_at: timestamp(doc, fields::TRIP_STARTED_AT).map_err(malformed)?,
        arrival_confirmation_requested_at: timestamp(doc, fields::ARRIVAL_REQUESTED_AT)
            .map_err(malformed)?,
        completed_at: timestamp(doc, fields::COMPLETED_AT).map_err(malformed)?,
    };

    Ok(Load {
        id: load_id.clone(),
        status,
        kind,
        assigned_driver_id,
        origin,
        destination,
        geofence,
        route,
        timestamps,
        refusal_reason: text(doc, &[fields::REFUSAL_REASON]),
    })
}

impl Load {
    /// Serialises the load using canonical field names only.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(fields::STATUS.into(), self.status.as_str().into());
        doc.insert(fields::KIND.into(), self.kind.wire_name().into());
        doc.insert(
            fields::ASSIGNED_DRIVER.into(),
            self.assigned_driver_id.as_str().into(),
        );

        if let LoadKind::LoadedRun {
            weight_kg: Some(weight),
        } = self.kind
        {
            doc.insert(fields::CARGO_WEIGHT.into(), weight.into());
        }

        put_text(&mut doc, fields::ORIGIN_CLIENT, &self.origin.client);
        put_text(&mut doc, fields::ORIGIN_CITY, &self.origin.city);
        put_text(&mut doc, fields::DESTINATION_CLIENT, &self.destination.client);
        put_text(&mut doc, fields::DESTINATION_CITY, &self.destination.city);
        put_text(&mut doc, fields::REFUSAL_REASON, &self.refusal_reason);

        if let Some(geofence) = &self.geofence {
            if let Ok(value) = serde_json::to_value(geofence) {
                doc.insert(fields::GEOFENCE.into(), value);
            }
        }
        if let Some(route) = &self.route {
            if let Ok(value) = serde_json::to_value(route) {
                doc.insert(fields::ROUTE.into(), value);
            }
        }

        let stamps = [
            (fields::CREATED_AT, self.timestamps.created_at),
            (fields::ACCEPTED_AT, self.timestamps.accepted_at),
            (fields::TRIP_STARTED_AT, self.timestamps.trip_started_at),
            (
                fields::ARRIVAL_REQUESTED_AT,
                self.timestamps.arrival_confirmation_requested_at,
            ),
            (fields::COMPLETED_AT, self.timestamps.completed_at),
        ];
        for (name, at) in stamps {
            if let Some(at) = at {
                doc.insert(name.into(), at.to_rfc3339().into());
            }
        }

        doc
    }
}

fn text(doc: &Document, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        doc.get(*name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    })
}

fn put_text(doc: &mut Document, name: &str, value: &Option<String>) {
    if let Some(value) = value {
        doc.insert(name.to_string(), Value::String(value.clone()));
    }
}

fn typed<T: DeserializeOwned>(doc: &Document, name: &str) -> Result<Option<T>, String> {
    match doc.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|err| format!("invalid {name}: {err}")),
    }
}

fn timestamp(doc: &Document, name: &str) -> Result<Option<DateTime<Utc>>, String> {
    typed(doc, name)
}
