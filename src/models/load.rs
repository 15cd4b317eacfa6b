use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::route::RouteStep;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadId(pub String);

impl LoadId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LoadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub String);

impl DriverId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStatus {
    AwaitingScheduling,
    PendingAcceptance,
    Accepted,
    InTransit,
    AwaitingArrivalConfirmation,
    Refused,
    Completed,
}

impl LoadStatus {
    /// Statuses matched by the driver's open-loads query.
    pub const OPEN: [LoadStatus; 5] = [
        LoadStatus::AwaitingScheduling,
        LoadStatus::PendingAcceptance,
        LoadStatus::Accepted,
        LoadStatus::InTransit,
        LoadStatus::AwaitingArrivalConfirmation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::AwaitingScheduling => "AWAITING_SCHEDULING",
            LoadStatus::PendingAcceptance => "PENDING_ACCEPTANCE",
            LoadStatus::Accepted => "ACCEPTED",
            LoadStatus::InTransit => "IN_TRANSIT",
            LoadStatus::AwaitingArrivalConfirmation => "AWAITING_ARRIVAL_CONFIRMATION",
            LoadStatus::Refused => "REFUSED",
            LoadStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }

    /// A status in which the driver still has to answer the offer.
    pub fn is_offer(&self) -> bool {
        matches!(
            self,
            LoadStatus::AwaitingScheduling | LoadStatus::PendingAcceptance
        )
    }

    pub fn is_trip(&self) -> bool {
        matches!(
            self,
            LoadStatus::InTransit | LoadStatus::AwaitingArrivalConfirmation
        )
    }

    /// Position along the lifecycle graph. A load observed at a lower rank
    /// than last applied was moved back by dispatch.
    pub fn rank(&self) -> u8 {
        match self {
            LoadStatus::AwaitingScheduling | LoadStatus::PendingAcceptance => 0,
            LoadStatus::Accepted => 1,
            LoadStatus::InTransit => 2,
            LoadStatus::AwaitingArrivalConfirmation => 3,
            LoadStatus::Refused | LoadStatus::Completed => 4,
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "AWAITING_SCHEDULING" => Ok(LoadStatus::AwaitingScheduling),
            "PENDING_ACCEPTANCE" => Ok(LoadStatus::PendingAcceptance),
            "ACCEPTED" => Ok(LoadStatus::Accepted),
            "IN_TRANSIT" => Ok(LoadStatus::InTransit),
            "AWAITING_ARRIVAL_CONFIRMATION" => Ok(LoadStatus::AwaitingArrivalConfirmation),
            "REFUSED" => Ok(LoadStatus::Refused),
            "COMPLETED" => Ok(LoadStatus::Completed),
            other => Err(format!("unknown load status {other:?}")),
        }
    }
}

/// Empty runs carry no cargo, so only loaded runs can hold a weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadKind {
    EmptyRun,
    LoadedRun { weight_kg: Option<f64> },
}

impl LoadKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            LoadKind::EmptyRun => "EMPTY_RUN",
            LoadKind::LoadedRun { .. } => "LOADED_RUN",
        }
    }

    pub fn trip_label(&self) -> OperationalStatus {
        match self {
            LoadKind::EmptyRun => OperationalStatus::EmptyRun,
            LoadKind::LoadedRun { .. } => OperationalStatus::LoadedRun,
        }
    }
}

/// Driver-facing operational status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationalStatus {
    #[serde(rename = "Sem carga programada")]
    NoScheduledLoad,
    #[serde(rename = "Viagem vazio")]
    EmptyRun,
    #[serde(rename = "Viagem carregado")]
    LoadedRun,
}

impl OperationalStatus {
    pub fn label(&self) -> &'static str {
        match self {
            OperationalStatus::NoScheduledLoad => "Sem carga programada",
            OperationalStatus::EmptyRun => "Viagem vazio",
            OperationalStatus::LoadedRun => "Viagem carregado",
        }
    }
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub client: Option<String>,
    pub city: Option<String>,
}

impl Place {
    pub fn describe(&self) -> String {
        match (&self.client, &self.city) {
            (Some(client), Some(city)) => format!("{client} - {city}"),
            (Some(client), None) => client.clone(),
            (None, Some(city)) => city.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeofenceShape {
    Circle { center: GeoPoint },
    Polygon { points: Vec<GeoPoint> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    pub active: bool,
    pub shape: GeofenceShape,
    #[serde(default)]
    pub radius_meters: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadTimestamps {
    pub created_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub trip_started_at: Option<DateTime<Utc>>,
    pub arrival_confirmation_requested_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A load normalised from a store document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub id: LoadId,
    pub status: LoadStatus,
    pub kind: LoadKind,
    pub assigned_driver_id: DriverId,
    pub origin: Place,
    pub destination: Place,
    pub geofence: Option<Geofence>,
    pub route: Option<Vec<RouteStep>>,
    pub timestamps: LoadTimestamps,
    pub refusal_reason: Option<String>,
}
