use async_trait::async_trait;
use thiserror::Error;

use crate::geo::haversine_km;
use crate::models::load::GeoPoint;
use crate::models::route::{Route, RouteStep};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoutingError {
    #[error("routing service unavailable: {0}")]
    Unavailable(String),

    #[error("no route: {0}")]
    NoRoute(String),

    #[error("invalid coordinate ({lat}, {lng})")]
    InvalidCoordinate { lat: f64, lng: f64 },
}

#[async_trait]
pub trait RoutingProvider: Send + Sync {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<Route, RoutingError>;
}

/// Great-circle single-step route at a fixed average speed.
#[derive(Debug, Clone)]
pub struct StraightLineRouter {
    average_speed_kmh: f64,
}

impl StraightLineRouter {
    pub fn new(average_speed_kmh: f64) -> Self {
        Self { average_speed_kmh }
    }
}

#[async_trait]
impl RoutingProvider for StraightLineRouter {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<Route, RoutingError> {
        for point in [origin, destination] {
            if !point.is_valid() {
                return Err(RoutingError::InvalidCoordinate {
                    lat: point.lat,
                    lng: point.lng,
                });
            }
        }

        if self.average_speed_kmh <= 0.0 || !self.average_speed_kmh.is_finite() {
            return Err(RoutingError::Unavailable(format!(
                "average speed {} km/h",
                self.average_speed_kmh
            )));
        }

        let distance_km = haversine_km(&origin, &destination);
        let step = RouteStep {
            instruction: format!(
                "Siga {:.1} km até {:.5}, {:.5}",
                distance_km, destination.lat, destination.lng
            ),
            distance_meters: distance_km * 1_000.0,
            duration_seconds: distance_km / self.average_speed_kmh * 3_600.0,
        };

        Ok(Route::from_steps(vec![step]))
    }
}
