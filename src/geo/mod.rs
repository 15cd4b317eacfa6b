use crate::models::load::{GeoPoint, Geofence, GeofenceShape};

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

impl Geofence {
    /// Inactive geofences never match. Circles use `radius_meters`; polygons
    /// use their outline only.
    pub fn contains(&self, point: &GeoPoint) -> bool {
        if !self.active {
            return false;
        }

        match &self.shape {
            GeofenceShape::Circle { center } => {
                haversine_km(center, point) * 1_000.0 <= self.radius_meters
            }
            GeofenceShape::Polygon { points } => polygon_contains(points, point),
        }
    }

    /// Representative point used as a routing destination.
    pub fn anchor(&self) -> Option<GeoPoint> {
        match &self.shape {
            GeofenceShape::Circle { center } => Some(*center),
            GeofenceShape::Polygon { points } if !points.is_empty() => {
                let n = points.len() as f64;
                Some(GeoPoint {
                    lat: points.iter().map(|p| p.lat).sum::<f64>() / n,
                    lng: points.iter().map(|p| p.lng).sum::<f64>() / n,
                })
            }
            GeofenceShape::Polygon { .. } => None,
        }
    }
}

// Even-odd ray casting on a lat/lng plane; adequate at geofence scale.
fn polygon_contains(points: &[GeoPoint], point: &GeoPoint) -> bool {
    if points.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (a, b) = (&points[i], &points[j]);
        if (a.lat > point.lat) != (b.lat > point.lat) {
            let crossing = (b.lng - a.lng) * (point.lat - a.lat) / (b.lat - a.lat) + a.lng;
            if point.lng < crossing {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}
