//! Great-circle geometry for geofence triggers and location delta gating.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

/// Haversine distance between two points, in meters.
pub fn haversine_m(a: LatLon, b: LatLon) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance() {
        let p = LatLon { lat: 37.7749, lon: -122.4194 };
        assert!(haversine_m(p, p) < 1e-9);
    }

    #[test]
    fn half_degree_of_latitude_north() {
        // 0.0051° of latitude ≈ 567 m, the geofence-crossing scenario.
        let a = LatLon { lat: 37.7749, lon: -122.4194 };
        let b = LatLon { lat: 37.7800, lon: -122.4194 };
        let d = haversine_m(a, b);
        assert!((d - 567.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn symmetric() {
        let a = LatLon { lat: 51.5007, lon: -0.1246 };
        let b = LatLon { lat: 48.8584, lon: 2.2945 };
        let ab = haversine_m(a, b);
        let ba = haversine_m(b, a);
        assert!((ab - ba).abs() < 1e-6);
        // London Eye → Eiffel Tower is ~340 km.
        assert!((ab - 340_000.0).abs() < 5_000.0, "got {ab}");
    }
}
