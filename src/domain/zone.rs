//! Toll zone reference data and point-in-polygon membership

use crate::domain::types::{Coordinate, ZoneId};
use crate::infra::error::TollError;
use serde::{Deserialize, Serialize};

/// Fare rules attached to a zone
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneRules {
    /// Base rate per kilometre in currency units
    pub rate_per_km: f64,
    /// Fare floor in currency units
    pub minimum_fare: f64,
}

/// A named geofenced polygon with its toll rate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub rules: ZoneRules,
    /// Closed ring, first vertex is not repeated
    pub polygon: Vec<Coordinate>,
    #[serde(skip)]
    bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct BoundingBox {
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
}

impl BoundingBox {
    fn of(points: &[Coordinate]) -> Self {
        let mut bbox = BoundingBox {
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
        };
        for p in points {
            bbox.min_lat = bbox.min_lat.min(p.lat);
            bbox.max_lat = bbox.max_lat.max(p.lat);
            bbox.min_lon = bbox.min_lon.min(p.lon);
            bbox.max_lon = bbox.max_lon.max(p.lon);
        }
        bbox
    }

    #[inline]
    fn contains(&self, p: Coordinate) -> bool {
        p.lat >= self.min_lat && p.lat <= self.max_lat && p.lon >= self.min_lon && p.lon <= self.max_lon
    }
}

impl Zone {
    /// Build a zone, validating the polygon and rules
    pub fn new(
        id: &str,
        name: &str,
        rules: ZoneRules,
        polygon: Vec<Coordinate>,
    ) -> Result<Self, TollError> {
        if polygon.len() < 3 {
            return Err(TollError::InvalidInput(format!(
                "zone {id} polygon needs at least 3 vertices, got {}",
                polygon.len()
            )));
        }
        if let Some(bad) = polygon.iter().find(|p| !p.is_valid()) {
            return Err(TollError::InvalidInput(format!(
                "zone {id} has out-of-range vertex ({}, {})",
                bad.lat, bad.lon
            )));
        }
        if !rules.rate_per_km.is_finite() || rules.rate_per_km < 0.0 {
            return Err(TollError::InvalidInput(format!("zone {id} has invalid rate_per_km")));
        }
        if !rules.minimum_fare.is_finite() || rules.minimum_fare < 0.0 {
            return Err(TollError::InvalidInput(format!("zone {id} has invalid minimum_fare")));
        }

        let bbox = BoundingBox::of(&polygon);
        Ok(Self { id: ZoneId::from(id), name: name.to_string(), rules, polygon, bbox })
    }

    /// Axis-aligned rectangle zone, convenient for configuration and tests
    pub fn rectangle(
        id: &str,
        name: &str,
        rules: ZoneRules,
        south_west: Coordinate,
        north_east: Coordinate,
    ) -> Result<Self, TollError> {
        let polygon = vec![
            south_west,
            Coordinate::new(south_west.lat, north_east.lon),
            north_east,
            Coordinate::new(north_east.lat, south_west.lon),
        ];
        Self::new(id, name, rules, polygon)
    }

    /// Ray-casting containment test, treating lon as x and lat as y
    pub fn contains(&self, point: Coordinate) -> bool {
        if !self.bbox.contains(point) {
            return false;
        }

        let mut inside = false;
        let n = self.polygon.len();
        let mut j = n - 1;
        for i in 0..n {
            let pi = self.polygon[i];
            let pj = self.polygon[j];

            // Points on a horizontal edge or vertex count as inside
            if on_segment(pj, pi, point) {
                return true;
            }

            if (pi.lat > point.lat) != (pj.lat > point.lat) {
                let x_cross = (pj.lon - pi.lon) * (point.lat - pi.lat) / (pj.lat - pi.lat) + pi.lon;
                if point.lon < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

fn on_segment(a: Coordinate, b: Coordinate, p: Coordinate) -> bool {
    const EPS: f64 = 1e-12;
    let cross = (b.lon - a.lon) * (p.lat - a.lat) - (b.lat - a.lat) * (p.lon - a.lon);
    if cross.abs() > EPS {
        return false;
    }
    p.lon >= a.lon.min(b.lon) - EPS
        && p.lon <= a.lon.max(b.lon) + EPS
        && p.lat >= a.lat.min(b.lat) - EPS
        && p.lat <= a.lat.max(b.lat) + EPS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ZoneRules {
        ZoneRules { rate_per_km: 8.0, minimum_fare: 10.0 }
    }

    #[test]
    fn test_rectangle_contains() {
        let zone = Zone::rectangle(
            "z1",
            "NH544",
            rules(),
            Coordinate::new(10.9, 76.8),
            Coordinate::new(11.1, 77.2),
        )
        .unwrap();

        assert!(zone.contains(Coordinate::new(11.0, 77.0)));
        assert!(zone.contains(Coordinate::new(10.9, 77.0)));
        assert!(!zone.contains(Coordinate::new(11.2, 77.0)));
        assert!(!zone.contains(Coordinate::new(11.0, 77.3)));
    }

    #[test]
    fn test_concave_polygon() {
        // U shape opening north
        let polygon = vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.0, 3.0),
            Coordinate::new(3.0, 3.0),
            Coordinate::new(3.0, 2.0),
            Coordinate::new(1.0, 2.0),
            Coordinate::new(1.0, 1.0),
            Coordinate::new(3.0, 1.0),
            Coordinate::new(3.0, 0.0),
        ];
        let zone = Zone::new("u", "U", rules(), polygon).unwrap();

        assert!(zone.contains(Coordinate::new(2.0, 0.5)));
        assert!(zone.contains(Coordinate::new(2.0, 2.5)));
        assert!(!zone.contains(Coordinate::new(2.0, 1.5)));
    }

    #[test]
    fn test_rejects_degenerate_polygon() {
        let polygon = vec![Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 1.0)];
        assert!(Zone::new("bad", "bad", rules(), polygon).is_err());
    }

    #[test]
    fn test_rejects_negative_rate() {
        let bad = ZoneRules { rate_per_km: -1.0, minimum_fare: 10.0 };
        let result = Zone::rectangle(
            "z",
            "z",
            bad,
            Coordinate::new(0.0, 0.0),
            Coordinate::new(1.0, 1.0),
        );
        assert!(result.is_err());
    }
}
