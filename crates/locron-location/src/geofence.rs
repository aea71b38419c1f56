//! Geofence containment and edge detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{InvalidLocation, LocationSample};

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance in meters between two points.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    EARTH_RADIUS_METERS * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// A named circular geofence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
}

impl Location {
    pub fn new(
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
        radius_meters: f64,
    ) -> Result<Self, InvalidLocation> {
        let location = Self {
            name: name.into(),
            latitude,
            longitude,
            radius_meters,
        };
        location.validate()?;
        Ok(location)
    }

    pub fn validate(&self) -> Result<(), InvalidLocation> {
        let reason = if self.name.trim().is_empty() {
            Some("name cannot be empty")
        } else if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            Some("latitude must be within [-90, 90]")
        } else if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            Some("longitude must be within [-180, 180]")
        } else if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            Some("radius must be a positive number of meters")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidLocation {
                name: self.name.clone(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Distance from the zone center is at most the radius.
    pub fn contains(&self, sample: &LocationSample) -> bool {
        haversine_meters(
            sample.latitude,
            sample.longitude,
            self.latitude,
            self.longitude,
        ) <= self.radius_meters
    }
}

/// A containment transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Enter,
    Exit,
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Enter => write!(f, "enter"),
            Edge::Exit => write!(f, "exit"),
        }
    }
}

/// Last known containment for one geofence job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeofenceRuntimeState {
    pub inside: bool,
    /// Only meaningful for non-recurring jobs.
    #[serde(default)]
    pub fired_enter_once: bool,
    /// Only meaningful for non-recurring jobs.
    #[serde(default)]
    pub fired_exit_once: bool,
    #[serde(default)]
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl GeofenceRuntimeState {
    pub fn has_fired(&self, edge: Edge) -> bool {
        match edge {
            Edge::Enter => self.fired_enter_once,
            Edge::Exit => self.fired_exit_once,
        }
    }

    pub fn mark_fired(&mut self, edge: Edge) {
        match edge {
            Edge::Enter => self.fired_enter_once = true,
            Edge::Exit => self.fired_exit_once = true,
        }
    }
}

/// Result of evaluating one sample against one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub inside: bool,
    pub edge: Option<Edge>,
}

/// Test containment and detect an edge against `prior`.
///
/// Without a sample nothing changes: containment stays as it was and no edge
/// is produced.
pub fn evaluate(
    sample: Option<&LocationSample>,
    zone: &Location,
    prior: &GeofenceRuntimeState,
) -> Evaluation {
    let Some(sample) = sample.filter(|s| s.is_valid()) else {
        return Evaluation {
            inside: prior.inside,
            edge: None,
        };
    };

    let inside = zone.contains(sample);
    let edge = match (prior.inside, inside) {
        (false, true) => Some(Edge::Enter),
        (true, false) => Some(Edge::Exit),
        _ => None,
    };

    Evaluation { inside, edge }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn esb() -> Location {
        Location::new("esb", 40.7484, -73.9857, 60.0).unwrap()
    }

    fn at(lat: f64, lon: f64) -> LocationSample {
        LocationSample::new(lat, lon, Utc::now())
    }

    #[test]
    fn test_haversine_times_square_to_esb() {
        let d = haversine_meters(40.7580, -73.9855, 40.7484, -73.9857);
        assert!(d > 900.0 && d < 1200.0, "expected ~1km, got {d}");
    }

    #[test]
    fn test_haversine_same_point() {
        assert!(haversine_meters(40.758, -73.985, 40.758, -73.985) < 1.0);
    }

    #[test]
    fn test_contains() {
        let zone = esb();
        assert!(zone.contains(&at(40.7485, -73.9856)));
        assert!(!zone.contains(&at(40.7580, -73.9855)));
    }

    #[test]
    fn test_location_validation() {
        assert!(Location::new("gym", 40.0, -73.0, 0.0).is_err());
        assert!(Location::new("gym", 40.0, -73.0, -5.0).is_err());
        assert!(Location::new("gym", 95.0, -73.0, 50.0).is_err());
        assert!(Location::new("", 40.0, -73.0, 50.0).is_err());
        assert!(Location::new("gym", 40.0, -73.0, 50.0).is_ok());
    }

    #[test]
    fn test_enter_edge() {
        let prior = GeofenceRuntimeState::default();
        let eval = evaluate(Some(&at(40.7485, -73.9856)), &esb(), &prior);
        assert_eq!(
            eval,
            Evaluation {
                inside: true,
                edge: Some(Edge::Enter)
            }
        );
    }

    #[test]
    fn test_exit_edge() {
        let prior = GeofenceRuntimeState {
            inside: true,
            ..Default::default()
        };
        let eval = evaluate(Some(&at(40.7580, -73.9855)), &esb(), &prior);
        assert_eq!(eval.edge, Some(Edge::Exit));
        assert!(!eval.inside);
    }

    #[test]
    fn test_unchanged_containment_has_no_edge() {
        let inside = GeofenceRuntimeState {
            inside: true,
            ..Default::default()
        };
        assert_eq!(
            evaluate(Some(&at(40.7485, -73.9856)), &esb(), &inside).edge,
            None
        );

        let outside = GeofenceRuntimeState::default();
        assert_eq!(
            evaluate(Some(&at(40.7580, -73.9855)), &esb(), &outside).edge,
            None
        );
    }

    #[test]
    fn test_no_sample_keeps_prior() {
        let prior = GeofenceRuntimeState {
            inside: true,
            ..Default::default()
        };
        let eval = evaluate(None, &esb(), &prior);
        assert!(eval.inside);
        assert_eq!(eval.edge, None);
    }

    #[test]
    fn test_fired_flags() {
        let mut state = GeofenceRuntimeState::default();
        assert!(!state.has_fired(Edge::Enter));
        state.mark_fired(Edge::Enter);
        assert!(state.has_fired(Edge::Enter));
        assert!(!state.has_fired(Edge::Exit));
    }

    proptest! {
        #[test]
        fn haversine_is_symmetric(
            lat1 in -89.0f64..89.0, lon1 in -179.0f64..179.0,
            lat2 in -89.0f64..89.0, lon2 in -179.0f64..179.0,
        ) {
            let a = haversine_meters(lat1, lon1, lat2, lon2);
            let b = haversine_meters(lat2, lon2, lat1, lon1);
            prop_assert!((a - b).abs() < 1e-6);
            prop_assert!(a >= 0.0);
            // Never more than half the circumference
            prop_assert!(a <= std::f64::consts::PI * EARTH_RADIUS_METERS + 1.0);
        }

        #[test]
        fn center_is_always_inside(
            lat in -89.0f64..89.0, lon in -179.0f64..179.0, radius in 1.0f64..10_000.0,
        ) {
            let zone = Location::new("z", lat, lon, radius).unwrap();
            prop_assert!(zone.contains(&at(lat, lon)));
        }

        // Staying put never produces an edge after the first evaluation.
        #[test]
        fn repeated_sample_is_edge_free(
            lat in -60.0f64..60.0, lon in -179.0f64..179.0, inside_first in any::<bool>(),
        ) {
            let zone = Location::new("z", lat, lon, 100.0).unwrap();
            let sample = if inside_first { at(lat, lon) } else { at(lat + 1.0, lon) };

            let first = evaluate(Some(&sample), &zone, &GeofenceRuntimeState::default());
            let prior = GeofenceRuntimeState { inside: first.inside, ..Default::default() };
            for _ in 0..5 {
                prop_assert_eq!(evaluate(Some(&sample), &zone, &prior).edge, None);
            }
        }
    }
}
