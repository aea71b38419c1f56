//! GPS → IANA timezone resolution.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tzf_rs::DefaultFinder;

use crate::LocationSample;

/// Maps a point to the IANA timezone that contains it.
pub trait TimezoneLookup: Send + Sync {
    /// Returns `None` when no zone is defined for the point.
    fn timezone_at(&self, latitude: f64, longitude: f64) -> Option<String>;
}

/// Polygon lookup backed by the `tzf-rs` default dataset.
pub struct TzfLookup {
    finder: DefaultFinder,
}

impl TzfLookup {
    /// Load the embedded timezone polygons. Do this once per process.
    pub fn new() -> Self {
        Self {
            finder: DefaultFinder::new(),
        }
    }
}

impl Default for TzfLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl TimezoneLookup for TzfLookup {
    fn timezone_at(&self, latitude: f64, longitude: f64) -> Option<String> {
        // tzf takes (lng, lat)
        let name = self.finder.get_tz_name(longitude, latitude);
        if name.is_empty() || !is_valid_timezone(name) {
            return None;
        }
        Some(name.to_string())
    }
}

/// Whether `name` is a timezone chrono-tz knows about.
pub fn is_valid_timezone(name: &str) -> bool {
    name.parse::<Tz>().is_ok()
}

/// Where a resolved timezone came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimezoneSource {
    /// Looked up from a location sample.
    Location,
    /// No usable sample or lookup failed; the caller's fallback was used.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTimezone {
    pub name: String,
    pub source: TimezoneSource,
}

/// Implements the sample → fallback chain. Never fails.
pub struct TimezoneResolver {
    lookup: Box<dyn TimezoneLookup>,
}

impl TimezoneResolver {
    pub fn new(lookup: impl TimezoneLookup + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    /// Resolve the timezone for `sample`, or return `configured_default`.
    ///
    /// Any lookup failure (open ocean, disputed territory, invalid point) is
    /// treated the same as having no sample at all.
    pub fn resolve(
        &self,
        sample: Option<&LocationSample>,
        configured_default: &str,
    ) -> ResolvedTimezone {
        if let Some(sample) = sample.filter(|s| s.is_valid()) {
            if let Some(name) = self.lookup.timezone_at(sample.latitude, sample.longitude) {
                return ResolvedTimezone {
                    name,
                    source: TimezoneSource::Location,
                };
            }
            debug!(
                latitude = sample.latitude,
                longitude = sample.longitude,
                "no timezone at point, falling back"
            );
        }

        ResolvedTimezone {
            name: configured_default.to_string(),
            source: TimezoneSource::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Lookup that knows exactly one point.
    struct OnePoint;

    impl TimezoneLookup for OnePoint {
        fn timezone_at(&self, latitude: f64, longitude: f64) -> Option<String> {
            if (latitude - 51.5).abs() < 0.5 && longitude.abs() < 0.5 {
                Some("Europe/London".to_string())
            } else {
                None
            }
        }
    }

    #[test]
    fn test_resolve_from_sample() {
        let resolver = TimezoneResolver::new(OnePoint);
        let sample = LocationSample::new(51.5074, -0.1278, Utc::now());

        let tz = resolver.resolve(Some(&sample), "America/New_York");
        assert_eq!(tz.name, "Europe/London");
        assert_eq!(tz.source, TimezoneSource::Location);
    }

    #[test]
    fn test_resolve_without_sample_uses_default() {
        let resolver = TimezoneResolver::new(OnePoint);
        let tz = resolver.resolve(None, "America/New_York");
        assert_eq!(tz.name, "America/New_York");
        assert_eq!(tz.source, TimezoneSource::Fallback);
    }

    #[test]
    fn test_resolve_lookup_failure_falls_through() {
        let resolver = TimezoneResolver::new(OnePoint);
        // Middle of the South Pacific
        let sample = LocationSample::new(-40.0, -130.0, Utc::now());

        let tz = resolver.resolve(Some(&sample), "Asia/Tokyo");
        assert_eq!(tz.name, "Asia/Tokyo");
        assert_eq!(tz.source, TimezoneSource::Fallback);
    }

    #[test]
    fn test_resolve_invalid_sample_falls_through() {
        let resolver = TimezoneResolver::new(OnePoint);
        let sample = LocationSample::new(f64::NAN, 0.0, Utc::now());
        assert_eq!(resolver.resolve(Some(&sample), "UTC").name, "UTC");
    }

    #[test]
    fn test_tzf_lookup_known_cities() {
        let lookup = TzfLookup::new();
        assert_eq!(
            lookup.timezone_at(40.7580, -73.9855).as_deref(),
            Some("America/New_York")
        );
        assert_eq!(
            lookup.timezone_at(52.2053, 0.1218).as_deref(),
            Some("Europe/London")
        );
        assert_eq!(
            lookup.timezone_at(47.3769, 8.5417).as_deref(),
            Some("Europe/Zurich")
        );
        assert_eq!(
            lookup.timezone_at(35.6762, 139.6503).as_deref(),
            Some("Asia/Tokyo")
        );
    }

    #[test]
    fn test_is_valid_timezone() {
        assert!(is_valid_timezone("America/New_York"));
        assert!(is_valid_timezone("UTC"));
        assert!(!is_valid_timezone("Mars/Olympus_Mons"));
        assert!(!is_valid_timezone(""));
    }
}
