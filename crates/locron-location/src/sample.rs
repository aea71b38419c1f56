use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single GPS fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// When the provider observed this point (not when we fetched it).
    pub observed_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            observed_at,
        }
    }

    /// Finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_sample() {
        let s = LocationSample::new(51.5074, -0.1278, Utc::now());
        assert!(s.is_valid());
    }

    #[test]
    fn test_out_of_range_sample() {
        assert!(!LocationSample::new(91.0, 0.0, Utc::now()).is_valid());
        assert!(!LocationSample::new(0.0, -180.5, Utc::now()).is_valid());
        assert!(!LocationSample::new(f64::NAN, 0.0, Utc::now()).is_valid());
    }
}
