//! Last-known location cache.

use crate::LocationSample;

/// Holds the most recent sample seen across ticks.
///
/// There is no expiry: a day-old fix from a sparse GPS feed is still the best
/// information available. Callers never learn whether `current()` came from
/// this tick's fetch or an earlier one.
#[derive(Debug, Clone, Default)]
pub struct LocationCache {
    current: Option<LocationSample>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a previously persisted sample.
    pub fn seeded(sample: Option<LocationSample>) -> Self {
        Self {
            current: sample.filter(LocationSample::is_valid),
        }
    }

    /// Replace the cached sample if `sample` was observed strictly later.
    ///
    /// Returns true if the cache changed.
    pub fn update(&mut self, sample: LocationSample) -> bool {
        if !sample.is_valid() {
            return false;
        }
        match self.current {
            Some(ref cached) if sample.observed_at <= cached.observed_at => false,
            _ => {
                self.current = Some(sample);
                true
            }
        }
    }

    pub fn current(&self) -> Option<&LocationSample> {
        self.current.as_ref()
    }
}
