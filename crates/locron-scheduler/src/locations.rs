//! Named geofences referenced by geofence jobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use locron_location::Location;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::SchedulerError;
use crate::persist::{read_optional, write_json};

/// Radius used when an entry does not give one.
pub const DEFAULT_RADIUS_METERS: f64 = 50.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ZoneRecord {
    lat: f64,
    lon: f64,
    #[serde(default = "default_radius")]
    radius_m: f64,
}

fn default_radius() -> f64 {
    DEFAULT_RADIUS_METERS
}

/// `locations.json`: a map of name to `{lat, lon, radius_m}`.
#[derive(Debug, Clone)]
pub struct LocationBook {
    path: PathBuf,
}

impl LocationBook {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, ZoneRecord>, SchedulerError> {
        let Some(content) = read_optional(&self.path).await? else {
            return Ok(BTreeMap::new());
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| SchedulerError::CorruptRecord {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// All valid locations. Entries that fail validation are skipped.
    pub async fn load(&self) -> Result<BTreeMap<String, Location>, SchedulerError> {
        let mut locations = BTreeMap::new();
        for (name, record) in self.read().await? {
            match Location::new(name.clone(), record.lat, record.lon, record.radius_m) {
                Ok(location) => {
                    locations.insert(name, location);
                }
                Err(e) => warn!(error = %e, "skipping invalid location"),
            }
        }
        Ok(locations)
    }

    pub async fn get(&self, name: &str) -> Result<Option<Location>, SchedulerError> {
        Ok(self.load().await?.remove(name))
    }

    /// Insert or replace a location.
    pub async fn upsert(&self, location: Location) -> Result<(), SchedulerError> {
        location.validate()?;
        let mut records = self.read().await?;
        records.insert(
            location.name.clone(),
            ZoneRecord {
                lat: location.latitude,
                lon: location.longitude,
                radius_m: location.radius_meters,
            },
        );
        write_json(&self.path, &records).await?;
        info!(name = %location.name, radius_m = location.radius_meters, "saved location");
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<(), SchedulerError> {
        let mut records = self.read().await?;
        if records.remove(name).is_none() {
            return Err(SchedulerError::LocationNotFound(name.to_string()));
        }
        write_json(&self.path, &records).await?;
        info!(name, "removed location");
        Ok(())
    }
}
