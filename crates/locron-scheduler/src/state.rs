//! Durable runtime state shared across ticks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use locron_location::{GeofenceRuntimeState, LocationSample, is_valid_timezone};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, warn};

use crate::SchedulerError;
use crate::persist::{read_optional, write_json};

pub const STATE_VERSION: u32 = 1;

/// Everything a tick needs to remember from the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    #[serde(default = "state_version")]
    pub version: u32,
    #[serde(default)]
    pub last_location: Option<LocationSample>,
    /// Last timezone resolved from an actual sample.
    #[serde(default)]
    pub last_resolved_timezone: Option<String>,
    /// Keyed by geofence job id.
    #[serde(default)]
    pub geofence_runtime_states: BTreeMap<String, GeofenceRuntimeState>,
    #[serde(default)]
    pub last_tick_at: Option<DateTime<Utc>>,
}

fn state_version() -> u32 {
    STATE_VERSION
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_location: None,
            last_resolved_timezone: None,
            geofence_runtime_states: BTreeMap::new(),
            last_tick_at: None,
        }
    }
}

impl GlobalState {
    /// Structural checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.version > STATE_VERSION {
            return Err(SchedulerError::StateCorrupt(format!(
                "unsupported state version {}",
                self.version
            )));
        }
        if let Some(sample) = &self.last_location {
            if !sample.is_valid() {
                return Err(SchedulerError::StateCorrupt(format!(
                    "last location out of range: {}, {}",
                    sample.latitude, sample.longitude
                )));
            }
        }
        if let Some(tz) = &self.last_resolved_timezone {
            if !is_valid_timezone(tz) {
                return Err(SchedulerError::StateCorrupt(format!(
                    "unknown timezone '{tz}'"
                )));
            }
        }
        Ok(())
    }
}

/// Loads and saves [`GlobalState`].
///
/// A corrupt state file is moved aside and replaced by the default state so a
/// single bad write never stops the tick loop.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse and validate the state file without touching it.
    pub async fn inspect(&self) -> Result<GlobalState, SchedulerError> {
        let Some(content) = read_optional(&self.path).await? else {
            return Ok(GlobalState::default());
        };
        let state: GlobalState = serde_json::from_str(&content)
            .map_err(|e| SchedulerError::StateCorrupt(e.to_string()))?;
        state.validate()?;
        Ok(state)
    }

    /// Load state, recovering from corruption.
    pub async fn load(&self) -> Result<GlobalState, SchedulerError> {
        match self.inspect().await {
            Ok(state) => Ok(state),
            Err(SchedulerError::StateCorrupt(reason)) => {
                let quarantine = self.quarantine_path();
                warn!(
                    path = %self.path.display(),
                    moved_to = %quarantine.display(),
                    %reason,
                    "state file corrupt, starting from defaults"
                );
                if let Err(e) = fs::rename(&self.path, &quarantine).await {
                    error!(error = %e, "failed to move corrupt state aside");
                }
                Ok(GlobalState::default())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, state: &GlobalState) -> Result<(), SchedulerError> {
        write_json(&self.path, state).await
    }

    fn quarantine_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".corrupt-{}", Utc::now().timestamp()));
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn populated() -> GlobalState {
        let mut state = GlobalState::default();
        state.last_location = Some(LocationSample::new(51.5074, -0.1278, Utc::now()));
        state.last_resolved_timezone = Some("Europe/London".into());
        state.geofence_runtime_states.insert(
            "job-1".into(),
            GeofenceRuntimeState {
                inside: true,
                ..Default::default()
            },
        );
        state.last_tick_at = Some(Utc::now());
        state
    }

    #[tokio::test]
    async fn test_missing_file_loads_default() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().await.unwrap(), GlobalState::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = populated();

        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_unparseable_state_is_quarantined() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{\"version\": 1, \"last_location\": ").unwrap();

        let store = StateStore::new(&path);
        assert_eq!(store.load().await.unwrap(), GlobalState::default());
        assert!(!path.exists());

        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("state.json.corrupt-")
            });
        assert!(quarantined);
    }

    #[tokio::test]
    async fn test_invalid_values_are_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"version":1,"last_resolved_timezone":"Mars/Olympus_Mons"}"#,
        )
        .unwrap();

        let store = StateStore::new(&path);
        assert!(matches!(
            store.inspect().await,
            Err(SchedulerError::StateCorrupt(_))
        ));
        assert_eq!(store.load().await.unwrap(), GlobalState::default());
    }

    #[tokio::test]
    async fn test_interrupted_save_keeps_previous_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);
        let state = populated();
        store.save(&state).await.unwrap();

        // Leftover of a write that died before the rename.
        std::fs::write(dir.path().join(".state.json.dead.tmp"), "{\"vers").unwrap();

        assert_eq!(store.load().await.unwrap(), state);
    }
}
