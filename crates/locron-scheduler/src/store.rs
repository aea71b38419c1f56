//! Durable store of locron-owned jobs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::persist::{read_optional, write_json};
use crate::{Job, SchedulerError};

const JOBS_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct JobsDocument {
    #[serde(default = "jobs_version")]
    version: u32,
    #[serde(default)]
    jobs: Vec<Job>,
}

fn jobs_version() -> u32 {
    JOBS_VERSION
}

impl Default for JobsDocument {
    fn default() -> Self {
        Self {
            version: JOBS_VERSION,
            jobs: Vec::new(),
        }
    }
}

/// Job records kept in a single JSON document.
///
/// Every mutation rewrites the document atomically. Jobs are validated before
/// they are written, so an invalid definition never reaches disk.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<JobsDocument, SchedulerError> {
        let Some(content) = read_optional(&self.path).await? else {
            return Ok(JobsDocument::default());
        };
        if content.trim().is_empty() {
            return Ok(JobsDocument::default());
        }
        serde_json::from_str(&content).map_err(|e| SchedulerError::CorruptRecord {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    async fn write(&self, doc: &JobsDocument) -> Result<(), SchedulerError> {
        write_json(&self.path, doc).await
    }

    /// Persist a new job.
    #[tracing::instrument(skip(self, job), fields(id = %job.id, name = %job.name))]
    pub async fn create(&self, job: Job) -> Result<Job, SchedulerError> {
        job.validate()?;

        let mut doc = self.read().await?;
        if doc.jobs.iter().any(|j| j.id == job.id) {
            return Err(SchedulerError::InvalidJobSpec(format!(
                "job id {} already exists",
                job.id
            )));
        }

        doc.jobs.push(job.clone());
        self.write(&doc).await?;
        info!(kind = job.kind_label(), "created job");
        Ok(job)
    }

    /// All jobs in creation order.
    pub async fn list(&self) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.read().await?.jobs)
    }

    pub async fn get(&self, id: &str) -> Result<Job, SchedulerError> {
        self.read()
            .await?
            .jobs
            .into_iter()
            .find(|j| j.id == id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Vec<Job>, SchedulerError> {
        Ok(self
            .read()
            .await?
            .jobs
            .into_iter()
            .filter(|j| j.name == name)
            .collect())
    }

    /// Apply `mutator` to one job and persist the result.
    ///
    /// The id cannot be changed, and the mutated job must still validate.
    #[tracing::instrument(skip(self, mutator))]
    pub async fn update<F>(&self, id: &str, mutator: F) -> Result<Job, SchedulerError>
    where
        F: FnOnce(&mut Job),
    {
        let mut doc = self.read().await?;
        let job = doc
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;

        let mut updated = job.clone();
        mutator(&mut updated);
        updated.id = id.to_string();
        updated.validate()?;
        *job = updated.clone();

        self.write(&doc).await?;
        debug!("updated job");
        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<Job, SchedulerError> {
        let mut doc = self.read().await?;
        let index = doc
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;

        let removed = doc.jobs.remove(index);
        self.write(&doc).await?;
        info!(name = %removed.name, "removed job");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActionSide, JobKind, Trigger};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn geofence(name: &str) -> Job {
        Job::geofence(
            name.into(),
            "gym".into(),
            Trigger::Enter,
            false,
            BTreeMap::from([(ActionSide::Enter, json!({"systemEvent": "hi"}))]),
        )
    }

    #[tokio::test]
    async fn test_crud() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path().join("jobs.json"));

        assert!(store.list().await.unwrap().is_empty());

        let job = store.create(geofence("gym")).await.unwrap();
        assert_eq!(store.get(&job.id).await.unwrap(), job);
        assert_eq!(store.find_by_name("gym").await.unwrap().len(), 1);

        let updated = store
            .update(&job.id, |j| j.enabled = false)
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert!(!store.get(&job.id).await.unwrap().enabled);

        store.remove(&job.id).await.unwrap();
        assert!(matches!(
            store.get(&job.id).await,
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_job_never_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = JobStore::new(&path);

        let mut job = geofence("gym");
        job.actions.clear();
        assert!(matches!(
            store.create(job).await,
            Err(SchedulerError::InvalidJobSpec(_))
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_update_cannot_break_invariants_or_change_id() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path().join("jobs.json"));
        let job = store.create(geofence("gym")).await.unwrap();

        let result = store
            .update(&job.id, |j| {
                j.kind = JobKind::Geofence {
                    location_ref: String::new(),
                    trigger: Trigger::Enter,
                    inside_at_creation: None,
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.get(&job.id).await.unwrap(), job);

        let updated = store
            .update(&job.id, |j| j.id = "hijacked".into())
            .await
            .unwrap();
        assert_eq!(updated.id, job.id);
    }

    #[tokio::test]
    async fn test_document_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = JobStore::new(&path);
        store.create(geofence("gym")).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], json!(1));
        assert_eq!(raw["jobs"][0]["name"], json!("gym"));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JobStore::new(&path);
        assert!(matches!(
            store.list().await,
            Err(SchedulerError::CorruptRecord { .. })
        ));
    }
}
