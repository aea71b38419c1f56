//! The scheduler: job commands and the tick-driven run loop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::{DateTime, Utc};
use locron_gateway::{CronGateway, ExternalJob, GatewayError};
use locron_location::{
    LocationProvider, LocationSample, ResolvedTimezone, TimezoneResolver, TimezoneSource,
    is_valid_timezone,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::types::validate_schedule_expr;
use crate::{
    ActionSide, FIRE_JOB_PREFIX, GlobalState, Job, JobKind, JobStore, LocationBook,
    SchedulerError, StateStore, Trigger,
};

/// Default timezone when nothing better is known.
pub const DEFAULT_TIMEZONE: &str = "America/New_York";

/// Default bound on a single provider fetch or gateway action.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the scheduler keeps its files and how it falls back.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Holds `jobs.json`, `state.json` and, unless overridden, `locations.json`.
    pub data_dir: PathBuf,
    pub locations_file: Option<PathBuf>,
    pub default_timezone: String,
    pub call_timeout: Duration,
}

impl SchedulerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locations_file: None,
            default_timezone: DEFAULT_TIMEZONE.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Input for a new local-timezone job.
#[derive(Debug, Clone)]
pub struct NewLocalTimezoneJob {
    pub name: String,
    pub schedule_expr: String,
    pub action: serde_json::Value,
}

/// Input for a new geofence job.
#[derive(Debug, Clone)]
pub struct NewGeofenceJob {
    pub name: String,
    pub location_ref: String,
    pub trigger: Trigger,
    pub recurring: bool,
    pub actions: BTreeMap<ActionSide, serde_json::Value>,
}

/// Changes `edit` can make.
#[derive(Debug, Clone, Default)]
pub struct JobEdit {
    /// New cron expression for a local-timezone job.
    pub schedule_expr: Option<String>,
    /// Start tracking an existing engine job in the user's timezone.
    pub track_local: bool,
}

/// Who an external engine job belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Mirror of a locron local-timezone job.
    LocalTimezone { job_id: String, job_name: String },
    /// One-shot delivery of a geofence action.
    GeofenceDelivery,
    /// Created by someone else; locron never touches it.
    Foreign,
}

#[derive(Debug, Clone)]
pub struct ExternalListing {
    pub job: ExternalJob,
    pub owner: Ownership,
}

/// Locron jobs next to everything the external engine holds.
#[derive(Debug, Clone)]
pub struct JobListing {
    pub jobs: Vec<Job>,
    /// `Err` carries the reason the engine could not be listed.
    pub external: Result<Vec<ExternalListing>, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeofenceStatus {
    pub job_name: String,
    pub location_ref: String,
    pub inside: bool,
    pub enabled: bool,
}

/// Snapshot of what the last tick knew.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub provider: &'static str,
    pub location: Option<LocationSample>,
    pub timezone: ResolvedTimezone,
    /// Wall clock in `timezone`.
    pub local_time: String,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub local_timezone_jobs: usize,
    pub geofences: Vec<GeofenceStatus>,
}

/// The location-aware scheduler.
///
/// Owns the stores and the two external seams: where the user is, and the
/// cron engine that does the actual time-based work.
pub struct Scheduler {
    pub(crate) jobs: JobStore,
    pub(crate) state: StateStore,
    pub(crate) locations: LocationBook,
    pub(crate) provider: Arc<dyn LocationProvider>,
    pub(crate) gateway: Arc<dyn CronGateway>,
    pub(crate) resolver: TimezoneResolver,
    pub(crate) default_timezone: String,
    pub(crate) call_timeout: Duration,
    pub(crate) running: AtomicBool,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        config: SchedulerConfig,
        provider: Arc<dyn LocationProvider>,
        gateway: Arc<dyn CronGateway>,
        resolver: TimezoneResolver,
    ) -> Result<Self, SchedulerError> {
        if !is_valid_timezone(&config.default_timezone) {
            return Err(SchedulerError::InvalidTimezone(config.default_timezone));
        }

        let locations_file = config
            .locations_file
            .unwrap_or_else(|| config.data_dir.join("locations.json"));

        Ok(Self {
            jobs: JobStore::new(config.data_dir.join("jobs.json")),
            state: StateStore::new(config.data_dir.join("state.json")),
            locations: LocationBook::new(locations_file),
            provider,
            gateway,
            resolver,
            default_timezone: config.default_timezone,
            call_timeout: config.call_timeout,
            running: AtomicBool::new(false),
        })
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn locations(&self) -> &LocationBook {
        &self.locations
    }

    pub fn default_timezone(&self) -> &str {
        &self.default_timezone
    }

    /// Persisted state for commands, which only ever read it.
    ///
    /// A corrupt file is reported and treated as empty here; the next tick
    /// moves it aside.
    async fn snapshot(&self) -> Result<GlobalState, SchedulerError> {
        match self.state.inspect().await {
            Ok(state) => Ok(state),
            Err(SchedulerError::StateCorrupt(reason)) => {
                warn!(%reason, "state file corrupt, ignoring it until the next tick");
                Ok(GlobalState::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Timezone the user is in right now, without persisting anything.
    async fn current_timezone(&self) -> Result<String, SchedulerError> {
        let mut state = self.snapshot().await?;
        Ok(self.locate(&mut state).await.timezone.name)
    }

    /// Create a local-timezone job and its external mirror.
    ///
    /// The mirror is created in the timezone resolved right now, so the job is
    /// correct even before the first tick.
    #[tracing::instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn add_local_timezone_job(
        &self,
        spec: NewLocalTimezoneJob,
    ) -> Result<Job, SchedulerError> {
        if spec.name.trim().is_empty() {
            return Err(SchedulerError::InvalidJobSpec(
                "name must not be empty".into(),
            ));
        }
        validate_schedule_expr(&spec.schedule_expr)?;

        let timezone = self.current_timezone().await?;

        let external_ref = self
            .gateway
            .create_job(&spec.name, &spec.schedule_expr, &timezone, &spec.action)
            .await?;

        let job = Job::local_timezone(
            spec.name,
            spec.schedule_expr,
            external_ref.clone(),
            Some(timezone.clone()),
            spec.action,
        );

        match self.jobs.create(job).await {
            Ok(job) => {
                info!(id = %job.id, %external_ref, %timezone, "added local-timezone job");
                Ok(job)
            }
            Err(e) => {
                if let Err(cleanup) = self.gateway.remove_job(&external_ref).await {
                    error!(%external_ref, error = %cleanup, "failed to remove orphaned external job");
                }
                Err(e)
            }
        }
    }

    /// Create a geofence job.
    ///
    /// The job records whether the last known location was inside its zone,
    /// so a job created while already inside does not fire on the next tick.
    /// With no known location, or an undefined zone, there is nothing to
    /// record and the first tick that finds the user inside fires an Enter.
    #[tracing::instrument(skip(self, spec), fields(name = %spec.name, location = %spec.location_ref))]
    pub async fn add_geofence_job(&self, spec: NewGeofenceJob) -> Result<Job, SchedulerError> {
        let zone = self.locations.get(&spec.location_ref).await?;
        if zone.is_none() {
            warn!("location is not defined yet, job stays idle until it is");
        }

        let last_location = self.snapshot().await?.last_location;
        let inside = zone
            .zip(last_location)
            .map(|(zone, sample)| zone.contains(&sample));
        debug!(?inside, "containment at creation");

        let job = Job::geofence(
            spec.name,
            spec.location_ref,
            spec.trigger,
            spec.recurring,
            spec.actions,
        )
        .with_inside_at_creation(inside);

        let job = self.jobs.create(job).await?;
        info!(id = %job.id, "added geofence job");
        Ok(job)
    }

    /// Find a job by id, falling back to a unique name.
    pub async fn find_job(&self, selector: &str) -> Result<Job, SchedulerError> {
        match self.jobs.get(selector).await {
            Ok(job) => return Ok(job),
            Err(SchedulerError::JobNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut matches = self.jobs.find_by_name(selector).await?;
        match matches.len() {
            0 => Err(SchedulerError::JobNotFound(selector.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(SchedulerError::AmbiguousName(selector.to_string())),
        }
    }

    /// Remove a job and, for local-timezone jobs, its external mirror.
    ///
    /// A mirror that is already gone is not an error. Any other gateway
    /// failure leaves the job in place so removal can be retried.
    #[tracing::instrument(skip(self))]
    pub async fn remove_job(&self, selector: &str) -> Result<Job, SchedulerError> {
        let job = self.find_job(selector).await?;

        if let Some(external_ref) = job.external_job_ref() {
            match self.gateway.remove_job(external_ref).await {
                Ok(()) => {}
                Err(GatewayError::NotFound(_)) => {
                    warn!(%external_ref, "external job already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.jobs.remove(&job.id).await
    }

    /// Edit a job: change a local-timezone job's cron expression, or start
    /// tracking an engine job (by engine id or name) in the user's timezone.
    ///
    /// The engine is updated first; the job record only changes once the
    /// engine has accepted the new schedule.
    #[tracing::instrument(skip(self, edit))]
    pub async fn edit_job(&self, selector: &str, edit: JobEdit) -> Result<Job, SchedulerError> {
        if edit.schedule_expr.is_none() && !edit.track_local {
            return Err(SchedulerError::InvalidJobSpec("nothing to change".into()));
        }
        if let Some(expr) = &edit.schedule_expr {
            validate_schedule_expr(expr)?;
        }

        let job = if edit.track_local {
            match self.find_job(selector).await {
                Ok(job) if !job.is_geofence() => job,
                Ok(job) => {
                    return Err(SchedulerError::InvalidJobSpec(format!(
                        "'{}' is a geofence job and has no timezone",
                        job.name
                    )));
                }
                Err(SchedulerError::JobNotFound(_)) => self.adopt(selector).await?,
                Err(e) => return Err(e),
            }
        } else {
            self.find_job(selector).await?
        };

        match edit.schedule_expr {
            Some(expr) => self.reschedule(job, expr).await,
            None => Ok(job),
        }
    }

    /// Take over an existing engine job as a local-timezone job.
    ///
    /// An engine job that already mirrors a locron job is returned as that job.
    async fn adopt(&self, selector: &str) -> Result<Job, SchedulerError> {
        let mut candidates = self.gateway.list_jobs().await?;
        let external = match candidates.iter().position(|j| j.id == selector) {
            Some(index) => candidates.swap_remove(index),
            None => {
                candidates.retain(|j| j.name == selector);
                match candidates.len() {
                    0 => return Err(SchedulerError::JobNotFound(selector.to_string())),
                    1 => candidates.remove(0),
                    _ => return Err(SchedulerError::AmbiguousName(selector.to_string())),
                }
            }
        };

        if let Some(tracked) = self
            .jobs
            .list()
            .await?
            .into_iter()
            .find(|j| j.external_job_ref() == Some(external.id.as_str()))
        {
            debug!(id = %tracked.id, external_ref = %external.id, "engine job already tracked");
            return Ok(tracked);
        }

        if external.name.starts_with(&format!("{FIRE_JOB_PREFIX}-")) {
            return Err(SchedulerError::InvalidJobSpec(format!(
                "'{}' is a geofence delivery, not a recurring job",
                external.name
            )));
        }
        let schedule_expr = external
            .schedule
            .as_ref()
            .and_then(|s| s.expr.clone())
            .ok_or_else(|| {
                SchedulerError::InvalidJobSpec(format!(
                    "engine job '{}' has no cron expression",
                    external.name
                ))
            })?;
        validate_schedule_expr(&schedule_expr)?;

        let timezone = self.current_timezone().await?;
        self.gateway.patch_job(&external.id, &timezone).await?;

        let action = external
            .extra
            .get("action")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let job = Job::local_timezone(
            external.name,
            schedule_expr,
            external.id,
            Some(timezone.clone()),
            action,
        );
        let job = self.jobs.create(job).await?;
        info!(id = %job.id, external_ref = ?job.external_job_ref(), %timezone, "now tracking engine job");
        Ok(job)
    }

    /// Push a new cron expression to a local-timezone job's mirror, then record it.
    async fn reschedule(&self, job: Job, expr: String) -> Result<Job, SchedulerError> {
        let JobKind::LocalTimezone {
            external_job_ref,
            last_applied_tz,
            ..
        } = &job.kind
        else {
            return Err(SchedulerError::InvalidJobSpec(format!(
                "'{}' is a geofence job and has no cron expression",
                job.name
            )));
        };

        let timezone = match last_applied_tz {
            Some(tz) => tz.clone(),
            None => self.current_timezone().await?,
        };
        self.gateway
            .reschedule_job(external_job_ref, &expr, &timezone)
            .await?;

        let job = self
            .jobs
            .update(&job.id, |j| {
                j.set_schedule_expr(expr);
                j.set_last_applied_tz(timezone);
            })
            .await?;
        info!(id = %job.id, "changed schedule");
        Ok(job)
    }

    /// Enable or disable a job. Disabled jobs are tracked but never acted on.
    pub async fn set_enabled(&self, selector: &str, enabled: bool) -> Result<Job, SchedulerError> {
        let job = self.find_job(selector).await?;
        let job = self.jobs.update(&job.id, |j| j.enabled = enabled).await?;
        info!(id = %job.id, enabled, "changed job state");
        Ok(job)
    }

    /// Locron jobs plus the external engine's jobs, tagged by owner.
    ///
    /// Read-only against the engine.
    pub async fn list(&self) -> Result<JobListing, SchedulerError> {
        let jobs = self.jobs.list().await?;

        let external = match self.gateway.list_jobs().await {
            Ok(external) => Ok(external
                .into_iter()
                .map(|ext| {
                    let owner = classify(&jobs, &ext);
                    ExternalListing { job: ext, owner }
                })
                .collect()),
            Err(e) => {
                warn!(error = %e, "could not list external jobs");
                Err(e.to_string())
            }
        };

        Ok(JobListing { jobs, external })
    }

    /// What the scheduler currently believes, from persisted state only.
    pub async fn status(&self) -> Result<Status, SchedulerError> {
        let state = self.snapshot().await?;
        let jobs = self.jobs.list().await?;

        let timezone = match &state.last_resolved_timezone {
            Some(name) => ResolvedTimezone {
                name: name.clone(),
                source: TimezoneSource::Location,
            },
            None => ResolvedTimezone {
                name: self.default_timezone.clone(),
                source: TimezoneSource::Fallback,
            },
        };
        let local_time = timezone
            .name
            .parse::<chrono_tz::Tz>()
            .map(|tz| {
                Utc::now()
                    .with_timezone(&tz)
                    .format("%Y-%m-%d %H:%M:%S %Z")
                    .to_string()
            })
            .unwrap_or_else(|_| Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string());

        let geofences = jobs
            .iter()
            .filter_map(|job| match &job.kind {
                JobKind::Geofence { location_ref, .. } => Some(GeofenceStatus {
                    job_name: job.name.clone(),
                    location_ref: location_ref.clone(),
                    inside: state
                        .geofence_runtime_states
                        .get(&job.id)
                        .is_some_and(|r| r.inside),
                    enabled: job.enabled,
                }),
                JobKind::LocalTimezone { .. } => None,
            })
            .collect();

        Ok(Status {
            provider: self.provider.name(),
            location: state.last_location,
            timezone,
            local_time,
            last_tick_at: state.last_tick_at,
            local_timezone_jobs: jobs.iter().filter(|j| !j.is_geofence()).count(),
            geofences,
        })
    }

    /// Tick every `interval` until shutdown is signalled.
    ///
    /// Ticks never overlap: a slow tick delays the next one instead of
    /// stacking up behind it.
    pub async fn run(&self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            provider = self.provider.name(),
            "scheduler starting"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => report.log(),
                        Err(SchedulerError::Busy) => debug!("previous tick still running"),
                        Err(e) => error!(error = %e, "tick failed"),
                    }
                }
            }
        }

        info!("scheduler shut down gracefully");
    }
}

fn classify(jobs: &[Job], external: &ExternalJob) -> Ownership {
    if let Some(job) = jobs
        .iter()
        .find(|j| j.external_job_ref() == Some(external.id.as_str()))
    {
        return Ownership::LocalTimezone {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
        };
    }
    if external.name.starts_with(&format!("{FIRE_JOB_PREFIX}-")) {
        return Ownership::GeofenceDelivery;
    }
    Ownership::Foreign
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn briefing() -> Job {
        Job::local_timezone(
            "briefing".into(),
            "30 6 * * *".into(),
            "ext-1".into(),
            None,
            json!({}),
        )
    }

    fn external(id: &str, name: &str) -> ExternalJob {
        serde_json::from_value(json!({"id": id, "name": name})).unwrap()
    }

    #[test]
    fn test_classify() {
        let jobs = vec![briefing()];

        assert_eq!(
            classify(&jobs, &external("ext-1", "briefing")),
            Ownership::LocalTimezone {
                job_id: jobs[0].id.clone(),
                job_name: "briefing".into(),
            }
        );
        assert_eq!(
            classify(&jobs, &external("x", "locron-geo-gym-enter-1700000000")),
            Ownership::GeofenceDelivery
        );
        assert_eq!(
            classify(&jobs, &external("y", "backup")),
            Ownership::Foreign
        );
    }
}
