//! One pass of the reconciliation loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use locron_location::{
    Fetch, LocationCache, LocationSample, ResolvedTimezone, TimezoneSource,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::reconciler::{self, Action, ActionOutcome, AppliedTimezone};
use crate::{FIRE_JOB_PREFIX, GlobalState, Scheduler, SchedulerError};

/// Whether a tick is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Running,
}

/// Holds the single-flight flag for the duration of a tick.
struct TickGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// What a tick saw and did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    /// Location used for this tick, fresh or cached.
    pub location: Option<LocationSample>,
    /// The provider delivered a newer sample this tick.
    pub location_refreshed: bool,
    pub provider_error: Option<String>,
    pub timezone: ResolvedTimezone,
    pub outcomes: Vec<ActionOutcome>,
}

impl TickReport {
    pub fn patches_applied(&self) -> usize {
        self.count(|o| matches!(o.action, Action::PatchExternalJob { .. }) && o.succeeded())
    }

    pub fn fires_delivered(&self) -> usize {
        self.count(|o| matches!(o.action, Action::FireAction { .. }) && o.succeeded())
    }

    pub fn failures(&self) -> usize {
        self.count(|o| !o.succeeded())
    }

    fn count(&self, pred: impl Fn(&ActionOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }

    pub(crate) fn log(&self) {
        if self.outcomes.is_empty() {
            debug!(timezone = %self.timezone.name, "tick: nothing to do");
        } else {
            info!(
                timezone = %self.timezone.name,
                patched = self.patches_applied(),
                fired = self.fires_delivered(),
                failed = self.failures(),
                "tick complete"
            );
        }
    }
}

/// Result of refreshing the location picture.
pub(crate) struct Located {
    pub sample: Option<LocationSample>,
    pub refreshed: bool,
    pub provider_error: Option<String>,
    pub timezone: ResolvedTimezone,
}

impl Scheduler {
    pub fn phase(&self) -> TickPhase {
        if self.running.load(Ordering::Acquire) {
            TickPhase::Running
        } else {
            TickPhase::Idle
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Provider and gateway failures are recorded in the report and never
    /// abort the tick. Only store failures do. Returns [`SchedulerError::Busy`]
    /// if a tick is already running.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let _guard = TickGuard::acquire(&self.running).ok_or(SchedulerError::Busy)?;
        let started_at = Utc::now();

        let mut state = self.state.load().await?;
        let jobs = self.jobs.list().await?;
        let zones = match self.locations.load().await {
            Ok(zones) => zones,
            Err(e) => {
                warn!(error = %e, "location book unreadable, skipping geofences");
                BTreeMap::new()
            }
        };

        let located = self.locate(&mut state).await;

        let checks =
            reconciler::evaluate_geofences(&jobs, &zones, located.sample.as_ref(), &state);
        let actions = reconciler::plan(&jobs, &located.timezone.name, &checks);

        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            outcomes.push(self.execute(action, started_at).await);
        }

        let applied = reconciler::settle(&mut state, &jobs, &checks, &outcomes, started_at);
        for AppliedTimezone { job_id, timezone } in applied {
            if let Err(e) = self
                .jobs
                .update(&job_id, |job| job.set_last_applied_tz(timezone))
                .await
            {
                warn!(%job_id, error = %e, "could not record applied timezone");
            }
        }

        state.last_tick_at = Some(started_at);
        self.state.save(&state).await?;

        Ok(TickReport {
            started_at,
            location: located.sample,
            location_refreshed: located.refreshed,
            provider_error: located.provider_error,
            timezone: located.timezone,
            outcomes,
        })
    }

    /// Poll the provider, fold the result into the cached location and
    /// resolve the timezone. Updates `state` in place.
    ///
    /// The fallback chain is: timezone at the current sample, then the last
    /// timezone resolved from a sample, then the configured default.
    pub(crate) async fn locate(&self, state: &mut GlobalState) -> Located {
        let mut cache = LocationCache::seeded(state.last_location);
        let mut refreshed = false;
        let mut provider_error = None;

        match timeout(self.call_timeout, self.provider.fetch()).await {
            Ok(Ok(Fetch::Sample(sample))) => {
                refreshed = cache.update(sample);
                if !refreshed {
                    debug!(provider = self.provider.name(), "sample not newer than cached");
                }
            }
            Ok(Ok(Fetch::NoNewData)) => {
                debug!(provider = self.provider.name(), "no new location data");
            }
            Ok(Err(e)) => {
                warn!(provider = self.provider.name(), error = %e, "location fetch failed, using cached location");
                provider_error = Some(e.to_string());
            }
            Err(_) => {
                warn!(provider = self.provider.name(), timeout = ?self.call_timeout, "location fetch timed out");
                provider_error = Some(format!("timed out after {:?}", self.call_timeout));
            }
        }

        let sample = cache.current().copied();
        let fallback = state
            .last_resolved_timezone
            .clone()
            .unwrap_or_else(|| self.default_timezone.clone());
        let timezone = self.resolver.resolve(sample.as_ref(), &fallback);

        state.last_location = sample;
        if timezone.source == TimezoneSource::Location {
            state.last_resolved_timezone = Some(timezone.name.clone());
        }

        Located {
            sample,
            refreshed,
            provider_error,
            timezone,
        }
    }

    /// Carry out one action against the gateway, bounded by the call timeout.
    async fn execute(&self, action: Action, now: DateTime<Utc>) -> ActionOutcome {
        let result = match &action {
            Action::PatchExternalJob {
                external_job_ref,
                timezone,
                ..
            } => {
                timeout(
                    self.call_timeout,
                    self.gateway.patch_job(external_job_ref, timezone),
                )
                .await
            }
            Action::FireAction {
                job_name,
                side,
                payload,
                ..
            } => {
                let name = format!("{FIRE_JOB_PREFIX}-{job_name}-{side}-{}", now.timestamp());
                timeout(self.call_timeout, self.gateway.run_now(&name, payload))
                    .await
                    .map(|r| r.map(|_| ()))
            }
        };

        match result {
            Ok(Ok(())) => {
                match &action {
                    Action::PatchExternalJob {
                        job_id, timezone, ..
                    } => info!(%job_id, %timezone, "patched external job timezone"),
                    Action::FireAction { job_name, side, .. } => {
                        info!(job = %job_name, %side, "fired geofence action")
                    }
                }
                ActionOutcome::ok(action)
            }
            Ok(Err(e)) => {
                warn!(job_id = %action.job_id(), error = %e, "gateway action failed, will retry next tick");
                ActionOutcome::failed(action, e.to_string())
            }
            Err(_) => {
                warn!(job_id = %action.job_id(), timeout = ?self.call_timeout, "gateway action timed out");
                ActionOutcome::failed(
                    action,
                    format!("timed out after {:?}", self.call_timeout),
                )
            }
        }
    }
}
