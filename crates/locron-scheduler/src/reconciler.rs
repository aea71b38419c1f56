//! Turns the current location picture into gateway actions, and gateway
//! outcomes back into state.
//!
//! Everything here is synchronous and free of I/O; the tick loop owns the
//! side effects.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use locron_location::{Edge, Evaluation, GeofenceRuntimeState, Location, LocationSample, evaluate};
use tracing::{debug, warn};

use crate::{GlobalState, Job, JobKind};

/// A side effect against the external cron engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Point a local-timezone job's external mirror at a new timezone.
    PatchExternalJob {
        job_id: String,
        external_job_ref: String,
        timezone: String,
    },
    /// Deliver a geofence job's payload now.
    FireAction {
        job_id: String,
        job_name: String,
        side: Edge,
        payload: serde_json::Value,
    },
}

impl Action {
    pub fn job_id(&self) -> &str {
        match self {
            Action::PatchExternalJob { job_id, .. } | Action::FireAction { job_id, .. } => job_id,
        }
    }
}

/// What happened when an action was executed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub action: Action,
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(action: Action) -> Self {
        Self {
            action,
            error: None,
        }
    }

    pub fn failed(action: Action, error: impl Into<String>) -> Self {
        Self {
            action,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A geofence job's evaluation against the current sample.
#[derive(Debug, Clone, PartialEq)]
pub struct GeofenceCheck {
    pub prior: GeofenceRuntimeState,
    pub evaluation: Evaluation,
}

/// A timezone that was successfully pushed to a job's external mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTimezone {
    pub job_id: String,
    pub timezone: String,
}

/// Evaluate every geofence job whose zone is known, keyed by job id.
///
/// Disabled jobs are evaluated too so their containment stays current and
/// re-enabling them does not produce a stale edge. A job with no runtime
/// entry yet starts from the containment recorded when it was created.
pub fn evaluate_geofences(
    jobs: &[Job],
    zones: &BTreeMap<String, Location>,
    sample: Option<&LocationSample>,
    state: &GlobalState,
) -> BTreeMap<String, GeofenceCheck> {
    let mut checks = BTreeMap::new();
    for job in jobs {
        let JobKind::Geofence {
            location_ref,
            inside_at_creation,
            ..
        } = &job.kind
        else {
            continue;
        };
        let Some(zone) = zones.get(location_ref) else {
            warn!(job = %job.name, location = %location_ref, "geofence job references unknown location");
            continue;
        };

        let prior = match state.geofence_runtime_states.get(&job.id) {
            Some(prior) => prior.clone(),
            None => GeofenceRuntimeState {
                inside: inside_at_creation.unwrap_or(false),
                ..Default::default()
            },
        };
        let evaluation = evaluate(sample, zone, &prior);
        checks.insert(job.id.clone(), GeofenceCheck { prior, evaluation });
    }
    checks
}

/// Actions needed to bring the external engine in line with `timezone` and
/// the geofence checks.
pub fn plan(jobs: &[Job], timezone: &str, checks: &BTreeMap<String, GeofenceCheck>) -> Vec<Action> {
    let mut actions = Vec::new();

    for job in jobs.iter().filter(|j| j.enabled) {
        match &job.kind {
            JobKind::LocalTimezone {
                external_job_ref,
                last_applied_tz,
                ..
            } => {
                if last_applied_tz.as_deref() != Some(timezone) {
                    actions.push(Action::PatchExternalJob {
                        job_id: job.id.clone(),
                        external_job_ref: external_job_ref.clone(),
                        timezone: timezone.to_string(),
                    });
                }
            }
            JobKind::Geofence { trigger, .. } => {
                let Some(check) = checks.get(&job.id) else {
                    continue;
                };
                let Some(edge) = check.evaluation.edge else {
                    continue;
                };
                if !trigger.matches(edge) {
                    continue;
                }
                if !job.recurring && check.prior.has_fired(edge) {
                    debug!(job = %job.name, %edge, "one-shot side already fired");
                    continue;
                }
                let Some(payload) = job.payload_for(edge) else {
                    warn!(job = %job.name, %edge, "no payload for edge");
                    continue;
                };
                actions.push(Action::FireAction {
                    job_id: job.id.clone(),
                    job_name: job.name.clone(),
                    side: edge,
                    payload: payload.clone(),
                });
            }
        }
    }

    actions
}

/// Fold action outcomes into `state` and report which timezones landed.
///
/// A geofence job whose fire failed keeps its prior runtime state, so the same
/// edge is detected and retried on the next tick. Runtime entries for jobs
/// that no longer exist are dropped.
pub fn settle(
    state: &mut GlobalState,
    jobs: &[Job],
    checks: &BTreeMap<String, GeofenceCheck>,
    outcomes: &[ActionOutcome],
    now: DateTime<Utc>,
) -> Vec<AppliedTimezone> {
    let mut applied = Vec::new();
    let mut failed_fires = BTreeSet::new();
    let mut fired: BTreeMap<&str, Vec<Edge>> = BTreeMap::new();

    for outcome in outcomes {
        match (&outcome.action, outcome.succeeded()) {
            (
                Action::PatchExternalJob {
                    job_id, timezone, ..
                },
                true,
            ) => applied.push(AppliedTimezone {
                job_id: job_id.clone(),
                timezone: timezone.clone(),
            }),
            (Action::PatchExternalJob { .. }, false) => {}
            (Action::FireAction { job_id, side, .. }, true) => {
                fired.entry(job_id.as_str()).or_default().push(*side);
            }
            (Action::FireAction { job_id, .. }, false) => {
                failed_fires.insert(job_id.as_str());
            }
        }
    }

    for job in jobs.iter().filter(|j| j.is_geofence()) {
        if failed_fires.contains(job.id.as_str()) {
            continue;
        }
        let Some(check) = checks.get(&job.id) else {
            continue;
        };

        let mut next = check.prior.clone();
        next.inside = check.evaluation.inside;
        if check.evaluation.edge.is_some() {
            next.last_transition_at = Some(now);
        }
        if !job.recurring {
            for edge in fired.get(job.id.as_str()).into_iter().flatten() {
                next.mark_fired(*edge);
            }
        }
        state.geofence_runtime_states.insert(job.id.clone(), next);
    }

    let live: BTreeSet<&str> = jobs
        .iter()
        .filter(|j| j.is_geofence())
        .map(|j| j.id.as_str())
        .collect();
    state
        .geofence_runtime_states
        .retain(|id, _| live.contains(id.as_str()));

    applied
}
