//! Job types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use locron_location::{Edge, is_valid_timezone};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Prefix of one-shot jobs created to deliver geofence actions.
pub const FIRE_JOB_PREFIX: &str = "locron-geo";

/// A locron-owned job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Stable unique id (UUID v4).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the job follows: the clock in local time, or a geofence.
    #[serde(flatten)]
    pub kind: JobKind,
    /// Geofence only: fire on every qualifying transition instead of once per side.
    #[serde(default)]
    pub recurring: bool,
    /// Payloads handed to the cron engine, keyed by the side they answer.
    #[serde(default)]
    pub actions: BTreeMap<ActionSide, serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

/// The two job kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// A cron expression evaluated in whatever timezone the user is in.
    LocalTimezone {
        schedule_expr: String,
        /// Id of the mirrored job inside the external engine.
        external_job_ref: String,
        /// Timezone most recently pushed to the external job.
        #[serde(default)]
        last_applied_tz: Option<String>,
    },
    /// An action fired when the user crosses a named geofence.
    Geofence {
        location_ref: String,
        trigger: Trigger,
        /// Containment at creation time, from the last known location.
        /// Stands in for the prior until the first tick records one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inside_at_creation: Option<bool>,
    },
}

/// Which crossings a geofence job reacts to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Enter,
    Exit,
    Both,
}

impl Trigger {
    /// Whether an edge of this kind qualifies.
    pub fn matches(self, edge: Edge) -> bool {
        matches!(
            (self, edge),
            (Trigger::Both, _) | (Trigger::Enter, Edge::Enter) | (Trigger::Exit, Edge::Exit)
        )
    }

    /// Edges this trigger can fire on.
    pub fn edges(self) -> &'static [Edge] {
        match self {
            Trigger::Enter => &[Edge::Enter],
            Trigger::Exit => &[Edge::Exit],
            Trigger::Both => &[Edge::Enter, Edge::Exit],
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Enter => write!(f, "enter"),
            Trigger::Exit => write!(f, "exit"),
            Trigger::Both => write!(f, "both"),
        }
    }
}

impl FromStr for Trigger {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enter" | "arrive" => Ok(Trigger::Enter),
            "exit" | "leave" => Ok(Trigger::Exit),
            "both" => Ok(Trigger::Both),
            other => Err(SchedulerError::InvalidJobSpec(format!(
                "unknown trigger '{other}' (expected enter, exit or both)"
            ))),
        }
    }
}

/// Key of an action payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSide {
    Enter,
    Exit,
    /// Used when no side-specific payload exists.
    Default,
}

impl From<Edge> for ActionSide {
    fn from(edge: Edge) -> Self {
        match edge {
            Edge::Enter => ActionSide::Enter,
            Edge::Exit => ActionSide::Exit,
        }
    }
}

impl Job {
    /// Create a local-timezone job mirrored by `external_job_ref`.
    pub fn local_timezone(
        name: String,
        schedule_expr: String,
        external_job_ref: String,
        applied_tz: Option<String>,
        action: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            kind: JobKind::LocalTimezone {
                schedule_expr,
                external_job_ref,
                last_applied_tz: applied_tz,
            },
            recurring: false,
            actions: BTreeMap::from([(ActionSide::Default, action)]),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    /// Create a geofence job.
    pub fn geofence(
        name: String,
        location_ref: String,
        trigger: Trigger,
        recurring: bool,
        actions: BTreeMap<ActionSide, serde_json::Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            kind: JobKind::Geofence {
                location_ref,
                trigger,
                inside_at_creation: None,
            },
            recurring,
            actions,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn is_geofence(&self) -> bool {
        matches!(self.kind, JobKind::Geofence { .. })
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            JobKind::LocalTimezone { .. } => "local_timezone",
            JobKind::Geofence { .. } => "geofence",
        }
    }

    /// External engine id, for local-timezone jobs.
    pub fn external_job_ref(&self) -> Option<&str> {
        match &self.kind {
            JobKind::LocalTimezone {
                external_job_ref, ..
            } => Some(external_job_ref),
            JobKind::Geofence { .. } => None,
        }
    }

    /// Payload for an edge: the side-specific entry, else `default`.
    pub fn payload_for(&self, edge: Edge) -> Option<&serde_json::Value> {
        self.actions
            .get(&ActionSide::from(edge))
            .or_else(|| self.actions.get(&ActionSide::Default))
    }

    /// Record whether the user was inside the zone when the job was made.
    pub fn with_inside_at_creation(mut self, inside: Option<bool>) -> Self {
        if let JobKind::Geofence {
            inside_at_creation, ..
        } = &mut self.kind
        {
            *inside_at_creation = inside;
        }
        self
    }

    /// Replace a local-timezone job's cron expression.
    pub fn set_schedule_expr(&mut self, expr: String) {
        if let JobKind::LocalTimezone { schedule_expr, .. } = &mut self.kind {
            *schedule_expr = expr;
        }
    }

    /// Record a timezone as pushed to the external job.
    pub fn set_last_applied_tz(&mut self, tz: String) {
        if let JobKind::LocalTimezone {
            last_applied_tz, ..
        } = &mut self.kind
        {
            *last_applied_tz = Some(tz);
        }
    }

    /// Check the invariants of this job's kind.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.id.trim().is_empty() {
            return Err(SchedulerError::InvalidJobSpec("id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(SchedulerError::InvalidJobSpec(
                "name must not be empty".into(),
            ));
        }

        match &self.kind {
            JobKind::LocalTimezone {
                schedule_expr,
                external_job_ref,
                last_applied_tz,
            } => {
                validate_schedule_expr(schedule_expr)?;
                if external_job_ref.trim().is_empty() {
                    return Err(SchedulerError::InvalidJobSpec(format!(
                        "job '{}' has no external job reference",
                        self.name
                    )));
                }
                if let Some(tz) = last_applied_tz.as_deref().filter(|tz| !is_valid_timezone(tz)) {
                    return Err(SchedulerError::InvalidJobSpec(format!(
                        "unknown timezone '{tz}'"
                    )));
                }
                if self.recurring {
                    return Err(SchedulerError::InvalidJobSpec(
                        "recurring applies to geofence jobs only".into(),
                    ));
                }
            }
            JobKind::Geofence {
                location_ref,
                trigger,
                ..
            } => {
                if location_ref.trim().is_empty() {
                    return Err(SchedulerError::InvalidJobSpec(format!(
                        "geofence job '{}' has no location",
                        self.name
                    )));
                }
                for edge in trigger.edges() {
                    if self.payload_for(*edge).is_none() {
                        return Err(SchedulerError::InvalidJobSpec(format!(
                            "geofence job '{}' has no action for {edge}",
                            self.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Accept standard 5-field cron expressions and the 6-field seconds variant.
pub fn validate_schedule_expr(expr: &str) -> Result<(), SchedulerError> {
    let fields = expr.split_whitespace().count();
    if fields == 5 || fields == 6 {
        Ok(())
    } else {
        Err(SchedulerError::InvalidJobSpec(format!(
            "cron expression '{expr}' has {fields} fields, expected 5 or 6"
        )))
    }
}
