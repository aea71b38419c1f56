//! Location-aware scheduling core.
//!
//! Two kinds of jobs are managed here:
//!
//! - **Local-timezone jobs** run on a cron expression in whatever timezone the
//!   user is currently in. The external engine runs them; each tick re-points
//!   the engine's copy at the timezone resolved from the latest location.
//! - **Geofence jobs** fire an action when the user enters or leaves a named
//!   circular zone. Only crossings fire; staying inside or outside does not.
//!
//! A [`Scheduler`] ties the stores to a location provider and a cron gateway
//! and drives both kinds from [`Scheduler::tick`].

mod error;
mod health;
mod locations;
mod persist;
pub mod reconciler;
mod scheduler;
mod state;
mod store;
mod tick;
mod types;

pub use error::{Result, SchedulerError};
pub use health::{HealthCheck, HealthReport};
pub use locations::{DEFAULT_RADIUS_METERS, LocationBook};
pub use reconciler::{Action, ActionOutcome};
pub use scheduler::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_TIMEZONE, ExternalListing, GeofenceStatus, JobEdit,
    JobListing, NewGeofenceJob, NewLocalTimezoneJob, Ownership, Scheduler, SchedulerConfig, Status,
};
pub use state::{GlobalState, STATE_VERSION, StateStore};
pub use store::JobStore;
pub use tick::{TickPhase, TickReport};
pub use types::{ActionSide, FIRE_JOB_PREFIX, Job, JobKind, Trigger, validate_schedule_expr};
