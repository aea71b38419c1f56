//! Client for the external cron engine.
//!
//! locron never schedules time-based work itself. Local-timezone jobs live in
//! the external engine and are created and re-patched through this crate;
//! geofence actions are delivered as immediate one-shot jobs.
//!
//! The [`CronGateway`] trait is the seam the scheduler core depends on, so
//! the tick loop can be exercised against an in-memory engine in tests.

mod client;
mod error;
mod types;

pub use client::{CronGateway, GatewayClient};
pub use error::GatewayError;
pub use types::{ExternalJob, ExternalSchedule};
