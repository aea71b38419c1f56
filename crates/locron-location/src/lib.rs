//! Location intelligence for locron.
//!
//! This crate turns raw GPS data into the two signals the scheduler core
//! cares about:
//! - **Timezone**: the IANA zone containing the user's last known point,
//!   with a total fallback chain
//! - **Geofence edges**: enter/exit transitions for named circular zones
//!
//! ## Components
//!
//! - **Providers**: pluggable `fetch` seam (Dawarich, static point, none)
//! - **Cache**: last known sample, replaced only by newer observations
//! - **Resolver**: point → timezone lookup backed by `tzf-rs`
//! - **Geofence**: haversine containment and edge detection

mod cache;
mod dawarich;
mod error;
mod geofence;
mod provider;
mod sample;
mod timezone;

pub use cache::LocationCache;
pub use dawarich::DawarichProvider;
pub use error::{InvalidLocation, ProviderError};
pub use geofence::{
    EARTH_RADIUS_METERS, Edge, Evaluation, GeofenceRuntimeState, Location, evaluate,
    haversine_meters,
};
pub use provider::{
    Fetch, LocationProvider, NullProvider, ProviderKind, ProviderSettings, StaticProvider,
    build_provider,
};
pub use sample::LocationSample;
pub use timezone::{
    ResolvedTimezone, TimezoneLookup, TimezoneResolver, TimezoneSource, TzfLookup,
    is_valid_timezone,
};
