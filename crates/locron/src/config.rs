//! Runtime configuration from flags, environment and the secrets file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use locron_gateway::GatewayClient;
use locron_location::{ProviderKind, ProviderSettings, TimezoneResolver, TzfLookup, build_provider};
use locron_scheduler::{DEFAULT_TIMEZONE, LocationBook, Scheduler, SchedulerConfig};
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::Deserialize;
use tracing::{debug, warn};

/// Settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Directory holding jobs.json, state.json and locations.json
    #[arg(long, env = "LOCRON_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Named geofence file (defaults to <data-dir>/locations.json)
    #[arg(long, env = "LOCRON_LOCATIONS_FILE", global = true)]
    pub locations_file: Option<PathBuf>,

    /// Location source: dawarich, static or none
    #[arg(long, env = "LOCRON_LOCATION_PROVIDER", default_value = "dawarich", global = true)]
    pub provider: ProviderKind,

    /// Dawarich base URL
    #[arg(
        long,
        env = "LOCRON_LOCATION_API_URL",
        default_value = "http://localhost:3000",
        global = true
    )]
    pub location_api_url: String,

    /// Dawarich API key (falls back to the secrets file)
    #[arg(long, env = "LOCRON_LOCATION_API_KEY", hide_env_values = true, global = true)]
    pub location_api_key: Option<String>,

    /// JSON secrets file, e.g. {"dawarich": {"api_key": "..."}}
    #[arg(long, env = "LOCRON_SECRETS_FILE", global = true)]
    pub secrets_file: Option<PathBuf>,

    /// Latitude for the static provider
    #[arg(long, env = "LOCRON_STATIC_LAT", allow_hyphen_values = true, global = true)]
    pub static_lat: Option<f64>,

    /// Longitude for the static provider
    #[arg(long, env = "LOCRON_STATIC_LON", allow_hyphen_values = true, global = true)]
    pub static_lon: Option<f64>,

    /// Timezone used when no location has ever resolved
    #[arg(long, env = "LOCRON_DEFAULT_TZ", default_value = DEFAULT_TIMEZONE, global = true)]
    pub default_tz: String,

    /// Base URL of the external cron engine
    #[arg(long, env = "LOCRON_GATEWAY_URL", global = true)]
    pub gateway_url: Option<String>,

    /// Bearer token for the cron engine
    #[arg(long, env = "LOCRON_GATEWAY_TOKEN", hide_env_values = true, global = true)]
    pub gateway_token: Option<String>,

    /// Per-request timeout for provider and gateway calls, in seconds
    #[arg(long, env = "LOCRON_TIMEOUT_SECS", default_value = "10", global = true)]
    pub timeout_secs: u64,
}

/// Attempts each HTTP client makes before giving up.
const CLIENT_ATTEMPTS: u32 = 3;

#[derive(Debug, Default, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    dawarich: Option<DawarichSecrets>,
}

#[derive(Debug, Default, Deserialize)]
struct DawarichSecrets {
    #[serde(default)]
    api_key: Option<String>,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub locations_file: PathBuf,
    pub provider: ProviderSettings,
    pub default_timezone: String,
    pub gateway_url: Option<String>,
    pub gateway_token: String,
    pub request_timeout: Duration,
}

impl Config {
    /// Merge flags, environment and the secrets file.
    pub async fn load(args: ConfigArgs) -> Result<Self> {
        let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
        let locations_file = args
            .locations_file
            .unwrap_or_else(|| data_dir.join("locations.json"));
        let request_timeout = Duration::from_secs(args.timeout_secs.max(1));

        let api_key = match args.location_api_key.filter(|k| !k.is_empty()) {
            Some(key) => Some(key),
            None => match &args.secrets_file {
                Some(path) => read_dawarich_key(path).await?,
                None => None,
            },
        };
        if args.provider == ProviderKind::Dawarich && api_key.is_none() {
            warn!("no Dawarich API key configured, location fetches will be rejected");
        }

        let static_point = match (args.static_lat, args.static_lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        };

        Ok(Self {
            data_dir,
            locations_file,
            provider: ProviderSettings {
                kind: args.provider,
                api_url: args.location_api_url,
                api_key,
                static_point,
                timeout: request_timeout,
            },
            default_timezone: args.default_tz,
            gateway_url: args.gateway_url.filter(|u| !u.is_empty()),
            gateway_token: args.gateway_token.unwrap_or_default(),
            request_timeout,
        })
    }

    /// Bound on one provider fetch or gateway action, retries included.
    pub fn call_timeout(&self) -> Duration {
        self.request_timeout * CLIENT_ATTEMPTS + Duration::from_secs(2)
    }

    pub fn location_book(&self) -> LocationBook {
        LocationBook::new(&self.locations_file)
    }

    /// Wire up provider, gateway and resolver into a scheduler.
    pub fn build_scheduler(&self) -> Result<Scheduler> {
        let gateway_url = self.gateway_url.as_deref().ok_or_else(|| {
            miette::miette!("no cron engine configured (set LOCRON_GATEWAY_URL or --gateway-url)")
        })?;

        let provider = build_provider(&self.provider)
            .map_err(|e| miette::miette!("invalid location provider config: {}", e))?;
        let gateway = GatewayClient::new(gateway_url, &self.gateway_token, self.request_timeout);
        debug!(provider = provider.name(), gateway = %gateway.base_url(), "building scheduler");

        let config = SchedulerConfig {
            data_dir: self.data_dir.clone(),
            locations_file: Some(self.locations_file.clone()),
            default_timezone: self.default_timezone.clone(),
            call_timeout: self.call_timeout(),
        };

        Scheduler::new(
            config,
            Arc::from(provider),
            Arc::new(gateway),
            TimezoneResolver::new(TzfLookup::new()),
        )
        .map_err(|e| miette::miette!("{}", e))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("locron")
}

async fn read_dawarich_key(path: &Path) -> Result<Option<String>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "secrets file not found");
            return Ok(None);
        }
        Err(e) => {
            return Err(e)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to read {}", path.display()));
        }
    };

    let secrets: SecretsFile = serde_json::from_str(&content)
        .into_diagnostic()
        .wrap_err_with(|| format!("invalid secrets file {}", path.display()))?;

    Ok(secrets
        .dawarich
        .and_then(|d| d.api_key)
        .filter(|k| !k.is_empty()))
}
