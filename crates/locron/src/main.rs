//! locron: location-aware cron shim
//!
//! Main binary with subcommands:
//! - `add`: create a local-timezone or geofence job
//! - `edit`: change a job's cron expression, or adopt an engine job
//! - `list` / `status`: inspect jobs and the last known location
//! - `tick`: run one reconciliation pass, or keep ticking with `--daemon`
//! - `location`: manage named geofences
//! - `check`: verify stores and engine mirrors

use std::time::Duration;

use clap::{Parser, Subcommand};
use locron_scheduler::Trigger;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod daemon;

use commands::{AddTarget, PayloadArgs};
use config::{Config, ConfigArgs};

fn parse_trigger(s: &str) -> Result<Trigger, String> {
    s.parse::<Trigger>().map_err(|e| e.to_string())
}

#[derive(Parser)]
#[command(name = "locron")]
#[command(about = "Location-aware cron: local-timezone and geofence jobs", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job that follows your timezone (--cron) or a geofence (--location)
    Add {
        /// Job name
        name: String,

        /// Cron expression evaluated in your current timezone
        #[arg(long, conflicts_with = "location", required_unless_present = "location")]
        cron: Option<String>,

        /// Named location to watch
        #[arg(long)]
        location: Option<String>,

        /// Which crossing fires: enter, exit or both
        #[arg(long = "on", default_value = "enter", value_parser = parse_trigger)]
        trigger: Trigger,

        /// Fire on every crossing instead of once per side
        #[arg(long)]
        recurring: bool,

        /// Text injected into the main session
        #[arg(long)]
        system_event: Option<String>,

        /// Prompt for an isolated agent turn
        #[arg(long)]
        message: Option<String>,

        /// Raw JSON action payload
        #[arg(long)]
        payload: Option<String>,

        /// System event for entering (geofence only)
        #[arg(long)]
        enter_event: Option<String>,

        /// System event for leaving (geofence only)
        #[arg(long)]
        exit_event: Option<String>,
    },

    /// Change a job's cron expression, or make an engine job follow your timezone
    Edit {
        /// Job id or name (locron or engine)
        job: String,

        /// New cron expression
        #[arg(long, required_unless_present = "local")]
        cron: Option<String>,

        /// Track this engine job in your local timezone
        #[arg(long)]
        local: bool,
    },

    /// List locron jobs next to the cron engine's jobs
    List,

    /// Show last known location, timezone and geofence state
    Status,

    /// Run one reconciliation pass
    Tick {
        /// Keep ticking until interrupted
        #[arg(long)]
        daemon: bool,

        /// Seconds between ticks in daemon mode
        #[arg(long, env = "LOCRON_TICK_INTERVAL", default_value = "30")]
        interval: u64,
    },

    /// Remove a job (by id or name)
    Rm { job: String },

    /// Enable a job (by id or name)
    Enable { job: String },

    /// Disable a job (by id or name)
    Disable { job: String },

    /// Manage named locations
    #[command(subcommand)]
    Location(LocationCommand),

    /// Verify stores and that engine jobs match locron's view
    Check,
}

#[derive(Subcommand)]
enum LocationCommand {
    /// Add or replace a location
    Add {
        name: String,

        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Radius in meters
        #[arg(long, default_value_t = locron_scheduler::DEFAULT_RADIUS_METERS)]
        radius: f64,
    },

    /// List locations
    List,

    /// Remove a location
    Rm { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "locron=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config).await?;

    match cli.command {
        Commands::Location(command) => {
            let book = config.location_book();
            match command {
                LocationCommand::Add {
                    name,
                    lat,
                    lon,
                    radius,
                } => commands::location_add(&book, name, lat, lon, radius).await,
                LocationCommand::List => commands::location_list(&book).await,
                LocationCommand::Rm { name } => commands::location_remove(&book, &name).await,
            }
        }

        Commands::Add {
            name,
            cron,
            location,
            trigger,
            recurring,
            system_event,
            message,
            payload,
            enter_event,
            exit_event,
        } => {
            let target = match (cron, location) {
                (Some(expr), _) => AddTarget::Cron(expr),
                (None, Some(location)) => AddTarget::Geofence {
                    location,
                    trigger,
                    recurring,
                },
                (None, None) => {
                    return Err(miette::miette!("either --cron or --location is required"));
                }
            };
            let payload = PayloadArgs {
                system_event,
                message,
                payload,
                enter_event,
                exit_event,
            };
            let scheduler = config.build_scheduler()?;
            commands::add(&scheduler, name, target, payload).await
        }

        Commands::Edit { job, cron, local } => {
            commands::edit(&config.build_scheduler()?, &job, cron, local).await
        }

        Commands::List => commands::list(&config.build_scheduler()?).await,

        Commands::Status => commands::status(&config.build_scheduler()?).await,

        Commands::Tick {
            daemon: forever,
            interval,
        } => {
            let scheduler = config.build_scheduler()?;
            if forever {
                daemon::run(scheduler, Duration::from_secs(interval.max(1))).await
            } else {
                commands::tick_once(&scheduler).await
            }
        }

        Commands::Rm { job } => commands::remove(&config.build_scheduler()?, &job).await,

        Commands::Enable { job } => {
            commands::set_enabled(&config.build_scheduler()?, &job, true).await
        }

        Commands::Disable { job } => {
            commands::set_enabled(&config.build_scheduler()?, &job, false).await
        }

        Commands::Check => commands::check(&config.build_scheduler()?).await,
    }
}
