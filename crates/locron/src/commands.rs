//! Subcommand handlers and their terminal output.

use std::collections::BTreeMap;

use locron_location::{Location, TimezoneSource};
use locron_scheduler::{
    ActionSide, Job, JobEdit, JobKind, LocationBook, NewGeofenceJob, NewLocalTimezoneJob,
    Ownership, Scheduler, Trigger,
};
use miette::{IntoDiagnostic, Result, WrapErr};
use serde_json::{Value, json};

/// Payload flags shared by `add`.
#[derive(Debug, Clone, Default)]
pub struct PayloadArgs {
    pub system_event: Option<String>,
    pub message: Option<String>,
    pub payload: Option<String>,
    pub enter_event: Option<String>,
    pub exit_event: Option<String>,
}

/// What `add` should create.
#[derive(Debug, Clone)]
pub enum AddTarget {
    Cron(String),
    Geofence {
        location: String,
        trigger: Trigger,
        recurring: bool,
    },
}

fn system_event(text: &str) -> Value {
    json!({ "systemEvent": text })
}

/// Turn payload flags into per-side actions.
///
/// `--payload` is raw JSON; `--message` starts an isolated agent turn;
/// `--system-event` injects text into the main session.
pub fn build_actions(args: &PayloadArgs) -> Result<BTreeMap<ActionSide, Value>> {
    let mut actions = BTreeMap::new();

    let default = match (&args.payload, &args.message, &args.system_event) {
        (Some(raw), _, _) => Some(
            serde_json::from_str::<Value>(raw)
                .into_diagnostic()
                .wrap_err("--payload is not valid JSON")?,
        ),
        (None, Some(text), _) => Some(json!({
            "message": text,
            "session": "isolated",
            "announce": true,
        })),
        (None, None, Some(text)) => Some(system_event(text)),
        (None, None, None) => None,
    };
    if let Some(default) = default {
        actions.insert(ActionSide::Default, default);
    }
    if let Some(text) = &args.enter_event {
        actions.insert(ActionSide::Enter, system_event(text));
    }
    if let Some(text) = &args.exit_event {
        actions.insert(ActionSide::Exit, system_event(text));
    }

    Ok(actions)
}

pub async fn add(
    scheduler: &Scheduler,
    name: String,
    target: AddTarget,
    payload: PayloadArgs,
) -> Result<()> {
    let mut actions = build_actions(&payload)?;

    let job = match target {
        AddTarget::Cron(schedule_expr) => {
            let action = actions.remove(&ActionSide::Default).ok_or_else(|| {
                miette::miette!("a cron job needs --system-event, --message or --payload")
            })?;
            scheduler
                .add_local_timezone_job(NewLocalTimezoneJob {
                    name,
                    schedule_expr,
                    action,
                })
                .await
        }
        AddTarget::Geofence {
            location,
            trigger,
            recurring,
        } => {
            scheduler
                .add_geofence_job(NewGeofenceJob {
                    name,
                    location_ref: location,
                    trigger,
                    recurring,
                    actions,
                })
                .await
        }
    }
    .map_err(|e| miette::miette!("{}", e))?;

    println!("Added {} job {} ({})", job.kind_label(), job.name, job.id);
    println!("  {}", describe(&job));
    Ok(())
}

fn describe(job: &Job) -> String {
    match &job.kind {
        JobKind::LocalTimezone {
            schedule_expr,
            external_job_ref,
            last_applied_tz,
        } => format!(
            "cron \"{}\" in {} (engine job {})",
            schedule_expr,
            last_applied_tz.as_deref().unwrap_or("pending timezone"),
            external_job_ref
        ),
        JobKind::Geofence {
            location_ref,
            trigger,
            ..
        } => format!(
            "geo:{} on:{} ({})",
            location_ref,
            trigger,
            if job.recurring { "recurring" } else { "one-shot" }
        ),
    }
}

pub async fn edit(
    scheduler: &Scheduler,
    selector: &str,
    cron: Option<String>,
    local: bool,
) -> Result<()> {
    let job = scheduler
        .edit_job(
            selector,
            JobEdit {
                schedule_expr: cron,
                track_local: local,
            },
        )
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    println!("Updated {} ({})", job.name, job.id);
    println!("  {}", describe(&job));
    Ok(())
}

pub async fn list(scheduler: &Scheduler) -> Result<()> {
    let listing = scheduler
        .list()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    println!("── locron jobs ──");
    if listing.jobs.is_empty() {
        println!("  (none)");
    }
    for job in &listing.jobs {
        let marker = if job.enabled { "on " } else { "off" };
        println!("  [{}] {:30} | {}", marker, job.name, describe(job));
    }

    println!();
    println!("── cron engine ──");
    match &listing.external {
        Ok(external) if external.is_empty() => println!("  (none)"),
        Ok(external) => {
            for entry in external {
                let owner = match &entry.owner {
                    Ownership::LocalTimezone { job_name, .. } => format!("locron:{job_name}"),
                    Ownership::GeofenceDelivery => "locron:geo".to_string(),
                    Ownership::Foreign => "-".to_string(),
                };
                let schedule = entry
                    .job
                    .schedule
                    .as_ref()
                    .map(|s| {
                        format!(
                            "{} {}",
                            s.expr.as_deref().or(s.at.as_deref()).unwrap_or("?"),
                            s.tz.as_deref().unwrap_or("")
                        )
                    })
                    .unwrap_or_default();
                println!(
                    "  {:12} {:30} | {:30} | {}",
                    entry.job.id, entry.job.name, schedule, owner
                );
            }
        }
        Err(reason) => println!("  unavailable: {reason}"),
    }

    Ok(())
}

pub async fn status(scheduler: &Scheduler) -> Result<()> {
    let status = scheduler
        .status()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    match &status.location {
        Some(sample) => println!(
            "Location:  {:.5}, {:.5} (observed {}, via {})",
            sample.latitude,
            sample.longitude,
            sample.observed_at.to_rfc3339(),
            status.provider
        ),
        None => println!("Location:  unknown (via {})", status.provider),
    }
    let source = match status.timezone.source {
        TimezoneSource::Location => "from location",
        TimezoneSource::Fallback => "default",
    };
    println!("Timezone:  {} ({})", status.timezone.name, source);
    println!("Local:     {}", status.local_time);
    println!(
        "Last tick: {}",
        status
            .last_tick_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    println!("Local-timezone jobs: {}", status.local_timezone_jobs);
    println!("Geofence jobs:       {}", status.geofences.len());
    for geo in &status.geofences {
        println!(
            "  {:30} {} {}{}",
            geo.job_name,
            if geo.inside { "inside " } else { "outside" },
            geo.location_ref,
            if geo.enabled { "" } else { " (disabled)" }
        );
    }
    Ok(())
}

pub async fn tick_once(scheduler: &Scheduler) -> Result<()> {
    let report = scheduler
        .tick()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    println!(
        "Timezone {} ({}), location {}",
        report.timezone.name,
        match report.timezone.source {
            TimezoneSource::Location => "from location",
            TimezoneSource::Fallback => "fallback",
        },
        if report.location_refreshed {
            "refreshed"
        } else {
            "cached"
        }
    );
    if let Some(error) = &report.provider_error {
        println!("Provider error: {error}");
    }
    println!(
        "Patched {}, fired {}, failed {}",
        report.patches_applied(),
        report.fires_delivered(),
        report.failures()
    );
    for outcome in report.outcomes.iter().filter(|o| !o.succeeded()) {
        println!(
            "  {}: {}",
            outcome.action.job_id(),
            outcome.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn remove(scheduler: &Scheduler, selector: &str) -> Result<()> {
    let job = scheduler
        .remove_job(selector)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Removed {} ({})", job.name, job.id);
    Ok(())
}

pub async fn set_enabled(scheduler: &Scheduler, selector: &str, enabled: bool) -> Result<()> {
    let job = scheduler
        .set_enabled(selector, enabled)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!(
        "{} {}",
        if enabled { "Enabled" } else { "Disabled" },
        job.name
    );
    Ok(())
}

pub async fn check(scheduler: &Scheduler) -> Result<()> {
    let report = scheduler.check().await;
    for check in &report.checks {
        println!(
            "{} {:10} {}",
            if check.passed { "ok  " } else { "FAIL" },
            check.name,
            check.detail
        );
    }
    if report.healthy() {
        Ok(())
    } else {
        Err(miette::miette!("health check failed"))
    }
}

pub async fn location_add(
    book: &LocationBook,
    name: String,
    latitude: f64,
    longitude: f64,
    radius_meters: f64,
) -> Result<()> {
    let location = Location::new(name, latitude, longitude, radius_meters)
        .map_err(|e| miette::miette!("{}", e))?;
    book.upsert(location.clone())
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!(
        "Saved {} at {:.5}, {:.5} (radius {} m)",
        location.name, location.latitude, location.longitude, location.radius_meters
    );
    Ok(())
}

pub async fn location_list(book: &LocationBook) -> Result<()> {
    let locations = book.load().await.map_err(|e| miette::miette!("{}", e))?;
    if locations.is_empty() {
        println!("(no locations)");
    }
    for location in locations.values() {
        println!(
            "  {:20} {:>10.5} {:>11.5} {:>6} m",
            location.name, location.latitude, location.longitude, location.radius_meters
        );
    }
    Ok(())
}

pub async fn location_remove(book: &LocationBook, name: &str) -> Result<()> {
    book.remove(name)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Removed location {name}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_system_event_payload() {
        let actions = build_actions(&PayloadArgs {
            system_event: Some("hello".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            actions,
            BTreeMap::from([(ActionSide::Default, json!({"systemEvent": "hello"}))])
        );
    }

    #[test]
    fn test_message_starts_isolated_turn() {
        let actions = build_actions(&PayloadArgs {
            message: Some("plan my day".into()),
            system_event: Some("ignored".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(actions[&ActionSide::Default]["session"], json!("isolated"));
    }

    #[test]
    fn test_side_specific_events() {
        let actions = build_actions(&PayloadArgs {
            enter_event: Some("hi".into()),
            exit_event: Some("bye".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(actions.len(), 2);
        assert!(!actions.contains_key(&ActionSide::Default));
    }

    #[test]
    fn test_raw_payload_must_be_json() {
        assert!(
            build_actions(&PayloadArgs {
                payload: Some("{nope".into()),
                ..Default::default()
            })
            .is_err()
        );
    }
}
