//! Self-check of the stores and the external mirrors.

use std::collections::BTreeMap;

use locron_gateway::ExternalJob;

use crate::{JobKind, Scheduler};

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl HealthCheck {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

impl Scheduler {
    /// Verify that every store parses, every geofence job points at a known
    /// location, and every local-timezone mirror exists in the engine with
    /// the timezone locron expects. Never modifies anything.
    pub async fn check(&self) -> HealthReport {
        let mut report = HealthReport::default();

        let jobs = match self.jobs.list().await {
            Ok(jobs) => {
                report
                    .checks
                    .push(HealthCheck::pass("jobs", format!("{} jobs", jobs.len())));
                jobs
            }
            Err(e) => {
                report.checks.push(HealthCheck::fail("jobs", e.to_string()));
                Vec::new()
            }
        };

        let expected_tz = match self.state.inspect().await {
            Ok(state) => {
                let detail = match state.last_tick_at {
                    Some(at) => format!("last tick at {}", at.to_rfc3339()),
                    None => "never ticked".to_string(),
                };
                report.checks.push(HealthCheck::pass("state", detail));
                state
                    .last_resolved_timezone
                    .unwrap_or_else(|| self.default_timezone.clone())
            }
            Err(e) => {
                report.checks.push(HealthCheck::fail("state", e.to_string()));
                self.default_timezone.clone()
            }
        };

        match self.locations.load().await {
            Ok(zones) => {
                let missing: Vec<_> = jobs
                    .iter()
                    .filter_map(|job| match &job.kind {
                        JobKind::Geofence { location_ref, .. }
                            if !zones.contains_key(location_ref) =>
                        {
                            Some(format!("{} -> {}", job.name, location_ref))
                        }
                        _ => None,
                    })
                    .collect();
                if missing.is_empty() {
                    report.checks.push(HealthCheck::pass(
                        "locations",
                        format!("{} locations", zones.len()),
                    ));
                } else {
                    report.checks.push(HealthCheck::fail(
                        "locations",
                        format!("undefined locations: {}", missing.join(", ")),
                    ));
                }
            }
            Err(e) => report
                .checks
                .push(HealthCheck::fail("locations", e.to_string())),
        }

        let external = match self.gateway.list_jobs().await {
            Ok(external) => {
                report.checks.push(HealthCheck::pass(
                    "gateway",
                    format!("{} external jobs", external.len()),
                ));
                Some(external)
            }
            Err(e) => {
                report.checks.push(HealthCheck::fail("gateway", e.to_string()));
                None
            }
        };

        if let Some(external) = external {
            report.checks.push(mirror_check(&jobs, &external, &expected_tz));
        }

        report
    }
}

fn mirror_check(jobs: &[crate::Job], external: &[ExternalJob], expected_tz: &str) -> HealthCheck {
    let by_id: BTreeMap<&str, &ExternalJob> =
        external.iter().map(|j| (j.id.as_str(), j)).collect();
    let mut problems = Vec::new();
    let mut tracked = 0;

    for job in jobs.iter().filter(|j| j.enabled) {
        let Some(external_ref) = job.external_job_ref() else {
            continue;
        };
        tracked += 1;
        match by_id.get(external_ref) {
            None => problems.push(format!("{}: external job {external_ref} missing", job.name)),
            Some(ext) if ext.timezone() != Some(expected_tz) => problems.push(format!(
                "{}: engine has {}, expected {expected_tz}",
                job.name,
                ext.timezone().unwrap_or("no timezone")
            )),
            Some(_) => {}
        }
    }

    if problems.is_empty() {
        HealthCheck::pass("mirrors", format!("{tracked} in sync with {expected_tz}"))
    } else {
        HealthCheck::fail("mirrors", problems.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Job;
    use serde_json::json;

    fn briefing(ext: &str) -> Job {
        Job::local_timezone(
            "briefing".into(),
            "30 6 * * *".into(),
            ext.into(),
            Some("Europe/London".into()),
            json!({}),
        )
    }

    fn external(id: &str, tz: &str) -> ExternalJob {
        serde_json::from_value(json!({"id": id, "schedule": {"expr": "30 6 * * *", "tz": tz}}))
            .unwrap()
    }

    #[test]
    fn test_mirror_in_sync() {
        let check = mirror_check(
            &[briefing("ext-1")],
            &[external("ext-1", "Europe/London")],
            "Europe/London",
        );
        assert!(check.passed, "{}", check.detail);
    }

    #[test]
    fn test_mirror_drift_and_missing() {
        let check = mirror_check(
            &[briefing("ext-1"), briefing("ext-2")],
            &[external("ext-1", "America/New_York")],
            "Europe/London",
        );
        assert!(!check.passed);
        assert!(check.detail.contains("engine has America/New_York"));
        assert!(check.detail.contains("ext-2 missing"));
    }
}
