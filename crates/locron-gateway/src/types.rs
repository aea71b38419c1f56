//! Wire types for the cron engine API.

use serde::{Deserialize, Serialize};

/// A job as the external engine describes it.
///
/// Fields the engine adds that locron does not interpret are kept in `extra`
/// so listings can pass them through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalJob {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub schedule: Option<ExternalSchedule>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ExternalJob {
    /// Timezone the engine evaluates this job's schedule in, if any.
    pub fn timezone(&self) -> Option<&str> {
        self.schedule.as_ref().and_then(|s| s.tz.as_deref())
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalSchedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateJobRequest<'a> {
    pub name: &'a str,
    pub schedule: ExternalSchedule,
    pub action: &'a serde_json::Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub delete_after_run: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateJobResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct PatchJobRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<&'a str>,
    pub tz: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListJobsResponse {
    #[serde(default)]
    pub jobs: Vec<ExternalJob>,
}
