//! Cron engine HTTP client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::types::{
    CreateJobRequest, CreateJobResponse, ListJobsResponse, PatchJobRequest,
};
use crate::{ExternalJob, ExternalSchedule, GatewayError};

/// Attempts per call: initial + 2 retries with backoff.
const MAX_ATTEMPTS: u32 = 3;

/// Operations the scheduler core needs from the external cron engine.
#[async_trait]
pub trait CronGateway: Send + Sync {
    /// Create a recurring job evaluated in `timezone`. Returns the engine's id.
    async fn create_job(
        &self,
        name: &str,
        schedule_expr: &str,
        timezone: &str,
        action: &serde_json::Value,
    ) -> Result<String, GatewayError>;

    /// Move an existing job to a new timezone.
    async fn patch_job(&self, external_job_ref: &str, timezone: &str) -> Result<(), GatewayError>;

    /// Replace an existing job's cron expression, keeping it in `timezone`.
    async fn reschedule_job(
        &self,
        external_job_ref: &str,
        schedule_expr: &str,
        timezone: &str,
    ) -> Result<(), GatewayError>;

    /// Deliver `action` immediately as a one-shot job that deletes itself.
    async fn run_now(&self, name: &str, action: &serde_json::Value)
    -> Result<String, GatewayError>;

    /// Delete a job.
    async fn remove_job(&self, external_job_ref: &str) -> Result<(), GatewayError>;

    /// All jobs the engine knows about, owned by locron or not.
    async fn list_jobs(&self) -> Result<Vec<ExternalJob>, GatewayError>;
}

/// Client for the cron engine's JSON API.
pub struct GatewayClient {
    http: Client,
    base_url: String,
    token: String,
}

impl GatewayClient {
    /// Create a new client. `timeout` bounds every individual request.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Get the engine base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn jobs_url(&self) -> String {
        format!("{}/api/cron/jobs", self.base_url)
    }

    fn job_url(&self, id: &str) -> String {
        format!("{}/api/cron/jobs/{}", self.base_url, id)
    }

    /// Send a request, retrying transient failures with backoff.
    ///
    /// `build` is called once per attempt since a `RequestBuilder` is consumed
    /// by `send`.
    async fn execute<F>(&self, op: &'static str, build: F) -> Result<Response, GatewayError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match build().bearer_auth(&self.token).send().await {
                Ok(response) => Self::check_status(response).await,
                Err(e) => Err(GatewayError::from(e)),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(ref e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let backoff_ms = 500 * (1 << (attempt - 1)); // 500ms, 1s
                    warn!(
                        attempt,
                        backoff_ms,
                        error = %e,
                        "transient error in {op}, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(GatewayError::Unreachable(format!("{op}: {e}")));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Map non-success statuses onto the error taxonomy.
    async fn check_status(response: Response) -> Result<Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                GatewayError::AuthFailed(format!("{status}: {text}"))
            }
            StatusCode::NOT_FOUND => GatewayError::NotFound(text),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                GatewayError::Unreachable(format!("{status}: {text}"))
            }
            s => GatewayError::Rejected {
                status: s.as_u16(),
                message: text,
            },
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::InvalidResponse(format!("failed to decode body: {e}")))
    }
}

#[async_trait]
impl CronGateway for GatewayClient {
    async fn create_job(
        &self,
        name: &str,
        schedule_expr: &str,
        timezone: &str,
        action: &serde_json::Value,
    ) -> Result<String, GatewayError> {
        let url = self.jobs_url();
        let body = serde_json::to_value(CreateJobRequest {
            name,
            schedule: ExternalSchedule {
                expr: Some(schedule_expr.to_string()),
                tz: Some(timezone.to_string()),
                at: None,
            },
            action,
            delete_after_run: false,
        })?;

        let response = self
            .execute("create_job", || self.http.post(&url).json(&body))
            .await?;
        let created: CreateJobResponse = Self::decode(response).await?;
        debug!(id = %created.id, %name, %timezone, "created external job");
        Ok(created.id)
    }

    async fn patch_job(&self, external_job_ref: &str, timezone: &str) -> Result<(), GatewayError> {
        let url = self.job_url(external_job_ref);
        let body = PatchJobRequest {
            expr: None,
            tz: timezone,
        };

        self.execute("patch_job", || self.http.patch(&url).json(&body))
            .await?;
        debug!(id = %external_job_ref, %timezone, "patched external job");
        Ok(())
    }

    async fn reschedule_job(
        &self,
        external_job_ref: &str,
        schedule_expr: &str,
        timezone: &str,
    ) -> Result<(), GatewayError> {
        let url = self.job_url(external_job_ref);
        let body = PatchJobRequest {
            expr: Some(schedule_expr),
            tz: timezone,
        };

        self.execute("reschedule_job", || self.http.patch(&url).json(&body))
            .await?;
        debug!(id = %external_job_ref, expr = %schedule_expr, %timezone, "rescheduled external job");
        Ok(())
    }

    async fn run_now(
        &self,
        name: &str,
        action: &serde_json::Value,
    ) -> Result<String, GatewayError> {
        let url = self.jobs_url();
        let body = serde_json::to_value(CreateJobRequest {
            name,
            schedule: ExternalSchedule {
                at: Some("now".to_string()),
                ..Default::default()
            },
            action,
            delete_after_run: true,
        })?;

        let response = self
            .execute("run_now", || self.http.post(&url).json(&body))
            .await?;
        let created: CreateJobResponse = Self::decode(response).await?;
        debug!(id = %created.id, %name, "queued one-shot job");
        Ok(created.id)
    }

    async fn remove_job(&self, external_job_ref: &str) -> Result<(), GatewayError> {
        let url = self.job_url(external_job_ref);
        self.execute("remove_job", || self.http.delete(&url))
            .await?;
        debug!(id = %external_job_ref, "removed external job");
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<ExternalJob>, GatewayError> {
        let url = self.jobs_url();
        let response = self
            .execute("list_jobs", || self.http.get(&url))
            .await?;
        let listing: ListJobsResponse = Self::decode(response).await?;
        Ok(listing.jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(uri: String) -> GatewayClient {
        GatewayClient::new(uri, "test-token", Duration::from_secs(5))
    }

    #[test]
    fn test_client_creation_trims_slash() {
        let client = GatewayClient::new("https://cron.example.com/", "t", Duration::from_secs(1));
        assert_eq!(client.base_url(), "https://cron.example.com");
    }

    #[tokio::test]
    async fn test_create_job() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/cron/jobs"))
            .and(header("Authorization", "Bearer test-token"))
            .and(body_json(serde_json::json!({
                "name": "briefing",
                "schedule": {"expr": "30 6 * * *", "tz": "Europe/London"},
                "action": {"systemEvent": "morning briefing"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "ext-123"
            })))
            .mount(&mock_server)
            .await;

        let id = client(mock_server.uri())
            .create_job(
                "briefing",
                "30 6 * * *",
                "Europe/London",
                &serde_json::json!({"systemEvent": "morning briefing"}),
            )
            .await
            .unwrap();

        assert_eq!(id, "ext-123");
    }

    #[tokio::test]
    async fn test_patch_job() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/api/cron/jobs/ext-123"))
            .and(body_json(serde_json::json!({"tz": "Asia/Tokyo"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = client(mock_server.uri())
            .patch_job("ext-123", "Asia/Tokyo")
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_reschedule_job_sends_expr_and_tz() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/api/cron/jobs/ext-123"))
            .and(body_json(serde_json::json!({"expr": "0 7 * * 1-5", "tz": "Europe/London"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        client(mock_server.uri())
            .reschedule_job("ext-123", "0 7 * * 1-5", "Europe/London")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_now_sends_one_shot() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/cron/jobs"))
            .and(body_json(serde_json::json!({
                "name": "locron-geo-gym",
                "schedule": {"at": "now"},
                "action": {"systemEvent": "at the gym"},
                "deleteAfterRun": true
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "once-1"
            })))
            .mount(&mock_server)
            .await;

        let id = client(mock_server.uri())
            .run_now("locron-geo-gym", &serde_json::json!({"systemEvent": "at the gym"}))
            .await
            .unwrap();
        assert_eq!(id, "once-1");
    }

    #[tokio::test]
    async fn test_list_jobs() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/cron/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobs": [
                    {"id": "a", "name": "cleanup", "schedule": {"expr": "0 4 * * *", "tz": "America/New_York"}},
                    {"id": "b", "name": "briefing", "enabled": false}
                ]
            })))
            .mount(&mock_server)
            .await;

        let jobs = client(mock_server.uri()).list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].timezone(), Some("America/New_York"));
        assert!(!jobs[1].enabled);
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/api/cron/jobs/ext-1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = client(mock_server.uri())
            .patch_job("ext-1", "UTC")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn test_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/cron/jobs/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let err = client(mock_server.uri())
            .remove_job("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_server_error_retried_then_unreachable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/api/cron/jobs/ext-1"))
            .respond_with(ResponseTemplate::new(502))
            .expect(u64::from(MAX_ATTEMPTS))
            .mount(&mock_server)
            .await;

        let err = client(mock_server.uri())
            .patch_job("ext-1", "UTC")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_unreachable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/api/cron/jobs/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = GatewayClient::new(mock_server.uri(), "t", Duration::from_millis(100));
        let err = client.patch_job("slow", "UTC").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_rejected_request() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/cron/jobs"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad cron expression"))
            .mount(&mock_server)
            .await;

        let err = client(mock_server.uri())
            .create_job("x", "nope", "UTC", &serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            GatewayError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "bad cron expression");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }
}
