//! Dawarich (self-hosted location history) provider.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{Fetch, LocationProvider, LocationSample, ProviderError};

/// Attempts per fetch: initial + 2 retries.
const MAX_ATTEMPTS: u32 = 3;

/// How far back to ask for points.
const LOOKBACK_HOURS: i64 = 24;

/// Fetches the newest GPS point from a Dawarich instance.
pub struct DawarichProvider {
    http: Client,
    api_url: String,
    api_key: String,
}

impl DawarichProvider {
    /// Create a provider for the given instance URL.
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn fetch_once(&self) -> Result<Fetch, ProviderError> {
        let url = format!("{}/api/v1/points", self.api_url);
        let end = Utc::now();
        let start = end - chrono::Duration::hours(LOOKBACK_HOURS);

        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .query(&[
                ("start_at", start.to_rfc3339()),
                ("end_at", end.to_rfc3339()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Auth(format!("points request failed ({status})")));
        }
        if status.is_server_error() {
            return Err(ProviderError::Unavailable(format!(
                "points request failed ({status})"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "points request failed ({status}): {text}"
            )));
        }

        let points: Vec<DawarichPoint> = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(newest_sample(&points).map_or(Fetch::NoNewData, Fetch::Sample))
    }
}

#[async_trait]
impl LocationProvider for DawarichProvider {
    fn name(&self) -> &'static str {
        "dawarich"
    }

    async fn fetch(&self) -> Result<Fetch, ProviderError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once().await {
                Ok(fetch) => return Ok(fetch),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let backoff_ms = 500 * (1 << (attempt - 1)); // 500ms, 1s
                    warn!(
                        attempt,
                        backoff_ms,
                        error = %e,
                        "transient error fetching location, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(ProviderError::Unavailable(e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A point as Dawarich returns it. Coordinates may be strings or numbers.
#[derive(Debug, Deserialize)]
struct DawarichPoint {
    latitude: Coordinate,
    longitude: Coordinate,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Coordinate {
    Number(f64),
    Text(String),
}

impl Coordinate {
    fn value(&self) -> Option<f64> {
        match self {
            Coordinate::Number(n) => Some(*n),
            Coordinate::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Pick the newest valid point; without timestamps, the first one listed.
fn newest_sample(points: &[DawarichPoint]) -> Option<LocationSample> {
    let samples = points.iter().filter_map(|p| {
        let latitude = p.latitude.value()?;
        let longitude = p.longitude.value()?;
        let observed_at = p
            .timestamp
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now);
        let sample = LocationSample::new(latitude, longitude, observed_at);
        sample.is_valid().then_some((p.timestamp, sample))
    });

    let mut best: Option<(Option<i64>, LocationSample)> = None;
    for (ts, sample) in samples {
        best = match best {
            None => Some((ts, sample)),
            Some((Some(best_ts), _)) if ts.is_some_and(|t| t > best_ts) => Some((ts, sample)),
            Some((None, _)) if ts.is_some() => Some((ts, sample)),
            keep => keep,
        };
    }

    let (_, sample) = best?;
    debug!(
        latitude = sample.latitude,
        longitude = sample.longitude,
        observed_at = %sample.observed_at,
        "dawarich returned point"
    );
    Some(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(uri: String) -> DawarichProvider {
        DawarichProvider::new(uri, "test-key", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_fetch_newest_point() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/points"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"latitude": "40.7580", "longitude": "-73.9855", "timestamp": 1_700_000_000},
                {"latitude": "51.5074", "longitude": "-0.1278", "timestamp": 1_700_000_600},
            ])))
            .mount(&mock_server)
            .await;

        let result = provider(mock_server.uri()).fetch().await.unwrap();
        match result {
            Fetch::Sample(s) => {
                assert_eq!(s.latitude, 51.5074);
                assert_eq!(s.observed_at.timestamp(), 1_700_000_600);
            }
            Fetch::NoNewData => panic!("expected a sample"),
        }
    }

    #[tokio::test]
    async fn test_numeric_coordinates_without_timestamp() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/points"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"latitude": 35.6762, "longitude": 139.6503},
                {"latitude": 47.3769, "longitude": 8.5417},
            ])))
            .mount(&mock_server)
            .await;

        let result = provider(mock_server.uri()).fetch().await.unwrap();
        match result {
            Fetch::Sample(s) => assert_eq!(s.latitude, 35.6762),
            Fetch::NoNewData => panic!("expected a sample"),
        }
    }

    #[tokio::test]
    async fn test_empty_list_is_no_new_data() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/points"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&mock_server)
            .await;

        let result = provider(mock_server.uri()).fetch().await.unwrap();
        assert_eq!(result, Fetch::NoNewData);
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/points"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = provider(mock_server.uri()).fetch().await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[tokio::test]
    async fn test_server_error_retried_then_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/points"))
            .respond_with(ResponseTemplate::new(503))
            .expect(u64::from(MAX_ATTEMPTS))
            .mount(&mock_server)
            .await;

        let err = provider(mock_server.uri()).fetch().await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_timeout_retried_then_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/points"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let provider = DawarichProvider::new(mock_server.uri(), "k", Duration::from_millis(100));
        let err = provider.fetch().await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unbuildable_request_not_retried() {
        let started = std::time::Instant::now();
        let err = provider("not a url".into()).fetch().await.unwrap_err();

        assert!(matches!(err, ProviderError::Http(_)), "{err:?}");
        assert!(!err.is_transient());
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_invalid_points_skipped() {
        let points: Vec<DawarichPoint> = serde_json::from_value(serde_json::json!([
            {"latitude": "not-a-number", "longitude": "1.0", "timestamp": 10},
            {"latitude": "95.0", "longitude": "1.0", "timestamp": 20},
            {"latitude": "10.0", "longitude": "1.0", "timestamp": 5},
        ]))
        .unwrap();

        let sample = newest_sample(&points).unwrap();
        assert_eq!(sample.latitude, 10.0);
    }
}
