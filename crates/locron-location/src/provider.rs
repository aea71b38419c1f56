//! Pluggable location sources.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::{DawarichProvider, LocationSample, ProviderError};

/// Outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    /// The most recent point the provider knows about.
    Sample(LocationSample),
    /// Nothing newer than what we already have. Not an error.
    NoNewData,
}

/// A source of GPS fixes, polled once per tick.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Fetch the most recent known point.
    async fn fetch(&self) -> Result<Fetch, ProviderError>;
}

/// Which provider implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// Self-hosted Dawarich location history.
    #[default]
    Dawarich,
    /// A fixed point from configuration.
    Static,
    /// Never returns data; timezone always falls back.
    None,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dawarich" => Ok(ProviderKind::Dawarich),
            "static" => Ok(ProviderKind::Static),
            "none" | "off" => Ok(ProviderKind::None),
            other => Err(format!(
                "unknown location provider '{other}', expected dawarich/static/none"
            )),
        }
    }
}

/// Everything needed to construct a provider at startup.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub api_url: String,
    pub api_key: Option<String>,
    pub static_point: Option<(f64, f64)>,
    pub timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Dawarich,
            api_url: "http://localhost:3000".to_string(),
            api_key: None,
            static_point: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Build the configured provider.
pub fn build_provider(
    settings: &ProviderSettings,
) -> Result<Box<dyn LocationProvider>, ProviderError> {
    match settings.kind {
        ProviderKind::Dawarich => {
            let api_key = settings.api_key.clone().unwrap_or_default();
            Ok(Box::new(DawarichProvider::new(
                settings.api_url.clone(),
                api_key,
                settings.timeout,
            )))
        }
        ProviderKind::Static => {
            let (latitude, longitude) = settings.static_point.ok_or_else(|| {
                ProviderError::Config("static provider requires a latitude and longitude".into())
            })?;
            let provider = StaticProvider::new(latitude, longitude);
            if !provider.point().is_valid() {
                return Err(ProviderError::Config(format!(
                    "static point ({latitude}, {longitude}) is out of range"
                )));
            }
            Ok(Box::new(provider))
        }
        ProviderKind::None => Ok(Box::new(NullProvider)),
    }
}

/// Always reports the same point, observed "now".
#[derive(Debug, Clone)]
pub struct StaticProvider {
    latitude: f64,
    longitude: f64,
}

impl StaticProvider {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    fn point(&self) -> LocationSample {
        LocationSample::new(self.latitude, self.longitude, Utc::now())
    }
}

#[async_trait]
impl LocationProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self) -> Result<Fetch, ProviderError> {
        Ok(Fetch::Sample(self.point()))
    }
}

/// Provider that never has data.
#[derive(Debug, Clone, Copy)]
pub struct NullProvider;

#[async_trait]
impl LocationProvider for NullProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn fetch(&self) -> Result<Fetch, ProviderError> {
        Ok(Fetch::NoNewData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("dawarich".parse::<ProviderKind>(), Ok(ProviderKind::Dawarich));
        assert_eq!("STATIC".parse::<ProviderKind>(), Ok(ProviderKind::Static));
        assert_eq!("none".parse::<ProviderKind>(), Ok(ProviderKind::None));
        assert!("gpsd".parse::<ProviderKind>().is_err());
    }

    #[tokio::test]
    async fn test_static_provider() {
        let settings = ProviderSettings {
            kind: ProviderKind::Static,
            static_point: Some((51.5074, -0.1278)),
            ..Default::default()
        };
        let provider = build_provider(&settings).unwrap();
        assert_eq!(provider.name(), "static");

        match provider.fetch().await.unwrap() {
            Fetch::Sample(s) => {
                assert_eq!(s.latitude, 51.5074);
                assert_eq!(s.longitude, -0.1278);
            }
            Fetch::NoNewData => panic!("expected a sample"),
        }
    }

    #[test]
    fn test_static_provider_requires_point() {
        let settings = ProviderSettings {
            kind: ProviderKind::Static,
            ..Default::default()
        };
        assert!(matches!(
            build_provider(&settings),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn test_static_provider_rejects_out_of_range() {
        let settings = ProviderSettings {
            kind: ProviderKind::Static,
            static_point: Some((123.0, 0.0)),
            ..Default::default()
        };
        assert!(build_provider(&settings).is_err());
    }

    #[tokio::test]
    async fn test_null_provider() {
        let provider = NullProvider;
        assert_eq!(provider.fetch().await.unwrap(), Fetch::NoNewData);
    }
}
