//! Transaction-time watermark probes.
//!
//! At admission the orchestrator asks the upstream data source for the
//! point in time its data is current as of. [`UpstreamWatermark`] requests a
//! single placeholder patient and reads the returned Bundle's
//! `meta.lastUpdated`; [`ClockWatermark`] stands in when no upstream is
//! configured.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use url::Url;

use bulkport_core::parse_instant;

/// Patient id requested purely to obtain Bundle metadata.
const PROBE_PATIENT_ID: &str = "FAKE_PATIENT";

/// Errors that can occur while probing the watermark.
#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: status {0}")]
    Http(u16),

    #[error("Failed to parse upstream response: {0}")]
    Parse(String),

    #[error("Upstream response has no meta.lastUpdated")]
    MissingLastUpdated,

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait WatermarkSource: Send + Sync {
    async fn probe(&self, tenant_id: &str) -> Result<OffsetDateTime, WatermarkError>;
}

/// Uses the local clock as the watermark.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockWatermark;

#[async_trait]
impl WatermarkSource for ClockWatermark {
    async fn probe(&self, _tenant_id: &str) -> Result<OffsetDateTime, WatermarkError> {
        Ok(OffsetDateTime::now_utc())
    }
}

#[derive(Debug, Deserialize)]
struct BundleMeta {
    #[serde(rename = "lastUpdated")]
    last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Bundle {
    meta: Option<BundleMeta>,
}

/// Probes a FHIR upstream for its `meta.lastUpdated`.
#[derive(Debug, Clone)]
pub struct UpstreamWatermark {
    client: reqwest::Client,
    patient_url: Url,
}

impl UpstreamWatermark {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, WatermarkError> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .map_err(|e| WatermarkError::InvalidUrl(e.to_string()))?;
        let patient_url = base
            .join("Patient")
            .map_err(|e| WatermarkError::InvalidUrl(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WatermarkError::Network(e.to_string()))?;

        Ok(Self {
            client,
            patient_url,
        })
    }
}

#[async_trait]
impl WatermarkSource for UpstreamWatermark {
    #[tracing::instrument(skip(self), fields(url = %self.patient_url))]
    async fn probe(&self, tenant_id: &str) -> Result<OffsetDateTime, WatermarkError> {
        let response = self
            .client
            .get(self.patient_url.clone())
            .query(&[("_id", PROBE_PATIENT_ID)])
            .header("Accept", "application/fhir+json")
            .header("X-Tenant-Id", tenant_id)
            .send()
            .await
            .map_err(|e| WatermarkError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WatermarkError::Http(status.as_u16()));
        }

        let bundle: Bundle = response
            .json()
            .await
            .map_err(|e| WatermarkError::Parse(e.to_string()))?;

        let last_updated = bundle
            .meta
            .and_then(|m| m.last_updated)
            .ok_or(WatermarkError::MissingLastUpdated)?;

        parse_instant(&last_updated).map_err(|e| WatermarkError::Parse(e.to_string()))
    }
}
