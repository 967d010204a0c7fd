use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bulkport_core::{GroupFeatures, SupportedTypes};
use bulkport_db_postgres::PostgresConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Static bearer tokens
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub export: ExportConfig,
    /// Upstream data source probed for the transaction time watermark
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if let Some(base) = &self.server.base_url {
            url::Url::parse(base).map_err(|e| format!("server.base_url is invalid: {e}"))?;
        }

        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }

        if self.storage.backend == StorageBackend::Postgres {
            match &self.storage.postgres {
                Some(pg) if !pg.url.trim().is_empty() => {}
                _ => return Err("storage.backend=postgres requires storage.postgres.url".into()),
            }
        }

        for (i, token) in self.auth.tokens.iter().enumerate() {
            if token.token.is_empty() || token.tenant_id.is_empty() {
                return Err(format!("auth.tokens[{i}] requires token and tenant_id"));
            }
        }

        if self.export.versions.is_empty() {
            return Err("export.versions must define at least one API version".into());
        }
        for (version, types) in &self.export.versions {
            if bulkport_core::api_version(&format!("/api/{version}/")).is_none() {
                return Err(format!("export.versions key {version:?} must look like v1, v2, ..."));
            }
            if types.is_empty() {
                return Err(format!("export.versions.{version} must list resource types"));
            }
        }
        check_hours("export.job_timeout_hours", self.export.job_timeout_hours)?;
        check_hours("export.retention_hours", self.export.retention_hours)?;

        if let Some(base) = &self.upstream.base_url {
            url::Url::parse(base).map_err(|e| format!("upstream.base_url is invalid: {e}"))?;
        }
        if self.upstream.timeout_ms == 0 {
            return Err("upstream.timeout_ms must be > 0".into());
        }

        let s = &self.sweeper;
        if s.interval_secs == 0 {
            return Err("sweeper.interval_secs must be > 0".into());
        }
        check_hours("sweeper.archive_threshold_hours", s.archive_threshold_hours)?;
        check_hours("sweeper.expire_threshold_hours", s.expire_threshold_hours)?;
        check_hours("sweeper.failed_threshold_hours", s.failed_threshold_hours)?;
        check_hours("sweeper.cancelled_threshold_hours", s.cancelled_threshold_hours)?;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public origin used in `Content-Location` and manifest URLs.
    /// If not set, it is derived from the request's `Host` header.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    3000
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<StaticToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub tenant_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Deployment tier; admission throttling is skipped in `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Local,
    Dev,
    Test,
    Prod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Throttle every tenant.
    #[serde(default = "default_true")]
    pub all: bool,
    /// Tenants throttled when `all` is off.
    #[serde(default)]
    pub tenants: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            all: true,
            tenants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub tier: Tier,
    /// Supported resource types per API version
    #[serde(default = "default_versions")]
    pub versions: BTreeMap<String, Vec<String>>,
    /// Live jobs older than this no longer block new requests.
    #[serde(default = "default_24")]
    pub job_timeout_hours: u64,
    /// How long a completed job's files are served.
    #[serde(default = "default_24")]
    pub retention_hours: u64,
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub enable_new_group: bool,
    #[serde(default = "default_true")]
    pub enable_runout: bool,
    #[serde(default = "default_payload_dir")]
    pub payload_dir: PathBuf,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

fn default_true() -> bool {
    true
}
fn default_24() -> u64 {
    24
}
fn default_retry_after_secs() -> u64 {
    1
}
fn default_payload_dir() -> PathBuf {
    PathBuf::from("data/payload")
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("data/archive")
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("data/staging")
}

fn default_versions() -> BTreeMap<String, Vec<String>> {
    let v1: Vec<String> = ["Patient", "Coverage", "ExplanationOfBenefit"]
        .into_iter()
        .map(String::from)
        .collect();
    let mut v2 = v1.clone();
    v2.extend(["Claim", "ClaimResponse"].into_iter().map(String::from));

    BTreeMap::from([("v1".to_string(), v1), ("v2".to_string(), v2)])
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            tier: Tier::default(),
            versions: default_versions(),
            job_timeout_hours: default_24(),
            retention_hours: default_24(),
            retry_after_secs: default_retry_after_secs(),
            rate_limit: RateLimitConfig::default(),
            enable_new_group: false,
            enable_runout: true,
            payload_dir: default_payload_dir(),
            archive_dir: default_archive_dir(),
            staging_dir: default_staging_dir(),
        }
    }
}

impl ExportConfig {
    pub fn supported_types(&self) -> SupportedTypes {
        SupportedTypes::from(self.versions.clone())
    }

    pub fn group_features(&self) -> GroupFeatures {
        GroupFeatures {
            enable_new_group: self.enable_new_group,
            enable_runout: self.enable_runout,
        }
    }

    pub fn job_timeout(&self) -> time::Duration {
        hours(self.job_timeout_hours)
    }

    pub fn retention(&self) -> time::Duration {
        hours(self.retention_hours)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// FHIR base URL of the upstream data source; the local clock is used
    /// as the watermark when unset.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_upstream_timeout_ms() -> u64 {
    10_000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_24")]
    pub archive_threshold_hours: u64,
    #[serde(default = "default_24")]
    pub expire_threshold_hours: u64,
    #[serde(default = "default_24")]
    pub failed_threshold_hours: u64,
    #[serde(default = "default_24")]
    pub cancelled_threshold_hours: u64,
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
            archive_threshold_hours: default_24(),
            expire_threshold_hours: default_24(),
            failed_threshold_hours: default_24(),
            cancelled_threshold_hours: default_24(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Upper bound for every hour-valued setting (ten years).
pub const MAX_HOURS: u64 = 87_600;

fn check_hours(key: &str, value: u64) -> Result<(), String> {
    if value == 0 || value > MAX_HOURS {
        return Err(format!("{key} must be between 1 and {MAX_HOURS}"));
    }
    Ok(())
}

pub(crate) fn hours(h: u64) -> time::Duration {
    time::Duration::hours(i64::try_from(h).unwrap_or(i64::MAX / 3600))
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "bulkport.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            return Err(format!("config file {} not found", pathbuf.display()));
        }
        // Environment variable overrides, e.g., BULKPORT__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("BULKPORT")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
