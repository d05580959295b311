//! Harvester configuration: a YAML file with defaults, then `PNCP_*` environment overrides.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use pncp_adapters::{PncpApiConfig, DEFAULT_BASE_URL, DEFAULT_ENDPOINT, DEFAULT_PAGE_SIZE};
use pncp_storage::{BackoffPolicy, HttpClientConfig, LocalStorage, StorageAdapter};
use serde::{Deserialize, Serialize};

use crate::reconcile::RepairOptions;
use crate::state::StateOptions;

pub const DEFAULT_CONFIG_FILE: &str = "pncp.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub base_url: String,
    pub endpoint: String,
    pub page_size: u32,
    /// Empty means every active modality from the domain tables.
    pub modality_codes: Vec<i64>,
    pub request_delay_ms: u64,
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub user_agent: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            modality_codes: Vec::new(),
            request_delay_ms: 500,
            timeout_secs: 120,
            concurrency: 3,
            user_agent: Some(format!("pncp-harvester/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            jitter_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Root directory for the local backend.
    pub root: PathBuf,
    pub bucket: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
    /// Key prefix inside the bucket.
    pub key_prefix: Option<String>,
    pub raw_prefix: String,
    pub consolidated_path: String,
    pub extraction_log_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: PathBuf::from("./data"),
            bucket: None,
            region: "us-east-1".to_string(),
            endpoint: None,
            key_prefix: None,
            raw_prefix: "raw-data".to_string(),
            consolidated_path: "consolidated/contracts_full_history.parquet".to_string(),
            extraction_log_path: "metadata/extraction_log.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    pub start_date: NaiveDate,
    pub max_workers: usize,
    pub state_path: String,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default(),
            max_workers: 3,
            state_path: "state.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub enabled: bool,
    pub path: PathBuf,
    /// Write rejected records too, flagged with `filter_applied = false`.
    pub keep_rejected: bool,
    pub match_group_names: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("filtros.yaml"),
            keep_rejected: false,
            match_group_names: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub sample_size: Option<usize>,
    pub reference_file: Option<String>,
    pub backup_prefix: String,
    pub concurrency: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            sample_size: None,
            reference_file: None,
            backup_prefix: "backup".to_string(),
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub source: SourceSettings,
    pub retry: RetrySettings,
    pub storage: StorageSettings,
    pub extraction: ExtractionSettings,
    pub filter: FilterSettings,
    pub reconcile: ReconcileSettings,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            source: SourceSettings::default(),
            retry: RetrySettings::default(),
            storage: StorageSettings::default(),
            extraction: ExtractionSettings::default(),
            filter: FilterSettings::default(),
            reconcile: ReconcileSettings::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl HarvestConfig {
    /// Reads `path`, or `pncp.yaml` when present, then applies the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Overrides fields from `lookup`, which maps variable names to values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("PNCP_DATA_DIR") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("PNCP_STATE_PATH") {
            self.extraction.state_path = v;
        }
        if let Some(v) = lookup("PNCP_FILTERS_PATH") {
            self.filter.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PNCP_BASE_URL") {
            self.source.base_url = v;
        }
        if let Some(v) = lookup("PNCP_START_DATE") {
            self.extraction.start_date = NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
                .with_context(|| format!("PNCP_START_DATE={v} is not YYYY-MM-DD"))?;
        }
        if let Some(v) = lookup("PNCP_MAX_WORKERS") {
            self.extraction.max_workers = v
                .trim()
                .parse()
                .with_context(|| format!("PNCP_MAX_WORKERS={v} is not a number"))?;
        }
        if let Some(v) = lookup("PNCP_HTTP_TIMEOUT_SECS") {
            self.source.timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("PNCP_HTTP_TIMEOUT_SECS={v} is not a number"))?;
        }
        if let Some(v) = lookup("PNCP_USER_AGENT") {
            self.source.user_agent = Some(v);
        }
        if let Some(v) = lookup("PNCP_STORAGE") {
            self.storage.backend = match v.trim().to_ascii_lowercase().as_str() {
                "local" => StorageBackend::Local,
                "s3" => StorageBackend::S3,
                other => bail!("PNCP_STORAGE={other} is not one of local, s3"),
            };
        }
        if let Some(v) = lookup("PNCP_S3_BUCKET") {
            self.storage.bucket = Some(v);
        }
        if let Some(v) = lookup("PNCP_S3_REGION") {
            self.storage.region = v;
        }
        if let Some(v) = lookup("PNCP_S3_ENDPOINT") {
            self.storage.endpoint = Some(v);
        }
        if let Some(v) = lookup("PNCP_LOG_LEVEL") {
            self.log_level = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.extraction.max_workers == 0 {
            bail!("extraction.max_workers must be at least 1");
        }
        if self.source.page_size == 0 {
            bail!("source.page_size must be at least 1");
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_none() {
            bail!("storage.backend is s3 but no bucket is configured");
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: Duration::from_millis(self.retry.jitter_ms),
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.source.timeout_secs),
            user_agent: self.source.user_agent.clone(),
            concurrency: self.source.concurrency.max(1),
            backoff: self.backoff(),
            request_interval: (self.source.request_delay_ms > 0)
                .then(|| Duration::from_millis(self.source.request_delay_ms)),
            use_system_proxy: true,
        }
    }

    pub fn api(&self) -> PncpApiConfig {
        let mut api = PncpApiConfig {
            base_url: self.source.base_url.clone(),
            endpoint: self.source.endpoint.clone(),
            page_size: self.source.page_size,
            ..PncpApiConfig::default()
        };
        if !self.source.modality_codes.is_empty() {
            api.modality_codes = self.source.modality_codes.clone();
        }
        api
    }

    pub fn state_options(&self, rebuild_from_partitions: bool) -> StateOptions {
        StateOptions {
            path: self.extraction.state_path.clone(),
            start_date: self.extraction.start_date,
            partition_prefix: self.storage.raw_prefix.clone(),
            rebuild_from_partitions,
        }
    }

    pub fn repair_options(&self) -> RepairOptions {
        RepairOptions {
            prefix: self.storage.raw_prefix.clone(),
            backup_prefix: self.reconcile.backup_prefix.clone(),
            sample_size: self.reconcile.sample_size,
            reference_file: self.reconcile.reference_file.clone(),
            concurrency: self.reconcile.concurrency.max(1),
        }
    }

    pub async fn open_storage(&self) -> Result<Arc<dyn StorageAdapter>> {
        match self.storage.backend {
            StorageBackend::Local => {
                std::fs::create_dir_all(&self.storage.root).with_context(|| {
                    format!("creating data dir {}", self.storage.root.display())
                })?;
                Ok(Arc::new(LocalStorage::new(&self.storage.root)))
            }
            StorageBackend::S3 => self.open_s3().await,
        }
    }

    #[cfg(feature = "s3")]
    async fn open_s3(&self) -> Result<Arc<dyn StorageAdapter>> {
        let Some(bucket) = self.storage.bucket.clone() else {
            bail!("storage.backend is s3 but no bucket is configured");
        };
        let config = pncp_storage::S3StorageConfig {
            bucket,
            region: self.storage.region.clone(),
            prefix: self.storage.key_prefix.clone(),
            endpoint_url: self.storage.endpoint.clone(),
            force_path_style: self.storage.endpoint.is_some(),
        };
        Ok(Arc::new(pncp_storage::S3Storage::new(&config).await))
    }

    #[cfg(not(feature = "s3"))]
    async fn open_s3(&self) -> Result<Arc<dyn StorageAdapter>> {
        bail!("storage.backend is s3 but this build was compiled without the `s3` feature")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let config = HarvestConfig::from_yaml("").unwrap();
        assert_eq!(config, HarvestConfig::default());
        assert_eq!(config.storage.raw_prefix, "raw-data");
        assert_eq!(config.extraction.max_workers, 3);
        assert!(config.filter.enabled);
        assert!(!config.filter.keep_rejected);
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_fields() {
        let config = HarvestConfig::from_yaml(
            r#"
extraction:
  start_date: 2025-08-01
  max_workers: 5
filter:
  keep_rejected: true
log_format: json
"#,
        )
        .unwrap();
        assert_eq!(
            config.extraction.start_date,
            NaiveDate::from_ymd_opt(2025, 8, 1).unwrap()
        );
        assert_eq!(config.extraction.max_workers, 5);
        assert_eq!(config.extraction.state_path, "state.json");
        assert!(config.filter.keep_rejected);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PNCP_DATA_DIR", "/tmp/pncp"),
            ("PNCP_START_DATE", "2025-08-16"),
            ("PNCP_MAX_WORKERS", "8"),
            ("PNCP_STORAGE", "S3"),
            ("PNCP_S3_BUCKET", "contracts"),
            ("PNCP_LOG_LEVEL", "debug"),
        ]);
        let mut config = HarvestConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/tmp/pncp"));
        assert_eq!(config.extraction.max_workers, 8);
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.bucket.as_deref(), Some("contracts"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn invalid_environment_values_are_rejected() {
        let mut config = HarvestConfig::default();
        let err = config
            .apply_env(|key| (key == "PNCP_START_DATE").then(|| "16/08/2025".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PNCP_START_DATE"));

        let mut config = HarvestConfig::default();
        assert!(config
            .apply_env(|key| (key == "PNCP_STORAGE").then(|| "s3".to_string()))
            .is_err());
    }

    #[test]
    fn derived_client_settings_follow_config() {
        let mut config = HarvestConfig::default();
        config.source.modality_codes = vec![6];
        config.source.request_delay_ms = 0;
        let http = config.http_client();
        assert_eq!(http.backoff.max_retries, 5);
        assert_eq!(http.backoff.base_delay, Duration::from_secs(2));
        assert!(http.request_interval.is_none());
        assert_eq!(config.api().modality_codes, vec![6]);
        assert!(!HarvestConfig::default().api().modality_codes.is_empty());
    }
}
