//! Upstream source contract plus the PNCP API and fixture implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use pncp_core::SourceRecord;
use pncp_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pncp-adapters";

pub const DEFAULT_BASE_URL: &str = "https://pncp.gov.br/api/consulta/v1";
pub const DEFAULT_ENDPOINT: &str = "contratacoes/publicacao";
pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Error)]
pub enum SourceError {
    /// Network failure or retry exhaustion; the date stays pending.
    #[error("transient source failure for {date}: {message}")]
    Transient { date: NaiveDate, message: String },
    /// The source answered with something that cannot be interpreted.
    #[error("invalid source payload for {date}: {message}")]
    Invalid { date: NaiveDate, message: String },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }

    fn from_fetch(date: NaiveDate, err: FetchError) -> Self {
        if err.is_transient() {
            SourceError::Transient {
                date,
                message: err.to_string(),
            }
        } else {
            SourceError::Invalid {
                date,
                message: err.to_string(),
            }
        }
    }
}

/// Supplier of every contract published on one calendar day.
#[async_trait]
pub trait ContractSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_day(&self, date: NaiveDate) -> Result<Vec<SourceRecord>, SourceError>;
}

/// One page of the `contratacoes/publicacao` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPage {
    #[serde(default)]
    pub data: Vec<JsonValue>,
    #[serde(default)]
    pub total_registros: Option<u64>,
    #[serde(default)]
    pub total_paginas: Option<u32>,
    #[serde(default)]
    pub numero_pagina: Option<u32>,
    #[serde(default)]
    pub empty: Option<bool>,
}

/// Accepts either an API page envelope or a bare array of records.
pub fn parse_page(value: JsonValue) -> Result<ApiPage, String> {
    match value {
        JsonValue::Array(data) => Ok(ApiPage {
            total_registros: Some(data.len() as u64),
            total_paginas: Some(1),
            numero_pagina: Some(1),
            empty: Some(data.is_empty()),
            data,
        }),
        JsonValue::Object(_) => serde_json::from_value(value).map_err(|err| err.to_string()),
        other => Err(format!("unexpected page payload: {other}")),
    }
}

/// Boundary check turning upstream JSON into typed or raw records.
pub fn validate_record(value: JsonValue) -> SourceRecord {
    SourceRecord::validate(value)
}

fn validate_all(values: Vec<JsonValue>) -> Vec<SourceRecord> {
    values.into_iter().map(validate_record).collect()
}

#[derive(Debug, Clone)]
pub struct PncpApiConfig {
    pub base_url: String,
    pub endpoint: String,
    pub page_size: u32,
    pub modality_codes: Vec<i64>,
}

impl Default for PncpApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            modality_codes: pncp_core::domain::active_modalities(),
        }
    }
}

impl PncpApiConfig {
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint.trim_start_matches('/')
        )
    }
}

/// Paged HTTP client for the public PNCP consultation API.
#[derive(Debug, Clone)]
pub struct PncpApiSource {
    http: Arc<HttpFetcher>,
    config: Arc<PncpApiConfig>,
}

impl PncpApiSource {
    pub fn new(http: Arc<HttpFetcher>, config: PncpApiConfig) -> Self {
        Self {
            http,
            config: Arc::new(config),
        }
    }

    async fn fetch_page(
        http: &HttpFetcher,
        config: &PncpApiConfig,
        date: NaiveDate,
        modality: i64,
        page: u32,
    ) -> Result<ApiPage, SourceError> {
        let stamp = date.format("%Y%m%d").to_string();
        let query = [
            ("dataInicial", stamp.clone()),
            ("dataFinal", stamp),
            ("codigoModalidadeContratacao", modality.to_string()),
            ("pagina", page.to_string()),
            ("tamanhoPagina", config.page_size.to_string()),
        ];
        let body = http
            .fetch_json(&config.url(), &query)
            .await
            .map_err(|err| SourceError::from_fetch(date, err))?;
        match body {
            None => Ok(ApiPage::default()),
            Some(value) => parse_page(value).map_err(|message| SourceError::Invalid { date, message }),
        }
    }

    async fn fetch_modality(
        &self,
        date: NaiveDate,
        modality: i64,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let first = Self::fetch_page(&self.http, &self.config, date, modality, 1).await?;
        let total_pages = first.total_paginas.unwrap_or(1).max(1);
        debug!(
            %date,
            modality,
            total_pages,
            total_records = first.total_registros.unwrap_or(0),
            "fetched first page"
        );

        let mut pages = vec![(1u32, first.data)];
        if total_pages > 1 {
            // concurrency is bounded by the fetcher's semaphore
            let mut tasks = JoinSet::new();
            for page in 2..=total_pages {
                let http = Arc::clone(&self.http);
                let config = Arc::clone(&self.config);
                tasks.spawn(async move {
                    let result = Self::fetch_page(&http, &config, date, modality, page).await;
                    (page, result)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let (page, result) = joined.map_err(|err| SourceError::Transient {
                    date,
                    message: format!("page task failed: {err}"),
                })?;
                pages.push((page, result?.data));
            }
        }

        pages.sort_by_key(|(page, _)| *page);
        Ok(pages.into_iter().flat_map(|(_, data)| data).collect())
    }
}

#[async_trait]
impl ContractSource for PncpApiSource {
    fn source_id(&self) -> &'static str {
        "pncp-api"
    }

    async fn fetch_day(&self, date: NaiveDate) -> Result<Vec<SourceRecord>, SourceError> {
        let mut values = Vec::new();
        for &modality in &self.config.modality_codes {
            let data = self.fetch_modality(date, modality).await?;
            if !data.is_empty() {
                info!(%date, modality, records = data.len(), "modality fetched");
            }
            values.extend(data);
        }
        Ok(validate_all(values))
    }
}

/// Reads one JSON file per day from a directory, named `YYYY-MM-DD.json`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    dir: PathBuf,
}

impl FixtureSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.json", date.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl ContractSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_day(&self, date: NaiveDate) -> Result<Vec<SourceRecord>, SourceError> {
        let path = self.path_for(date);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(%date, path = %path.display(), "no fixture for date");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(SourceError::Transient {
                    date,
                    message: format!("reading {}: {err}", path.display()),
                })
            }
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let value: JsonValue = serde_json::from_slice(&data).map_err(|err| SourceError::Invalid {
            date,
            message: format!("parsing {}: {err}", path.display()),
        })?;
        let page = parse_page(value).map_err(|message| SourceError::Invalid { date, message })?;
        let records = validate_all(page.data);
        let raw = records
            .iter()
            .filter(|r| matches!(r, SourceRecord::Raw { .. }))
            .count();
        if raw > 0 {
            warn!(%date, raw, "fixture contains records that failed validation");
        }
        Ok(records)
    }
}
