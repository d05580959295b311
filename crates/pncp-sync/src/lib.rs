//! Extraction, reconciliation and consolidation pipeline for PNCP contract data.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use pncp_adapters::{ContractSource, PncpApiSource};
use pncp_storage::{HttpFetcher, StorageAdapter};
use tracing::{info, warn};

pub mod columnar;
pub mod config;
pub mod consolidate;
pub mod enrich;
pub mod extraction_log;
pub mod filter;
pub mod reconcile;
pub mod scheduler;
pub mod schema;
pub mod state;

pub use config::{HarvestConfig, LogFormat, StorageBackend};
pub use consolidate::{consolidate_history, ConsolidationSummary};
pub use enrich::{DomainEnrichmentHook, EnrichmentHook, NoopEnrichmentHook};
pub use filter::{FilterEngine, FilterGroup, FilterReport, FilterStats};
pub use reconcile::{reconcile_partition, RepairOptions, RepairSummary};
pub use scheduler::{ExtractionMode, ExtractionScheduler, RunSummary, SchedulerOptions};
pub use schema::SchemaProfile;
pub use state::{ExtractionState, StateError, StateTracker};

pub const CRATE_NAME: &str = "pncp-sync";

/// Wires configuration, storage and the pipeline stages together.
pub struct Harvester {
    config: HarvestConfig,
    storage: Arc<dyn StorageAdapter>,
}

impl Harvester {
    pub async fn open(config: HarvestConfig) -> Result<Self> {
        let storage = config.open_storage().await?;
        info!(storage = %storage.describe(), "storage ready");
        Ok(Self { config, storage })
    }

    pub fn with_storage(config: HarvestConfig, storage: Arc<dyn StorageAdapter>) -> Self {
        Self { config, storage }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn StorageAdapter> {
        self.storage.clone()
    }

    pub fn filter_engine(&self) -> Result<FilterEngine> {
        if !self.config.filter.enabled {
            warn!("keyword filter disabled; every record is accepted");
            return Ok(FilterEngine::disabled());
        }
        let groups = filter::load_groups(&self.config.filter.path)?;
        let engine = FilterEngine::new(&groups, self.config.filter.match_group_names);
        info!(
            groups = engine.group_count(),
            path = %self.config.filter.path.display(),
            "keyword filter loaded"
        );
        Ok(engine)
    }

    pub async fn load_state(&self, rebuild_from_partitions: bool) -> Result<StateTracker> {
        let tracker = StateTracker::load(
            self.storage.clone(),
            self.config.state_options(rebuild_from_partitions),
        )
        .await?;
        Ok(tracker)
    }

    pub fn api_source(&self) -> Result<Arc<dyn ContractSource>> {
        let http = HttpFetcher::new(self.config.http_client()).context("building http client")?;
        Ok(Arc::new(PncpApiSource::new(Arc::new(http), self.config.api())))
    }

    pub fn scheduler(&self, source: Arc<dyn ContractSource>) -> Result<ExtractionScheduler> {
        let options = SchedulerOptions {
            max_workers: self.config.extraction.max_workers,
            raw_prefix: self.config.storage.raw_prefix.clone(),
            extraction_log_path: Some(self.config.storage.extraction_log_path.clone()),
            keep_rejected: self.config.filter.keep_rejected,
        };
        Ok(ExtractionScheduler::new(
            source,
            self.storage.clone(),
            Arc::new(DomainEnrichmentHook),
            Arc::new(self.filter_engine()?),
            options,
        ))
    }

    /// Runs one extraction pass over `source`; state is loaded before and owned throughout.
    pub async fn extract(
        &self,
        source: Arc<dyn ContractSource>,
        mode: ExtractionMode,
        today: NaiveDate,
        rebuild_state: bool,
    ) -> Result<RunSummary> {
        let scheduler = self.scheduler(source)?;
        let mut tracker = self.load_state(rebuild_state).await?;
        scheduler.run(&mut tracker, mode, today).await
    }

    pub async fn repair(&self, options: &RepairOptions) -> Result<RepairSummary> {
        reconcile_partition(self.storage.clone(), options).await
    }

    pub async fn consolidate(&self) -> Result<ConsolidationSummary> {
        consolidate_history(
            self.storage.as_ref(),
            &self.config.storage.raw_prefix,
            &self.config.storage.consolidated_path,
        )
        .await
    }
}
