//! Per-date extraction units run on a bounded worker pool; the orchestrator owns state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use pncp_adapters::ContractSource;
use pncp_core::{partition_path, ContractRecord, SourceRecord};
use pncp_storage::{sha256_hex, StorageAdapter};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::columnar::rows_to_parquet;
use crate::enrich::EnrichmentHook;
use crate::extraction_log::{ExtractionLog, ExtractionLogEntry};
use crate::filter::{FilterEngine, FilterReport, FilterStats};
use crate::state::StateTracker;

const TOP_REPORT_ENTRIES: usize = 10;

/// Which dates a run schedules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionMode {
    /// Dates after the last processed one, committed strictly in date order.
    Incremental,
    /// Every unprocessed date since the start date.
    Historical,
    /// Exactly these dates, processed or not.
    Dates(Vec<NaiveDate>),
}

impl ExtractionMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Historical => "historical",
            Self::Dates(_) => "dates",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_workers: usize,
    pub raw_prefix: String,
    pub extraction_log_path: Option<String>,
    pub keep_rejected: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_workers: 3,
            raw_prefix: "raw-data".to_string(),
            extraction_log_path: Some("metadata/extraction_log.json".to_string()),
            keep_rejected: false,
        }
    }
}

/// What one worker produced for one date. Workers never touch state.
#[derive(Debug, Clone)]
pub struct DayReport {
    pub date: NaiveDate,
    pub fetched: u64,
    pub invalid: u64,
    pub written: u64,
    pub path: Option<String>,
    pub sha256: Option<String>,
    pub bytes: u64,
    pub stats: FilterStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayFailure {
    pub date: NaiveDate,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: &'static str,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<DayFailure>,
    /// Extracted successfully but left uncommitted behind an earlier failure.
    pub deferred: Vec<NaiveDate>,
    pub records_fetched: u64,
    pub invalid_records: u64,
    pub records_written: u64,
    pub filter: FilterReport,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.deferred.is_empty()
    }
}

struct WorkerContext {
    source: Arc<dyn ContractSource>,
    storage: Arc<dyn StorageAdapter>,
    enrichment: Arc<dyn EnrichmentHook>,
    filter: Arc<FilterEngine>,
    raw_prefix: String,
    keep_rejected: bool,
}

pub struct ExtractionScheduler {
    ctx: Arc<WorkerContext>,
    options: SchedulerOptions,
}

impl ExtractionScheduler {
    pub fn new(
        source: Arc<dyn ContractSource>,
        storage: Arc<dyn StorageAdapter>,
        enrichment: Arc<dyn EnrichmentHook>,
        filter: Arc<FilterEngine>,
        options: SchedulerOptions,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            source,
            storage,
            enrichment,
            filter,
            raw_prefix: options.raw_prefix.clone(),
            keep_rejected: options.keep_rejected,
        });
        Self { ctx, options }
    }

    pub fn plan(tracker: &StateTracker, mode: &ExtractionMode, today: NaiveDate) -> Vec<NaiveDate> {
        match mode {
            ExtractionMode::Incremental => tracker.pending_dates(today),
            ExtractionMode::Historical => tracker.missing_dates(today),
            ExtractionMode::Dates(dates) => {
                let mut dates = dates.clone();
                dates.sort();
                dates.dedup();
                dates
            }
        }
    }

    pub async fn run(
        &self,
        tracker: &mut StateTracker,
        mode: ExtractionMode,
        today: NaiveDate,
    ) -> Result<RunSummary> {
        let dates = Self::plan(tracker, &mode, today);
        let ordered = mode == ExtractionMode::Incremental;
        let mut stats = FilterStats::default();
        let mut summary = RunSummary {
            mode: mode.label(),
            attempted: dates.len(),
            succeeded: 0,
            failed: Vec::new(),
            deferred: Vec::new(),
            records_fetched: 0,
            invalid_records: 0,
            records_written: 0,
            filter: stats.report(TOP_REPORT_ENTRIES),
        };
        let Some(&first) = dates.first() else {
            info!(mode = mode.label(), "nothing to extract");
            return Ok(summary);
        };
        info!(
            mode = mode.label(),
            dates = dates.len(),
            first = %first,
            source = self.ctx.source.source_id(),
            "starting extraction"
        );
        tracker.begin(first).await?;

        let mut log = match &self.options.extraction_log_path {
            Some(path) => Some(
                ExtractionLog::load(self.ctx.storage.as_ref(), path)
                    .await
                    .context("loading extraction log")?,
            ),
            None => None,
        };

        let semaphore = Arc::new(Semaphore::new(self.options.max_workers.max(1)));
        let mut tasks = JoinSet::new();
        for &date in &dates {
            let ctx = self.ctx.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let span = info_span!("extract_day", date = %date);
                let result = extract_day(&ctx, date).instrument(span).await;
                (date, result)
            });
        }

        let mut uncommitted: BTreeSet<NaiveDate> = dates.iter().copied().collect();
        let mut finished: BTreeMap<NaiveDate, Result<DayReport, String>> = BTreeMap::new();
        let mut next = 0;
        let mut blocked = false;
        while let Some(joined) = tasks.join_next().await {
            let (date, result) = joined.context("extraction worker panicked")?;
            let result = result.map_err(|err| format!("{err:#}"));
            if !ordered {
                if self
                    .settle(tracker, log.as_mut(), &mut summary, &mut stats, date, result, false)
                    .await?
                {
                    uncommitted.remove(&date);
                }
            } else {
                finished.insert(date, result);
                while let Some(result) = dates.get(next).and_then(|d| finished.remove(d)) {
                    let date = dates[next];
                    let failed = result.is_err();
                    if self
                        .settle(tracker, log.as_mut(), &mut summary, &mut stats, date, result, blocked)
                        .await?
                    {
                        uncommitted.remove(&date);
                    }
                    blocked |= failed;
                    next += 1;
                }
            }
            if let Some(&oldest) = uncommitted.first() {
                tracker.begin(oldest).await?;
            }
        }

        summary.filter = stats.report(TOP_REPORT_ENTRIES);
        info!(
            mode = summary.mode,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            deferred = summary.deferred.len(),
            records_written = summary.records_written,
            "extraction finished"
        );
        Ok(summary)
    }

    /// Commits, defers or records the failure of one finished date. Returns whether it was committed.
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        tracker: &mut StateTracker,
        log: Option<&mut ExtractionLog>,
        summary: &mut RunSummary,
        stats: &mut FilterStats,
        date: NaiveDate,
        result: Result<DayReport, String>,
        defer: bool,
    ) -> Result<bool> {
        let report = match result {
            Ok(report) => report,
            Err(error) => {
                warn!(date = %date, error = %error, "date failed; it stays pending");
                summary.failed.push(DayFailure { date, error });
                return Ok(false);
            }
        };
        stats.merge(&report.stats);
        summary.records_fetched += report.fetched;
        summary.invalid_records += report.invalid;
        if defer {
            info!(date = %date, "extracted but deferred behind an earlier failure");
            summary.deferred.push(date);
            return Ok(false);
        }

        tracker.mark_processed(date, report.written).await?;
        summary.succeeded += 1;
        summary.records_written += report.written;

        if let (Some(log), Some(path)) = (log, &self.options.extraction_log_path) {
            log.upsert(ExtractionLogEntry {
                date,
                records_fetched: report.fetched,
                invalid_records: report.invalid,
                records_written: report.written,
                path: report.path.clone(),
                sha256: report.sha256.clone(),
                bytes: report.bytes,
                filter: report.stats.report(TOP_REPORT_ENTRIES),
                extracted_at: Utc::now(),
            });
            if let Err(err) = log.save(self.ctx.storage.as_ref(), path).await {
                let error = format!("{err:#}");
                warn!(date = %date, error = %error, "could not update extraction log");
            }
        }
        Ok(true)
    }
}

async fn extract_day(ctx: &WorkerContext, date: NaiveDate) -> Result<DayReport> {
    let fetched = ctx
        .source
        .fetch_day(date)
        .await
        .with_context(|| format!("fetching {date} from {}", ctx.source.source_id()))?;

    let mut known = Vec::with_capacity(fetched.len());
    let mut invalid = 0u64;
    for record in fetched {
        match record {
            SourceRecord::Known(record) => known.push(*record),
            SourceRecord::Raw { problem, .. } => {
                invalid += 1;
                debug!(%problem, "skipping unvalidated record");
            }
        }
    }
    if invalid > 0 {
        warn!(invalid, "records failed validation");
    }
    let fetched = known.len() as u64 + invalid;

    let enriched = ctx.enrichment.apply(known).context("enriching records")?;
    let (kept, stats) = apply_filter(&ctx.filter, enriched, ctx.keep_rejected, date);

    let mut report = DayReport {
        date,
        fetched,
        invalid,
        written: kept.len() as u64,
        path: None,
        sha256: None,
        bytes: 0,
        stats,
    };
    if kept.is_empty() {
        info!(fetched, "no accepted records; nothing written");
        return Ok(report);
    }

    let rows = kept
        .iter()
        .map(ContractRecord::to_row)
        .collect::<Result<Vec<_>, _>>()
        .context("serialising records")?;
    let bytes = rows_to_parquet(&rows).context("encoding parquet")?;
    let path = partition_path(&ctx.raw_prefix, date);
    report.sha256 = Some(sha256_hex(&bytes));
    report.bytes = bytes.len() as u64;
    ctx.storage
        .write(&path, bytes)
        .await
        .with_context(|| format!("writing {path}"))?;
    info!(path = %path, records = report.written, fetched, "day written");
    report.path = Some(path);
    Ok(report)
}

/// Decides every record, stamping outcome and extraction metadata on the ones kept.
fn apply_filter(
    engine: &FilterEngine,
    records: Vec<ContractRecord>,
    keep_rejected: bool,
    date: NaiveDate,
) -> (Vec<ContractRecord>, FilterStats) {
    let mut stats = FilterStats::default();
    let extracted_at = Utc::now().to_rfc3339();
    let partition_date = date.format("%Y-%m-%d").to_string();
    let kept = records
        .into_iter()
        .filter_map(|mut record| {
            let outcome = engine.decide(&record);
            stats.record(&outcome);
            if !outcome.applied && !keep_rejected {
                return None;
            }
            record.apply_outcome(&outcome);
            record.extraction_date = Some(extracted_at.clone());
            record.partition_date = Some(partition_date.clone());
            Some(record)
        })
        .collect();
    (kept, stats)
}
