use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arrow_schema::DataType;
use async_trait::async_trait;
use chrono::NaiveDate;
use pncp_adapters::{ContractSource, FixtureSource, SourceError};
use pncp_core::{partition_path, SourceRecord};
use pncp_storage::{LocalStorage, StorageAdapter};
use pncp_sync::columnar::{batches_to_rows, decode_parquet, parquet_schema};
use pncp_sync::extraction_log::ExtractionLog;
use pncp_sync::{ExtractionMode, HarvestConfig, Harvester};

fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/pncp")
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 8, d).unwrap()
}

/// Fixture-backed source that can fail or stall chosen dates.
struct ScriptedSource {
    inner: FixtureSource,
    failing: HashSet<NaiveDate>,
    delays: HashMap<NaiveDate, Duration>,
}

impl ScriptedSource {
    fn new() -> Self {
        Self {
            inner: FixtureSource::new(fixture_dir()),
            failing: HashSet::new(),
            delays: HashMap::new(),
        }
    }

    fn failing(mut self, date: NaiveDate) -> Self {
        self.failing.insert(date);
        self
    }

    fn slow(mut self, date: NaiveDate, millis: u64) -> Self {
        self.delays.insert(date, Duration::from_millis(millis));
        self
    }
}

#[async_trait]
impl ContractSource for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_day(&self, date: NaiveDate) -> Result<Vec<SourceRecord>, SourceError> {
        if let Some(delay) = self.delays.get(&date) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&date) {
            return Err(SourceError::Transient {
                date,
                message: "retries exhausted".to_string(),
            });
        }
        self.inner.fetch_day(date).await
    }
}

fn harvester(root: &Path) -> (Harvester, Arc<dyn StorageAdapter>) {
    let filters = root.join("filtros.yaml");
    std::fs::write(&filters, "AUDIO:\n  - fone\n  - caixa de som\n").unwrap();
    let mut config = HarvestConfig::default();
    config.extraction.start_date = day(16);
    config.extraction.max_workers = 3;
    config.filter.path = filters;
    let storage: Arc<dyn StorageAdapter> = Arc::new(LocalStorage::new(root.join("data")));
    (Harvester::with_storage(config, storage.clone()), storage)
}

#[tokio::test]
async fn incremental_run_writes_filtered_partitions_and_commits_state() {
    let dir = tempfile::tempdir().unwrap();
    let (harvester, storage) = harvester(dir.path());
    let source = Arc::new(FixtureSource::new(fixture_dir()));

    let summary = harvester
        .extract(source.clone(), ExtractionMode::Incremental, day(18), false)
        .await
        .unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.succeeded, 2);
    assert!(summary.is_clean());
    assert_eq!(summary.records_fetched, 4);
    assert_eq!(summary.invalid_records, 1);
    assert_eq!(summary.records_written, 2);
    assert_eq!(summary.filter.analysed, 3);
    assert_eq!(summary.filter.approved, 2);
    assert_eq!(summary.filter.top_groups, vec![("AUDIO".to_string(), 2)]);

    let path = partition_path("raw-data", day(16));
    let (_, batches) = decode_parquet(storage.read(&path).await.unwrap()).unwrap();
    let rows = batches_to_rows(&batches).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["filtro_grupo_matched"], "AUDIO");
    assert_eq!(rows[0]["filtro_termo_matched"], "fone");
    assert_eq!(rows[0]["modalidade_nome_dominio"], "Pregão - Eletrônico");
    assert_eq!(rows[0]["unidadeOrgao"]["codigoUnidade"], "250005");

    let tracker = harvester.load_state(false).await.unwrap();
    assert_eq!(tracker.state().last_extraction_date, Some(day(17)));
    assert_eq!(tracker.state().total_records_extracted, 2);
    assert!(tracker.state().in_progress_date.is_none());
    assert!(tracker.pending_dates(day(18)).is_empty());

    let log = ExtractionLog::load(storage.as_ref(), "metadata/extraction_log.json")
        .await
        .unwrap();
    assert_eq!(log.entries.len(), 2);
    assert_eq!(log.entries[0].path.as_deref(), Some(path.as_str()));
    assert!(log.entries[0].sha256.is_some());

    let again = harvester
        .extract(source, ExtractionMode::Incremental, day(18), false)
        .await
        .unwrap();
    assert_eq!(again.attempted, 0);
    assert!(again.is_clean());
}

#[tokio::test]
async fn failure_defers_later_dates_until_it_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let (harvester, storage) = harvester(dir.path());
    // the failing date finishes last so later dates complete first
    let source = Arc::new(ScriptedSource::new().failing(day(16)).slow(day(16), 150));

    let summary = harvester
        .extract(source, ExtractionMode::Incremental, day(19), false)
        .await
        .unwrap();
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].date, day(16));
    assert_eq!(summary.deferred, vec![day(17), day(18)]);
    assert!(!summary.is_clean());

    let tracker = harvester.load_state(false).await.unwrap();
    assert!(tracker.state().processed_dates.is_empty());
    assert_eq!(tracker.state().in_progress_date, Some(day(16)));
    assert_eq!(tracker.pending_dates(day(19)), vec![day(16), day(17), day(18)]);
    assert!(storage
        .exists(&partition_path("raw-data", day(17)))
        .await
        .unwrap());

    let retry = harvester
        .extract(
            Arc::new(FixtureSource::new(fixture_dir())),
            ExtractionMode::Incremental,
            day(19),
            false,
        )
        .await
        .unwrap();
    assert_eq!(retry.succeeded, 3);
    assert!(retry.is_clean());
    let tracker = harvester.load_state(false).await.unwrap();
    assert_eq!(tracker.state().processed_dates.len(), 3);
}

#[tokio::test]
async fn middle_failure_commits_only_the_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let (harvester, _) = harvester(dir.path());
    let source = Arc::new(ScriptedSource::new().failing(day(17)));

    let summary = harvester
        .extract(source, ExtractionMode::Incremental, day(19), false)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.deferred, vec![day(18)]);

    let tracker = harvester.load_state(false).await.unwrap();
    assert_eq!(
        tracker.state().processed_dates.iter().copied().collect::<Vec<_>>(),
        vec![day(16)]
    );
    assert_eq!(tracker.pending_dates(day(19)), vec![day(17), day(18)]);
    assert_eq!(tracker.state().in_progress_date, Some(day(17)));
}

#[tokio::test]
async fn historical_mode_commits_around_failures() {
    let dir = tempfile::tempdir().unwrap();
    let (harvester, _) = harvester(dir.path());
    let source = Arc::new(ScriptedSource::new().failing(day(17)));

    let summary = harvester
        .extract(source, ExtractionMode::Historical, day(19), false)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.deferred.is_empty());

    let tracker = harvester.load_state(false).await.unwrap();
    assert_eq!(tracker.missing_dates(day(19)), vec![day(17)]);
}

#[tokio::test]
async fn empty_day_is_marked_processed_without_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let (harvester, storage) = harvester(dir.path());
    let source = Arc::new(FixtureSource::new(fixture_dir()));

    let summary = harvester
        .extract(source, ExtractionMode::Dates(vec![day(20)]), day(21), false)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.records_written, 0);
    assert!(!storage
        .exists(&partition_path("raw-data", day(20)))
        .await
        .unwrap());
    let tracker = harvester.load_state(false).await.unwrap();
    assert!(tracker.is_processed(day(20)));
}

#[tokio::test]
async fn partitions_without_state_require_explicit_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let (harvester, storage) = harvester(dir.path());
    let source = Arc::new(FixtureSource::new(fixture_dir()));
    harvester
        .extract(source, ExtractionMode::Incremental, day(18), false)
        .await
        .unwrap();
    std::fs::remove_file(dir.path().join("data/state.json")).unwrap();

    assert!(harvester.load_state(false).await.is_err());
    let tracker = harvester.load_state(true).await.unwrap();
    assert_eq!(tracker.state().last_extraction_date, Some(day(17)));
    assert!(storage.exists("state.json").await.unwrap());
}

#[tokio::test]
async fn missing_nested_structures_are_written_as_typed_structs() {
    let dir = tempfile::tempdir().unwrap();
    let (harvester, storage) = harvester(dir.path());
    let pages = dir.path().join("pages");
    std::fs::create_dir_all(&pages).unwrap();
    std::fs::write(
        pages.join("2025-08-16.json"),
        r#"[{"numeroControlePNCP": "9", "objetoCompra": "fone bluetooth", "unidadeOrgao": null}]"#,
    )
    .unwrap();

    let summary = harvester
        .extract(
            Arc::new(FixtureSource::new(pages)),
            ExtractionMode::Dates(vec![day(16)]),
            day(17),
            false,
        )
        .await
        .unwrap();
    assert_eq!(summary.records_written, 1);

    let schema = parquet_schema(storage.read(&partition_path("raw-data", day(16))).await.unwrap()).unwrap();
    let DataType::Struct(members) = schema.field_with_name("unidadeOrgao").unwrap().data_type() else {
        panic!("unidadeOrgao should be a struct");
    };
    assert_eq!(members.len(), 6);
    assert!(members.find("codigoUnidade").is_some());
    assert!(matches!(
        schema.field_with_name("fontesOrcamentarias").unwrap().data_type(),
        DataType::List(_)
    ));
}
