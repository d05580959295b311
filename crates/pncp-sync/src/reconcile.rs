//! Repair pass bringing every partition file to one canonical schema.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::{Array, RecordBatch};
use arrow_buffer::NullBuffer;
use arrow_schema::{DataType, Schema, SchemaRef};
use bytes::Bytes;
use pncp_storage::{sha256_hex, StorageAdapter, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::columnar::{batches_to_rows, decode_parquet, encode_parquet, parquet_schema, rows_to_batch};
use crate::schema::{conform_batch, SchemaProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    /// Columns were conformed in place.
    Patched,
    /// Rows were re-materialised and decoded against the profile.
    Rebuilt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub path: String,
    pub rewritten: bool,
    pub backup_path: Option<String>,
    pub strategy: Option<RepairStrategy>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: StorageError,
    },
    #[error("decoding {path}: {message}")]
    Decode { path: String, message: String },
    #[error("{path} cannot be conformed: {message}")]
    Irreconcilable { path: String, message: String },
    #[error("backing up {path}: {source}")]
    Backup {
        path: String,
        #[source]
        source: StorageError,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: StorageError,
    },
    #[error("{path} still diverges after rewrite: {}", mismatches.join(", "))]
    Verification { path: String, mismatches: Vec<String> },
}

/// Conforms single files to a fixed profile.
#[derive(Debug, Clone)]
pub struct Reconciler {
    storage: Arc<dyn StorageAdapter>,
    profile: Arc<SchemaProfile>,
    backup_prefix: String,
}

impl Reconciler {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        profile: Arc<SchemaProfile>,
        backup_prefix: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            profile,
            backup_prefix: backup_prefix.into(),
        }
    }

    pub fn profile(&self) -> &SchemaProfile {
        &self.profile
    }

    pub fn backup_path(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.backup_prefix.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn reconcile(&self, path: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let original = self
            .storage
            .read(path)
            .await
            .map_err(|source| ReconcileError::Read {
                path: path.to_string(),
                source,
            })?;
        let (schema, batches) =
            decode_parquet(original.clone()).map_err(|err| ReconcileError::Decode {
                path: path.to_string(),
                message: format!("{err:#}"),
            })?;

        let mismatches = self.profile.mismatches(&schema);
        if mismatches.is_empty() {
            debug!(path, "already conformant");
            return Ok(ReconcileOutcome {
                path: path.to_string(),
                rewritten: false,
                backup_path: None,
                strategy: None,
            });
        }
        let unknown = self.profile.unknown_members(&schema);
        if !unknown.is_empty() {
            return Err(ReconcileError::Irreconcilable {
                path: path.to_string(),
                message: format!("nested members outside the profile: {}", unknown.join(", ")),
            });
        }
        info!(path, fields = %mismatches.join(","), "reconciling file");

        let expected_values = value_counts(&batches);
        let (target, repaired, strategy) = self.repair(path, &schema, &batches)?;
        let rows = repaired.iter().map(RecordBatch::num_rows).sum::<usize>();
        let encoded = encode_parquet(target, &repaired).map_err(|err| ReconcileError::Irreconcilable {
            path: path.to_string(),
            message: format!("{err:#}"),
        })?;

        let backup_path = self.back_up(path, &original).await?;
        self.storage
            .write(path, encoded)
            .await
            .map_err(|source| ReconcileError::Write {
                path: path.to_string(),
                source,
            })?;

        if let Err(mismatches) = self.verify(path, rows, &expected_values).await {
            warn!(path, "verification failed; restoring original");
            if let Err(err) = self.storage.write(path, original).await {
                error!(path, backup = %backup_path, error = %err, "restoring original failed");
            }
            return Err(ReconcileError::Verification {
                path: path.to_string(),
                mismatches,
            });
        }

        Ok(ReconcileOutcome {
            path: path.to_string(),
            rewritten: true,
            backup_path: Some(backup_path),
            strategy: Some(strategy),
        })
    }

    fn repair(
        &self,
        path: &str,
        schema: &Schema,
        batches: &[RecordBatch],
    ) -> Result<(SchemaRef, Vec<RecordBatch>, RepairStrategy), ReconcileError> {
        let patched = batches
            .iter()
            .map(|batch| conform_batch(batch, &self.profile))
            .collect::<Result<Vec<_>, _>>();
        match patched {
            Ok(patched) => Ok((
                self.profile.schema_with_extras(schema),
                patched,
                RepairStrategy::Patched,
            )),
            Err(err) => {
                warn!(path, error = %err, "in-place patch failed; rebuilding from rows");
                let target = self.profile.schema_with_extras(schema);
                let rebuilt = batches_to_rows(batches)
                    .and_then(|rows| rows_to_batch(&rows, target.clone()))
                    .map_err(|err| ReconcileError::Irreconcilable {
                        path: path.to_string(),
                        message: format!("{err:#}"),
                    })?;
                Ok((target, vec![rebuilt], RepairStrategy::Rebuilt))
            }
        }
    }

    /// Stores `original` under the backup prefix and returns where it lives.
    ///
    /// A backup holding other bytes is never overwritten: the new original is
    /// kept beside it, suffixed with the start of its sha256.
    async fn back_up(&self, path: &str, original: &Bytes) -> Result<String, ReconcileError> {
        let primary = self.backup_path(path);
        let target = match self.storage.read(&primary).await {
            Ok(existing) if existing == *original => return Ok(primary),
            Ok(_) => format!("{primary}.{}", &sha256_hex(original)[..12]),
            Err(err) if err.is_not_found() => primary,
            Err(source) => {
                return Err(ReconcileError::Backup {
                    path: primary,
                    source,
                })
            }
        };
        let exists = self
            .storage
            .exists(&target)
            .await
            .map_err(|source| ReconcileError::Backup {
                path: target.clone(),
                source,
            })?;
        if !exists {
            self.storage
                .write(&target, original.clone())
                .await
                .map_err(|source| ReconcileError::Backup {
                    path: target.clone(),
                    source,
                })?;
            debug!(path, backup = %target, "original backed up");
        }
        Ok(target)
    }

    async fn verify(
        &self,
        path: &str,
        expected_rows: usize,
        expected_values: &BTreeMap<String, usize>,
    ) -> Result<(), Vec<String>> {
        let written = self
            .storage
            .read(path)
            .await
            .map_err(|err| vec![format!("re-read failed: {err}")])?;
        let (schema, batches) =
            decode_parquet(written).map_err(|err| vec![format!("re-decode failed: {err:#}")])?;
        let mut problems = self.profile.mismatches(&schema);
        let rows = batches.iter().map(RecordBatch::num_rows).sum::<usize>();
        if rows != expected_rows {
            problems.push(format!("row count {rows} != {expected_rows}"));
        }
        problems.extend(lost_values(expected_values, &value_counts(&batches)));
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Non-null values per column path; struct members are `a.b`, list items `a[]`.
pub fn value_counts(batches: &[RecordBatch]) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for batch in batches {
        for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
            count_values(field.name().clone(), column.as_ref(), None, &mut out);
        }
    }
    out
}

fn count_values(
    path: String,
    array: &dyn Array,
    parent: Option<&NullBuffer>,
    out: &mut BTreeMap<String, usize>,
) {
    let nulls = NullBuffer::union(parent, array.logical_nulls().as_ref());
    let present = array.len() - nulls.as_ref().map(NullBuffer::null_count).unwrap_or(0);
    *out.entry(path.clone()).or_default() += present;
    match array.data_type() {
        DataType::Struct(fields) => {
            let array = array.as_struct();
            for (field, child) in fields.iter().zip(array.columns()) {
                count_values(format!("{path}.{}", field.name()), child.as_ref(), nulls.as_ref(), out);
            }
        }
        DataType::List(_) => {
            count_values(format!("{path}[]"), array.as_list::<i32>().values().as_ref(), None, out);
        }
        _ => {}
    }
}

/// Paths present on both sides whose rewritten file holds fewer values.
pub fn lost_values(before: &BTreeMap<String, usize>, after: &BTreeMap<String, usize>) -> Vec<String> {
    before
        .iter()
        .filter_map(|(path, &had)| match after.get(path) {
            Some(&has) if has < had => Some(format!("{path} lost {} value(s)", had - has)),
            None if !path.contains(['.', '[']) && had > 0 => Some(format!("{path} dropped")),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RepairOptions {
    pub prefix: String,
    pub backup_prefix: String,
    /// Derive the profile from at most this many files, spread over the listing.
    pub sample_size: Option<usize>,
    /// Derive the profile from this single file instead of a sample.
    pub reference_file: Option<String>,
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairSummary {
    pub files: usize,
    pub reconciled: usize,
    pub conformant: usize,
    pub patched: usize,
    pub rebuilt: usize,
    pub failed: Vec<FailedFile>,
}

impl RepairSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub async fn list_parquet(storage: &dyn StorageAdapter, prefix: &str) -> Result<Vec<String>> {
    Ok(storage
        .list(prefix)
        .await
        .with_context(|| format!("listing {prefix}"))?
        .into_iter()
        .filter(|p| p.ends_with(".parquet"))
        .collect())
}

/// Evenly spaced subset of `paths`, always deterministic for a given listing.
pub fn sample_paths(paths: &[String], sample_size: Option<usize>) -> Vec<String> {
    match sample_size {
        Some(n) if n > 0 && n < paths.len() => {
            let step = paths.len() as f64 / n as f64;
            (0..n)
                .map(|i| paths[(i as f64 * step) as usize].clone())
                .collect()
        }
        _ => paths.to_vec(),
    }
}

/// Joins the schemas of `paths`. Unreadable files are skipped with a warning.
pub async fn derive_profile(storage: &dyn StorageAdapter, paths: &[String]) -> Result<SchemaProfile> {
    let mut schemas = Vec::with_capacity(paths.len());
    for path in paths {
        let schema = match storage.read(path).await {
            Ok(bytes) => parquet_schema(bytes),
            Err(err) => Err(anyhow::Error::new(err)),
        };
        match schema {
            Ok(schema) => schemas.push(schema),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(path = %path, error = %message, "skipping file while profiling");
            }
        }
    }
    Ok(SchemaProfile::derive(schemas.iter().map(|s| &**s)))
}

pub async fn profile_from_reference(storage: &dyn StorageAdapter, path: &str) -> Result<SchemaProfile> {
    let bytes: Bytes = storage
        .read(path)
        .await
        .with_context(|| format!("reading reference file {path}"))?;
    let schema = parquet_schema(bytes).with_context(|| format!("decoding reference file {path}"))?;
    Ok(SchemaProfile::derive([&*schema]))
}

/// Derives one profile for `options.prefix` and reconciles every file against it.
pub async fn reconcile_partition(
    storage: Arc<dyn StorageAdapter>,
    options: &RepairOptions,
) -> Result<RepairSummary> {
    let paths = list_parquet(storage.as_ref(), &options.prefix).await?;
    let mut summary = RepairSummary {
        files: paths.len(),
        ..Default::default()
    };
    if paths.is_empty() {
        info!(prefix = %options.prefix, "no partition files to repair");
        return Ok(summary);
    }

    let profile = match &options.reference_file {
        Some(reference) => profile_from_reference(storage.as_ref(), reference).await?,
        None => {
            let sample = sample_paths(&paths, options.sample_size);
            derive_profile(storage.as_ref(), &sample).await?
        }
    };
    info!(
        files = paths.len(),
        fields = profile.fields().len(),
        "derived canonical profile"
    );

    let reconciler = Reconciler::new(storage, Arc::new(profile), options.backup_prefix.clone());
    let limit = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for path in paths {
        let reconciler = reconciler.clone();
        let limit = Arc::clone(&limit);
        let span = info_span!("reconcile_file", path = %path);
        tasks.spawn(
            async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let result = reconciler.reconcile(&path).await;
                (path, result)
            }
            .instrument(span),
        );
    }

    while let Some(joined) = tasks.join_next().await {
        let (path, result) = joined.context("reconcile task panicked")?;
        match result {
            Ok(outcome) if outcome.rewritten => {
                summary.reconciled += 1;
                match outcome.strategy {
                    Some(RepairStrategy::Rebuilt) => summary.rebuilt += 1,
                    _ => summary.patched += 1,
                }
            }
            Ok(_) => summary.conformant += 1,
            Err(err) => {
                error!(path = %path, error = %err, "file failed reconciliation");
                summary.failed.push(FailedFile {
                    path,
                    error: err.to_string(),
                });
            }
        }
    }
    summary.failed.sort_by(|a, b| a.path.cmp(&b.path));
    info!(
        files = summary.files,
        reconciled = summary.reconciled,
        conformant = summary.conformant,
        failed = summary.failed.len(),
        "repair pass finished"
    );
    Ok(summary)
}
