//! Single deduplicated history file built from every daily partition.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::{make_array, Array, ArrayRef, RecordBatch, UInt32Array};
use arrow_buffer::NullBuffer;
use arrow_cast::display::{ArrayFormatter, FormatOptions};
use arrow_schema::{DataType, SchemaRef};
use arrow_select::concat::concat_batches;
use arrow_select::take::take_record_batch;
use pncp_core::CONTROL_NUMBER_FIELD;
use pncp_storage::{sha256_hex, StorageAdapter};
use serde::Serialize;
use tracing::{info, warn};

use crate::columnar::{batches_to_rows, decode_parquet, encode_parquet, rows_to_batch};
use crate::reconcile::{list_parquet, FailedFile};
use crate::schema::{conform_batch, SchemaProfile};

pub const DEFAULT_CONSOLIDATED_PATH: &str = "consolidated/contracts_full_history.parquet";

/// Composite key used when a row has no control number.
pub const FALLBACK_KEY_FIELDS: [&str; 4] = [
    "sequencialCompra",
    "numeroCompra",
    "codigoUnidade",
    "dataPublicacaoPncp",
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationSummary {
    pub files: usize,
    pub rows_read: usize,
    pub rows_written: usize,
    pub duplicates_dropped: usize,
    pub output_path: Option<String>,
    pub sha256: Option<String>,
    pub failed: Vec<FailedFile>,
}

pub async fn consolidate_history(
    storage: &dyn StorageAdapter,
    raw_prefix: &str,
    output_path: &str,
) -> Result<ConsolidationSummary> {
    let paths = list_parquet(storage, raw_prefix).await?;
    let mut summary = ConsolidationSummary {
        files: paths.len(),
        ..Default::default()
    };
    if paths.is_empty() {
        info!(prefix = %raw_prefix, "no partition files to consolidate");
        return Ok(summary);
    }

    let mut decoded = Vec::with_capacity(paths.len());
    for path in &paths {
        let result = match storage.read(path).await {
            Ok(bytes) => decode_parquet(bytes),
            Err(err) => Err(anyhow::Error::new(err)),
        };
        match result {
            Ok((schema, batches)) => decoded.push((path.clone(), schema, batches)),
            Err(err) => {
                let error = format!("{err:#}");
                warn!(path = %path, error = %error, "skipping unreadable partition");
                summary.failed.push(FailedFile {
                    path: path.clone(),
                    error,
                });
            }
        }
    }

    if decoded.is_empty() {
        warn!(prefix = %raw_prefix, "no readable partition files; history left untouched");
        return Ok(summary);
    }

    let profile = SchemaProfile::derive(decoded.iter().map(|(_, schema, _)| &**schema));
    let target: SchemaRef = Arc::new(profile.to_schema());
    let mut conformed = Vec::new();
    for (path, _, batches) in &decoded {
        summary.rows_read += batches.iter().map(RecordBatch::num_rows).sum::<usize>();
        match conform_all(batches, &profile, &target) {
            Ok(mut batches) => conformed.append(&mut batches),
            Err(err) => {
                let error = format!("{err:#}");
                warn!(path = %path, error = %error, "partition does not fit the history schema");
                summary.failed.push(FailedFile {
                    path: path.clone(),
                    error,
                });
            }
        }
    }

    let combined = concat_batches(&target, &conformed).context("concatenating partitions")?;
    let deduplicated = keep_last_by_key(&combined)?;
    summary.rows_written = deduplicated.num_rows();
    summary.duplicates_dropped = combined.num_rows() - deduplicated.num_rows();

    let bytes = encode_parquet(target, &[deduplicated])?;
    summary.sha256 = Some(sha256_hex(&bytes));
    storage
        .write(output_path, bytes)
        .await
        .with_context(|| format!("writing {output_path}"))?;
    summary.output_path = Some(output_path.to_string());
    info!(
        files = summary.files,
        rows = summary.rows_written,
        duplicates = summary.duplicates_dropped,
        path = %output_path,
        "history consolidated"
    );
    Ok(summary)
}

fn conform_all(
    batches: &[RecordBatch],
    profile: &SchemaProfile,
    target: &SchemaRef,
) -> Result<Vec<RecordBatch>> {
    let patched = batches
        .iter()
        .map(|batch| conform_batch(batch, profile))
        .collect::<Result<Vec<_>, _>>();
    match patched {
        Ok(patched) => Ok(patched),
        Err(_) => {
            let rows = batches_to_rows(batches)?;
            Ok(vec![rows_to_batch(&rows, target.clone())?])
        }
    }
}

/// Drops earlier rows sharing a key with a later one; surviving rows keep their order.
pub fn keep_last_by_key(batch: &RecordBatch) -> Result<RecordBatch> {
    let keys = row_keys(batch)?;
    let mut last: HashMap<&str, usize> = HashMap::with_capacity(keys.len());
    for (row, key) in keys.iter().enumerate() {
        if let Some(key) = key {
            last.insert(key.as_str(), row);
        }
    }
    let keep = keys
        .iter()
        .enumerate()
        .filter(|(row, key)| match key {
            Some(key) => last.get(key.as_str()) == Some(row),
            None => true,
        })
        .map(|(row, _)| row as u32)
        .collect::<Vec<_>>();
    if keep.len() == batch.num_rows() {
        return Ok(batch.clone());
    }
    let indices = UInt32Array::from(keep);
    take_record_batch(batch, &indices).context("selecting deduplicated rows")
}

/// Dedup key for every row, or `None` when no key field carries a value.
fn row_keys(batch: &RecordBatch) -> Result<Vec<Option<String>>> {
    let options = FormatOptions::default();
    let control = batch.column_by_name(CONTROL_NUMBER_FIELD).cloned();
    let fallback = FALLBACK_KEY_FIELDS
        .iter()
        .filter_map(|name| key_column(batch, name))
        .collect::<Vec<_>>();

    let control_nulls = control.as_ref().and_then(|c| c.logical_nulls());
    let control_format = control
        .as_ref()
        .map(|c| ArrayFormatter::try_new(c.as_ref(), &options))
        .transpose()?;
    let fallback_nulls = fallback.iter().map(|c| c.logical_nulls()).collect::<Vec<_>>();
    let fallback_format = fallback
        .iter()
        .map(|c| ArrayFormatter::try_new(c.as_ref(), &options))
        .collect::<Result<Vec<_>, _>>()?;

    let mut keys = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if let Some(format) = &control_format {
            if is_set(&control_nulls, row) {
                keys.push(Some(format!("id:{}", format.value(row))));
                continue;
            }
        }
        let parts = fallback_format
            .iter()
            .zip(&fallback_nulls)
            .map(|(format, nulls)| {
                if is_set(nulls, row) {
                    format.value(row).to_string()
                } else {
                    String::new()
                }
            })
            .collect::<Vec<_>>();
        keys.push(
            parts
                .iter()
                .any(|p| !p.is_empty())
                .then(|| format!("k:{}", parts.join("|"))),
        );
    }
    Ok(keys)
}

fn is_set(nulls: &Option<NullBuffer>, row: usize) -> bool {
    nulls.as_ref().map_or(true, |n| n.is_valid(row))
}

/// Top-level column `name`, or the `unidadeOrgao` member of that name.
fn key_column(batch: &RecordBatch, name: &str) -> Option<ArrayRef> {
    if let Some(column) = batch.column_by_name(name) {
        return Some(column.clone());
    }
    let unit = batch.column_by_name("unidadeOrgao")?;
    if !matches!(unit.data_type(), DataType::Struct(_)) {
        return None;
    }
    let unit = unit.as_struct();
    let member = unit.column_by_name(name)?;
    // a null unit must hide its members
    match unit.nulls() {
        Some(nulls) => {
            let merged = NullBuffer::union(Some(nulls), member.logical_nulls().as_ref());
            let data = member.to_data().into_builder().nulls(merged).build().ok()?;
            Some(make_array(data))
        }
        None => Some(member.clone()),
    }
}
