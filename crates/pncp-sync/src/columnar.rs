//! JSON rows to Arrow batches to Parquet bytes, and back.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::RecordBatch;
use arrow_json::{ArrayWriter, ReaderBuilder};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use arrow_select::concat::concat_batches;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::schema::merge_types;

const DECODE_BATCH_ROWS: usize = 1024;

/// Arrow type of a single JSON value. Empty objects carry no shape and count as null.
pub fn infer_value_type(value: &JsonValue) -> DataType {
    match value {
        JsonValue::Null => DataType::Null,
        JsonValue::Bool(_) => DataType::Boolean,
        JsonValue::Number(n) if n.is_i64() => DataType::Int64,
        JsonValue::Number(_) => DataType::Float64,
        JsonValue::String(_) => DataType::Utf8,
        JsonValue::Array(items) => {
            let item = items
                .iter()
                .fold(DataType::Null, |acc, v| merge_types(&acc, &infer_value_type(v)));
            DataType::List(Arc::new(Field::new("item", item, true)))
        }
        JsonValue::Object(map) if map.is_empty() => DataType::Null,
        JsonValue::Object(map) => DataType::Struct(
            map.iter()
                .map(|(k, v)| Field::new(k, infer_value_type(v), true))
                .collect(),
        ),
    }
}

/// Schema covering every column seen in `rows`, in first-seen order.
pub fn infer_schema(rows: &[JsonValue]) -> Schema {
    let mut order: Vec<(String, DataType)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let Some(object) = row.as_object() else {
            continue;
        };
        for (name, value) in object {
            let observed = infer_value_type(value);
            match index.get(name) {
                Some(&i) => order[i].1 = merge_types(&order[i].1, &observed),
                None => {
                    index.insert(name.clone(), order.len());
                    order.push((name.clone(), observed));
                }
            }
        }
    }
    Schema::new(
        order
            .into_iter()
            .map(|(name, dt)| Field::new(name, dt, true))
            .collect::<Vec<_>>(),
    )
}

/// A non-null value that has no representation in the target type.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {value} cannot be stored as {target}")]
pub struct ShapeError {
    pub field: String,
    pub value: String,
    pub target: DataType,
}

fn unrepresentable(value: &JsonValue, target: &DataType) -> ShapeError {
    let mut value = value.to_string();
    if value.len() > 80 {
        let cut = (0..=80).rev().find(|i| value.is_char_boundary(*i)).unwrap_or(0);
        value.truncate(cut);
        value.push_str("...");
    }
    ShapeError {
        field: String::new(),
        value,
        target: target.clone(),
    }
}

fn within(field: &str, mut err: ShapeError) -> ShapeError {
    err.field = if err.field.is_empty() {
        field.to_string()
    } else {
        format!("{field}.{}", err.field)
    };
    err
}

/// Coerces `value` into the JSON shape that decodes as `target`.
///
/// Single objects are wrapped where a list is expected, JSON text is parsed
/// where a struct is expected, and anything becomes text where `Utf8` is
/// expected. A non-null value that cannot take the target shape is an error,
/// never a silent null.
pub fn normalize_value(value: &JsonValue, target: &DataType) -> Result<JsonValue, ShapeError> {
    if value.is_null() {
        return Ok(JsonValue::Null);
    }
    let converted = match target {
        DataType::Null => None,
        DataType::Boolean => match value {
            JsonValue::Bool(_) => Some(value.clone()),
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(JsonValue::Bool(true)),
                "false" => Some(JsonValue::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        DataType::Int64 => match value {
            JsonValue::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(JsonValue::from),
            JsonValue::String(s) => s.trim().parse::<i64>().ok().map(JsonValue::from),
            _ => None,
        },
        DataType::Float64 => match value {
            JsonValue::Number(n) => n.as_f64().map(JsonValue::from),
            JsonValue::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(JsonValue::from),
            _ => None,
        },
        DataType::Utf8 => match value {
            JsonValue::String(_) => Some(value.clone()),
            other => Some(JsonValue::String(other.to_string())),
        },
        DataType::List(item) => {
            let items = match value {
                JsonValue::Array(items) => items
                    .iter()
                    .map(|v| normalize_value(v, item.data_type()))
                    .collect::<Result<Vec<_>, _>>()?,
                single => vec![normalize_value(single, item.data_type())?],
            };
            Some(JsonValue::Array(items))
        }
        DataType::Struct(fields) => match value {
            JsonValue::Object(map) => {
                if let Some(extra) = map.keys().find(|k| fields.find(k).is_none()) {
                    return Err(within(extra, unrepresentable(&map[extra], target)));
                }
                let mut out = Map::with_capacity(fields.len());
                for field in fields {
                    let member = map.get(field.name()).unwrap_or(&JsonValue::Null);
                    let member = normalize_value(member, field.data_type())
                        .map_err(|err| within(field.name(), err))?;
                    out.insert(field.name().clone(), member);
                }
                Some(JsonValue::Object(out))
            }
            JsonValue::String(text) => match serde_json::from_str::<JsonValue>(text) {
                Ok(parsed @ JsonValue::Object(_)) => Some(normalize_value(&parsed, target)?),
                _ => None,
            },
            _ => None,
        },
        _ => Some(value.clone()),
    };
    converted.ok_or_else(|| unrepresentable(value, target))
}

pub fn normalize_row(row: &JsonValue, schema: &Schema) -> Result<JsonValue, ShapeError> {
    let mut out = Map::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let value = row.get(field.name()).unwrap_or(&JsonValue::Null);
        let value =
            normalize_value(value, field.data_type()).map_err(|err| within(field.name(), err))?;
        out.insert(field.name().clone(), value);
    }
    Ok(JsonValue::Object(out))
}

/// Decodes JSON rows into one batch of exactly `schema`.
pub fn rows_to_batch(rows: &[JsonValue], schema: SchemaRef) -> Result<RecordBatch> {
    if rows.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    let normalized = rows
        .iter()
        .enumerate()
        .map(|(i, row)| normalize_row(row, &schema).with_context(|| format!("row {i}")))
        .collect::<Result<Vec<_>>>()?;

    let mut batches = Vec::new();
    for chunk in normalized.chunks(DECODE_BATCH_ROWS) {
        let mut decoder = ReaderBuilder::new(schema.clone())
            .with_batch_size(DECODE_BATCH_ROWS)
            .build_decoder()
            .context("building json decoder")?;
        decoder.serialize(chunk).context("decoding json rows")?;
        if let Some(batch) = decoder.flush().context("flushing json decoder")? {
            batches.push(batch);
        }
    }
    concat_batches(&schema, &batches).context("concatenating decoded batches")
}

/// Re-materialises batches as JSON objects; null members are omitted.
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<JsonValue>> {
    if batches.iter().all(|b| b.num_rows() == 0) {
        return Ok(Vec::new());
    }
    let mut writer = ArrayWriter::new(Vec::new());
    writer
        .write_batches(&batches.iter().collect::<Vec<_>>())
        .context("encoding batches as json")?;
    writer.finish().context("finishing json writer")?;
    let buffer = writer.into_inner();
    serde_json::from_slice(&buffer).context("parsing json rows")
}

pub fn encode_parquet(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Bytes> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, None)
        .context("opening parquet writer")?;
    for batch in batches {
        writer.write(batch).context("writing record batch")?;
    }
    writer.close().context("closing parquet writer")?;
    Ok(Bytes::from(buffer))
}

pub fn decode_parquet(bytes: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(bytes).context("reading parquet footer")?;
    let schema = builder.schema().clone();
    let reader = builder.build().context("building parquet reader")?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context("reading record batches")?;
    Ok((schema, batches))
}

pub fn parquet_schema(bytes: Bytes) -> Result<SchemaRef> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(bytes).context("reading parquet footer")?;
    Ok(builder.schema().clone())
}

/// Infers a schema for `rows` and encodes them as one Parquet file.
pub fn rows_to_parquet(rows: &[JsonValue]) -> Result<Bytes> {
    let schema = Arc::new(infer_schema(rows));
    let batch = rows_to_batch(rows, schema.clone())?;
    encode_parquet(schema, &[batch])
}
