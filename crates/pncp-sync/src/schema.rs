//! Canonical schema profiling and column conformance.
//!
//! A [`SchemaProfile`] is the join of every observed schema under
//! [`merge_types`]. Files are then conformed to that single profile, never to
//! each other.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::{new_empty_array, new_null_array, Array, ArrayRef, ListArray, RecordBatch, RecordBatchOptions, StructArray};
use arrow_buffer::OffsetBuffer;
use arrow_cast::{can_cast_types, cast_with_options, CastOptions};
use arrow_schema::{ArrowError, DataType, Field, FieldRef, Fields, Schema, SchemaRef};
use thiserror::Error;

fn list_of(item: DataType) -> DataType {
    DataType::List(Arc::new(Field::new("item", item, true)))
}

fn is_integer(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
    )
}

fn is_numeric(dt: &DataType) -> bool {
    is_integer(dt) || matches!(dt, DataType::Float16 | DataType::Float32 | DataType::Float64)
}

fn merge_struct_fields(a: &Fields, b: &Fields) -> Fields {
    let mut merged: Vec<Field> = a
        .iter()
        .map(|fa| {
            let dt = match b.find(fa.name()) {
                Some((_, fb)) => merge_types(fa.data_type(), fb.data_type()),
                None => merge_types(fa.data_type(), &DataType::Null),
            };
            Field::new(fa.name(), dt, true)
        })
        .collect();
    for fb in b.iter() {
        if a.find(fb.name()).is_none() {
            merged.push(Field::new(fb.name(), merge_types(&DataType::Null, fb.data_type()), true));
        }
    }
    merged.into()
}

/// Least upper bound of two observed types.
///
/// Null yields to anything; structs take the union of their members in
/// first-seen order; lists merge their items; a struct meeting a list becomes
/// a list of the merged struct; integers widen to `Float64` against floats.
/// Any other conflict, nested against primitive included, becomes `Utf8`,
/// which holds every value (nested ones as JSON text). Every produced field
/// is nullable.
pub fn merge_types(a: &DataType, b: &DataType) -> DataType {
    match (a, b) {
        (DataType::Null, DataType::Null) => DataType::Null,
        (DataType::Null, t) | (t, DataType::Null) => merge_types(t, t),
        (DataType::Struct(fa), DataType::Struct(fb)) => DataType::Struct(merge_struct_fields(fa, fb)),
        (DataType::List(ia), DataType::List(ib)) => {
            list_of(merge_types(ia.data_type(), ib.data_type()))
        }
        (DataType::Struct(_), DataType::List(item)) | (DataType::List(item), DataType::Struct(_)) => {
            let single = if matches!(a, DataType::Struct(_)) { a } else { b };
            list_of(merge_types(item.data_type(), single))
        }
        (x, y) if x == y => x.clone(),
        (x, y) if is_integer(x) && is_integer(y) => DataType::Int64,
        (x, y) if is_numeric(x) && is_numeric(y) => DataType::Float64,
        _ => DataType::Utf8,
    }
}

/// Shape equality ignoring nullability, list item names and metadata.
pub fn same_shape(a: &DataType, b: &DataType) -> bool {
    match (a, b) {
        (DataType::Struct(fa), DataType::Struct(fb)) => {
            fa.len() == fb.len()
                && fa.iter().zip(fb.iter()).all(|(x, y)| {
                    x.name() == y.name() && same_shape(x.data_type(), y.data_type())
                })
        }
        (DataType::List(ia), DataType::List(ib)) => same_shape(ia.data_type(), ib.data_type()),
        _ => a == b,
    }
}

/// Canonical ordered mapping of top-level field name to Arrow type.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaProfile {
    fields: Fields,
}

impl SchemaProfile {
    /// Joins `schemas`, keeping fields in first-seen order.
    pub fn derive<'a>(schemas: impl IntoIterator<Item = &'a Schema>) -> Self {
        let mut order: Vec<(String, DataType)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for schema in schemas {
            for field in schema.fields() {
                match index.get(field.name()) {
                    Some(&i) => order[i].1 = merge_types(&order[i].1, field.data_type()),
                    None => {
                        index.insert(field.name().clone(), order.len());
                        order.push((field.name().clone(), merge_types(field.data_type(), field.data_type())));
                    }
                }
            }
        }
        Self {
            fields: order
                .into_iter()
                .map(|(name, dt)| Field::new(name, dt, true))
                .collect(),
        }
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldRef> {
        self.fields.find(name).map(|(_, f)| f)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_schema(&self) -> Schema {
        Schema::new(self.fields.clone())
    }

    /// Profile fields `schema` lacks or carries with a different shape.
    pub fn mismatches(&self, schema: &Schema) -> Vec<String> {
        self.fields
            .iter()
            .filter(|expected| match schema.field_with_name(expected.name()) {
                Ok(actual) => !same_shape(actual.data_type(), expected.data_type()),
                Err(_) => true,
            })
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn conforms(&self, schema: &Schema) -> bool {
        self.mismatches(schema).is_empty()
    }

    /// Profile fields followed by `schema`'s fields the profile does not name.
    pub fn schema_with_extras(&self, schema: &Schema) -> SchemaRef {
        let mut fields: Vec<FieldRef> = self.fields.iter().cloned().collect();
        fields.extend(
            schema
                .fields()
                .iter()
                .filter(|f| self.fields.find(f.name()).is_none())
                .cloned(),
        );
        Arc::new(Schema::new(fields))
    }

    /// Dotted paths of nested struct members in `schema` the profile would drop.
    pub fn unknown_members(&self, schema: &Schema) -> Vec<String> {
        let mut out = Vec::new();
        for field in schema.fields() {
            if let Some(expected) = self.field(field.name()) {
                collect_unknown(field.name(), field.data_type(), expected.data_type(), &mut out);
            }
        }
        out
    }
}

fn collect_unknown(path: &str, actual: &DataType, expected: &DataType, out: &mut Vec<String>) {
    match (actual, expected) {
        (DataType::Struct(fa), DataType::Struct(fe)) => {
            for member in fa.iter() {
                let member_path = format!("{path}.{}", member.name());
                match fe.find(member.name()) {
                    Some((_, e)) => collect_unknown(&member_path, member.data_type(), e.data_type(), out),
                    None => out.push(member_path),
                }
            }
        }
        (DataType::List(ia), DataType::List(ie)) => {
            collect_unknown(path, ia.data_type(), ie.data_type(), out)
        }
        (DataType::Struct(_), DataType::List(ie)) => collect_unknown(path, actual, ie.data_type(), out),
        _ => {}
    }
}

#[derive(Debug, Error)]
pub enum ConformError {
    #[error("cannot patch {from} into {to}")]
    Irreconcilable { from: DataType, to: DataType },
    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

/// Value a column takes where no data was recorded for a `target` field.
///
/// Structs become present values with every member null, lists become empty.
pub fn placeholder_array(target: &DataType, len: usize) -> ArrayRef {
    match target {
        DataType::Struct(fields) => {
            let children = fields
                .iter()
                .map(|f| new_null_array(f.data_type(), len))
                .collect::<Vec<_>>();
            Arc::new(StructArray::new(fields.clone(), children, None))
        }
        DataType::List(item) => Arc::new(ListArray::new(
            item.clone(),
            OffsetBuffer::new_zeroed(len),
            new_empty_array(item.data_type()),
            None,
        )),
        other => new_null_array(other, len),
    }
}

/// Rewrites `array` so its type is exactly `target`, keeping every value.
pub fn conform_array(array: &ArrayRef, target: &DataType) -> Result<ArrayRef, ConformError> {
    let actual = array.data_type();
    if actual == target {
        return Ok(array.clone());
    }
    match (actual, target) {
        (DataType::Null, _) => Ok(placeholder_array(target, array.len())),
        (DataType::Struct(_), DataType::Struct(fields)) => {
            let source = array.as_struct();
            for member in source.fields().iter() {
                if fields.find(member.name()).is_none() {
                    return Err(ConformError::Irreconcilable {
                        from: actual.clone(),
                        to: target.clone(),
                    });
                }
            }
            let children = fields
                .iter()
                .map(|f| match source.column_by_name(f.name()) {
                    Some(column) => conform_array(column, f.data_type()),
                    None => Ok(new_null_array(f.data_type(), source.len())),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(StructArray::try_new(
                fields.clone(),
                children,
                source.nulls().cloned(),
            )?))
        }
        (DataType::List(_), DataType::List(item)) => {
            let source = array.as_list::<i32>();
            let values = conform_array(source.values(), item.data_type())?;
            Ok(Arc::new(ListArray::try_new(
                item.clone(),
                source.offsets().clone(),
                values,
                source.nulls().cloned(),
            )?))
        }
        (DataType::Struct(_) | DataType::List(_), _) | (_, DataType::Struct(_) | DataType::List(_)) => {
            Err(ConformError::Irreconcilable {
                from: actual.clone(),
                to: target.clone(),
            })
        }
        _ if can_cast_types(actual, target) => {
            let options = CastOptions {
                safe: false,
                ..Default::default()
            };
            Ok(cast_with_options(array, target, &options)?)
        }
        _ => Err(ConformError::Irreconcilable {
            from: actual.clone(),
            to: target.clone(),
        }),
    }
}

/// Patches one batch to the profile; columns outside the profile follow the canonical ones.
pub fn conform_batch(batch: &RecordBatch, profile: &SchemaProfile) -> Result<RecordBatch, ConformError> {
    let rows = batch.num_rows();
    let mut columns = Vec::with_capacity(profile.fields().len());
    for field in profile.fields() {
        let column = match batch.column_by_name(field.name()) {
            Some(column) => conform_array(column, field.data_type())?,
            None => placeholder_array(field.data_type(), rows),
        };
        columns.push(column);
    }
    let schema = profile.schema_with_extras(&batch.schema());
    for extra in schema.fields().iter().skip(profile.fields().len()) {
        if let Some(column) = batch.column_by_name(extra.name()) {
            columns.push(column.clone());
        }
    }
    let options = RecordBatchOptions::new().with_row_count(Some(rows));
    Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Int64Array, StringArray};

    fn unit_struct() -> DataType {
        DataType::Struct(
            vec![
                Field::new("codigo", DataType::Utf8, true),
                Field::new("nome", DataType::Utf8, true),
            ]
            .into(),
        )
    }

    fn schema(fields: Vec<(&str, DataType)>) -> Schema {
        Schema::new(
            fields
                .into_iter()
                .map(|(n, dt)| Field::new(n, dt, true))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn structure_wins_over_absent_placeholder_in_either_order() {
        let a = schema(vec![("unidadeOrgao", DataType::Null)]);
        let b = schema(vec![("unidadeOrgao", unit_struct())]);
        for profile in [SchemaProfile::derive([&a, &b]), SchemaProfile::derive([&b, &a])] {
            assert_eq!(profile.field("unidadeOrgao").unwrap().data_type(), &unit_struct());
        }
    }

    #[test]
    fn conflicting_struct_shapes_resolve_to_member_union() {
        let a = DataType::Struct(vec![Field::new("codigo", DataType::Int64, true)].into());
        let b = DataType::Struct(
            vec![
                Field::new("nome", DataType::Utf8, true),
                Field::new("codigo", DataType::Float64, true),
            ]
            .into(),
        );
        let DataType::Struct(members) = merge_types(&a, &b) else {
            panic!("expected struct");
        };
        let names = members.iter().map(|f| f.name().as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["codigo", "nome"]);
        assert_eq!(members[0].data_type(), &DataType::Float64);
    }

    #[test]
    fn lattice_handles_lists_and_primitive_conflicts() {
        assert_eq!(merge_types(&DataType::Int64, &DataType::Utf8), DataType::Utf8);
        assert_eq!(merge_types(&DataType::Boolean, &DataType::Int64), DataType::Utf8);
        assert_eq!(merge_types(&DataType::Int32, &DataType::Int64), DataType::Int64);
        assert_eq!(
            merge_types(&unit_struct(), &list_of(DataType::Null)),
            list_of(unit_struct())
        );
    }

    #[test]
    fn nested_against_primitive_resolves_to_text() {
        assert_eq!(merge_types(&DataType::Utf8, &unit_struct()), DataType::Utf8);
        assert_eq!(merge_types(&unit_struct(), &DataType::Utf8), DataType::Utf8);
        assert_eq!(merge_types(&list_of(DataType::Int64), &DataType::Boolean), DataType::Utf8);
        let a = schema(vec![("amparoLegal", DataType::Utf8)]);
        let b = schema(vec![("amparoLegal", unit_struct())]);
        for profile in [SchemaProfile::derive([&a, &b]), SchemaProfile::derive([&b, &a])] {
            assert_eq!(profile.field("amparoLegal").unwrap().data_type(), &DataType::Utf8);
        }
    }

    #[test]
    fn null_column_becomes_struct_with_null_members() {
        let column: ArrayRef = Arc::new(arrow_array::NullArray::new(2));
        let patched = conform_array(&column, &unit_struct()).unwrap();
        let patched = patched.as_struct();
        assert_eq!(patched.null_count(), 0);
        assert!(patched.column_by_name("codigo").unwrap().is_null(0));
        assert!(patched.column_by_name("nome").unwrap().is_null(1));

        let list = conform_array(&column, &list_of(unit_struct())).unwrap();
        assert_eq!(list.as_list::<i32>().value_length(0), 0);
    }

    #[test]
    fn struct_members_are_added_and_reordered() {
        let source: ArrayRef = Arc::new(StructArray::from(vec![(
            Arc::new(Field::new("nome", DataType::Utf8, true)),
            Arc::new(StringArray::from(vec![Some("SEDE")])) as ArrayRef,
        )]));
        let patched = conform_array(&source, &unit_struct()).unwrap();
        assert_eq!(patched.data_type(), &unit_struct());
        let patched = patched.as_struct();
        assert!(patched.column(0).is_null(0));
        assert_eq!(patched.column(1).as_string::<i32>().value(0), "SEDE");
    }

    #[test]
    fn primitive_where_struct_expected_is_irreconcilable() {
        let source: ArrayRef = Arc::new(StringArray::from(vec!["x"]));
        assert!(matches!(
            conform_array(&source, &unit_struct()),
            Err(ConformError::Irreconcilable { .. })
        ));
        let lossy: ArrayRef = Arc::new(StringArray::from(vec!["abc"]));
        assert!(conform_array(&lossy, &DataType::Int64).is_err());
    }

    #[test]
    fn batches_gain_missing_columns_and_keep_extras() {
        let profile = SchemaProfile::derive([&schema(vec![
            ("numeroControlePNCP", DataType::Utf8),
            ("unidadeOrgao", unit_struct()),
        ])]);
        let batch = RecordBatch::try_new(
            Arc::new(schema(vec![
                ("extra", DataType::Int64),
                ("numeroControlePNCP", DataType::Utf8),
            ])),
            vec![
                Arc::new(Int64Array::from(vec![7])),
                Arc::new(StringArray::from(vec!["1"])),
            ],
        )
        .unwrap();
        let patched = conform_batch(&batch, &profile).unwrap();
        let names = patched
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["numeroControlePNCP", "unidadeOrgao", "extra"]);
        assert!(profile.conforms(&patched.schema()));
        assert!(!profile.conforms(&batch.schema()));
        assert_eq!(profile.mismatches(&batch.schema()), vec!["unidadeOrgao".to_string()]);
    }
}
