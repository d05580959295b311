//! Core domain model for the PNCP contract harvester.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod domain;

pub const CRATE_NAME: &str = "pncp-core";

/// Upstream field carrying the unique PNCP control number of a contract.
pub const CONTROL_NUMBER_FIELD: &str = "numeroControlePNCP";
/// Upstream free-text field the keyword filter reads.
pub const DESCRIPTION_FIELD: &str = "objetoCompra";

/// Why the keyword filter accepted or rejected a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    TermMatch,
    GroupNameMatch,
    NoMatch,
    EmptyDescription,
    FilterDisabled,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::TermMatch => "term_match",
            FilterReason::GroupNameMatch => "group_name_match",
            FilterReason::NoMatch => "no_match",
            FilterReason::EmptyDescription => "empty_description",
            FilterReason::FilterDisabled => "filter_disabled",
        }
    }
}

/// Decision produced by the keyword filter for a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOutcome {
    pub applied: bool,
    pub reason: FilterReason,
    pub matched_group: Option<String>,
    pub matched_term: Option<String>,
}

impl FilterOutcome {
    pub fn rejected(reason: FilterReason) -> Self {
        Self {
            applied: false,
            reason,
            matched_group: None,
            matched_term: None,
        }
    }

    pub fn accepted(reason: FilterReason, group: &str, term: &str) -> Self {
        Self {
            applied: true,
            reason,
            matched_group: Some(group.to_string()),
            matched_term: Some(term.to_string()),
        }
    }
}

/// Human-readable labels resolved from the coded domain values of a record.
///
/// Codes that the static tables do not know are left as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainLabels {
    pub modality_name: Option<String>,
    pub modality_description: Option<String>,
    pub purchase_situation_name: Option<String>,
    pub dispute_mode_name: Option<String>,
    pub judgement_criterion_name: Option<String>,
    pub convocation_instrument_name: Option<String>,
    pub sphere_name: Option<String>,
    pub power_name: Option<String>,
}

/// One procurement contract as persisted in a daily partition file.
///
/// Identifying fields are typed; every other upstream field (nested
/// structures included) is carried verbatim in `upstream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    #[serde(rename = "numeroControlePNCP")]
    pub control_number: String,
    #[serde(rename = "numeroCompra", default)]
    pub purchase_number: Option<String>,
    #[serde(rename = "objetoCompra", default)]
    pub description: Option<String>,
    #[serde(rename = "valorTotalEstimado", default)]
    pub estimated_value: Option<f64>,
    #[serde(rename = "dataPublicacaoPncp", default)]
    pub published_at: Option<String>,
    #[serde(rename = "modalidadeId", default)]
    pub modality_id: Option<i64>,

    #[serde(rename = "modalidade_nome_dominio", default)]
    pub modality_name: Option<String>,
    #[serde(rename = "modalidade_descricao_dominio", default)]
    pub modality_description: Option<String>,
    #[serde(rename = "situacao_compra_nome_dominio", default)]
    pub purchase_situation_name: Option<String>,
    #[serde(rename = "modo_disputa_nome_dominio", default)]
    pub dispute_mode_name: Option<String>,
    #[serde(rename = "criterio_julgamento_nome_dominio", default)]
    pub judgement_criterion_name: Option<String>,
    #[serde(rename = "instrumento_convocatorio_nome_dominio", default)]
    pub convocation_instrument_name: Option<String>,
    #[serde(rename = "esfera_nome_dominio", default)]
    pub sphere_name: Option<String>,
    #[serde(rename = "poder_nome_dominio", default)]
    pub power_name: Option<String>,

    #[serde(rename = "filtro_aplicado", default)]
    pub filter_applied: bool,
    #[serde(rename = "filtro_motivo", default)]
    pub filter_reason: Option<String>,
    #[serde(rename = "filtro_grupo_matched", default)]
    pub filter_matched_group: Option<String>,
    #[serde(rename = "filtro_termo_matched", default)]
    pub filter_matched_term: Option<String>,

    #[serde(rename = "extraction_date", default)]
    pub extraction_date: Option<String>,
    #[serde(rename = "data_publicacao", default)]
    pub partition_date: Option<String>,

    #[serde(flatten)]
    pub upstream: Map<String, JsonValue>,
}

impl ContractRecord {
    /// Organisational unit code, read from the nested `unidadeOrgao` structure.
    pub fn unit_code(&self) -> Option<&str> {
        self.upstream
            .get("unidadeOrgao")
            .and_then(|unit| unit.get("codigoUnidade"))
            .and_then(JsonValue::as_str)
    }

    /// Integer code stored under `key` at the top level of the upstream payload.
    pub fn upstream_code(&self, key: &str) -> Option<i64> {
        self.upstream.get(key).and_then(json_code)
    }

    /// String code stored under `parent.key` in the upstream payload.
    pub fn nested_str(&self, parent: &str, key: &str) -> Option<&str> {
        self.upstream
            .get(parent)
            .and_then(|p| p.get(key))
            .and_then(JsonValue::as_str)
    }

    pub fn apply_labels(&mut self, labels: DomainLabels) {
        self.modality_name = labels.modality_name;
        self.modality_description = labels.modality_description;
        self.purchase_situation_name = labels.purchase_situation_name;
        self.dispute_mode_name = labels.dispute_mode_name;
        self.judgement_criterion_name = labels.judgement_criterion_name;
        self.convocation_instrument_name = labels.convocation_instrument_name;
        self.sphere_name = labels.sphere_name;
        self.power_name = labels.power_name;
    }

    pub fn apply_outcome(&mut self, outcome: &FilterOutcome) {
        self.filter_applied = outcome.applied;
        self.filter_reason = Some(outcome.reason.as_str().to_string());
        self.filter_matched_group = outcome.matched_group.clone();
        self.filter_matched_term = outcome.matched_term.clone();
    }

    /// Serialises the record into the flat JSON row written to Parquet.
    ///
    /// Known nested fields carry their full member set, so a day where every
    /// record lacks one still writes a typed structure instead of a null column.
    pub fn to_row(&self) -> serde_json::Result<JsonValue> {
        let mut row = serde_json::to_value(self)?;
        if let JsonValue::Object(map) = &mut row {
            domain::pad_nested_fields(map);
        }
        Ok(row)
    }
}

fn json_code(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Upstream record after boundary validation.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    /// Matches the known contract shape and can enter the typed pipeline.
    Known(Box<ContractRecord>),
    /// Could not be validated; kept for counting and diagnostics only.
    Raw { value: JsonValue, problem: String },
}

impl SourceRecord {
    /// Validates one upstream JSON value against the known contract shape.
    pub fn validate(value: JsonValue) -> Self {
        let Some(object) = value.as_object() else {
            return SourceRecord::Raw {
                value,
                problem: "record is not a JSON object".to_string(),
            };
        };
        match object.get(CONTROL_NUMBER_FIELD).and_then(JsonValue::as_str) {
            Some(id) if !id.trim().is_empty() => {}
            _ => {
                return SourceRecord::Raw {
                    value,
                    problem: format!("missing {CONTROL_NUMBER_FIELD}"),
                }
            }
        }
        match serde_json::from_value::<ContractRecord>(value.clone()) {
            Ok(record) => SourceRecord::Known(Box::new(record)),
            Err(err) => SourceRecord::Raw {
                value,
                problem: err.to_string(),
            },
        }
    }
}

/// Relative path of the daily partition file for `date` under `prefix`.
pub fn partition_path(prefix: &str, date: NaiveDate) -> String {
    format!(
        "{}/year={}/month={:02}/contracts_{}.parquet",
        prefix.trim_end_matches('/'),
        date.year(),
        date.month(),
        date.format("%Y%m%d")
    )
}

/// Recovers the extraction date encoded in a partition file name.
pub fn date_from_partition_path(path: &str) -> Option<NaiveDate> {
    let file_name = path.rsplit('/').next()?;
    let stamp = file_name
        .strip_prefix("contracts_")?
        .strip_suffix(".parquet")?;
    NaiveDate::parse_from_str(stamp, "%Y%m%d").ok()
}
