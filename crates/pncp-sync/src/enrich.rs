use anyhow::Result;
use pncp_core::domain;
use pncp_core::{ContractRecord, DomainLabels};

/// Post-validation transformation applied to a day's records before filtering.
pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, records: Vec<ContractRecord>) -> Result<Vec<ContractRecord>>;
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, records: Vec<ContractRecord>) -> Result<Vec<ContractRecord>> {
        Ok(records)
    }
}

/// Resolves coded domain values into the `*_dominio` label columns.
///
/// A code missing from the record leaves its label empty; a code present
/// but unknown to the tables gets a generic label such as `"Modalidade 99"`.
#[derive(Default)]
pub struct DomainEnrichmentHook;

impl DomainEnrichmentHook {
    pub fn labels_for(record: &ContractRecord) -> DomainLabels {
        let modality = record
            .modality_id
            .or_else(|| record.upstream_code("modalidadeId"));
        let instrument = record
            .upstream_code("tipoInstrumentoConvocatorioCodigo")
            .or_else(|| record.upstream_code("instrumentoConvocatorioId"));

        DomainLabels {
            modality_name: modality.map(|code| {
                domain::modality(code)
                    .map(|m| m.name.to_string())
                    .unwrap_or_else(|| format!("Modalidade {code}"))
            }),
            modality_description: modality.map(|code| {
                domain::modality(code)
                    .map(|m| m.description.to_string())
                    .unwrap_or_else(|| format!("Modalidade não encontrada: {code}"))
            }),
            purchase_situation_name: label(
                record.upstream_code("situacaoCompraId"),
                domain::purchase_situation_name,
                "Situação",
            ),
            dispute_mode_name: label(
                record.upstream_code("modoDisputaId"),
                domain::dispute_mode_name,
                "Modo",
            ),
            judgement_criterion_name: label(
                record.upstream_code("criterioJulgamentoId"),
                domain::judgement_criterion_name,
                "Critério",
            ),
            convocation_instrument_name: label(
                instrument,
                domain::convocation_instrument_name,
                "Instrumento",
            ),
            sphere_name: record.nested_str("orgaoEntidade", "esferaId").map(|code| {
                domain::sphere_name(code)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Esfera {code}"))
            }),
            power_name: record.nested_str("orgaoEntidade", "poderId").map(|code| {
                domain::power_name(code)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Poder {code}"))
            }),
        }
    }
}

fn label(code: Option<i64>, lookup: fn(i64) -> Option<&'static str>, kind: &str) -> Option<String> {
    code.map(|code| {
        lookup(code)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{kind} {code}"))
    })
}

impl EnrichmentHook for DomainEnrichmentHook {
    fn apply(&self, mut records: Vec<ContractRecord>) -> Result<Vec<ContractRecord>> {
        for record in &mut records {
            let labels = Self::labels_for(record);
            record.apply_labels(labels);
        }
        Ok(records)
    }
}
