//! Static PNCP domain tables (https://pncp.gov.br/app/entidades-dominio).

use serde_json::{Map, Value as JsonValue};

/// Entry of a coded domain table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainEntry<K: 'static> {
    pub code: K,
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modality {
    pub code: i64,
    pub name: &'static str,
    pub description: &'static str,
    pub active: bool,
}

pub const MODALITIES: &[Modality] = &[
    Modality { code: 1, name: "Leilão - Eletrônico", description: "Alienação de bens imóveis ou de bens móveis inservíveis ou legalmente apreendidos a quem oferecer o maior lance", active: true },
    Modality { code: 2, name: "Diálogo Competitivo", description: "Contratação de obras, serviços e fornecimentos quando não é possível definir previamente a solução técnica mais adequada", active: true },
    Modality { code: 3, name: "Concurso", description: "Escolha de trabalho técnico, científico ou artístico", active: true },
    Modality { code: 4, name: "Concorrência - Eletrônica", description: "Licitação entre quaisquer interessados que comprovem os requisitos mínimos de qualificação exigidos no edital", active: true },
    Modality { code: 5, name: "Concorrência - Presencial", description: "Licitação entre quaisquer interessados que comprovem os requisitos mínimos de qualificação exigidos no edital", active: true },
    Modality { code: 6, name: "Pregão - Eletrônico", description: "Aquisição de bens e serviços comuns, qualquer que seja o valor estimado da contratação", active: true },
    Modality { code: 7, name: "Pregão - Presencial", description: "Aquisição de bens e serviços comuns, realizada de forma presencial", active: true },
    Modality { code: 8, name: "Dispensa", description: "Contratação direta em que a licitação é dispensada por determinação legal", active: true },
    Modality { code: 9, name: "Inexigibilidade", description: "Contratação direta em que a competição é impossível", active: true },
    Modality { code: 10, name: "Manifestação de Interesse", description: "Manifestação de interesse privado para posterior abertura de processo licitatório ou contratação direta", active: true },
    Modality { code: 11, name: "Pré-qualificação", description: "Procedimento anterior à licitação para identificar licitantes habilitados", active: true },
    Modality { code: 12, name: "Credenciamento", description: "Seleção de interessados em prestar serviços ou fornecer bens de forma não exclusiva", active: true },
    Modality { code: 13, name: "Leilão - Presencial", description: "Alienação de bens sob a forma presencial a quem oferecer o maior lance", active: true },
];

pub const PURCHASE_SITUATIONS: &[DomainEntry<i64>] = &[
    DomainEntry { code: 1, name: "Divulgada no PNCP", description: "Contratação divulgada no Portal Nacional de Contratações Públicas" },
    DomainEntry { code: 2, name: "Em Andamento", description: "Processo de contratação em andamento" },
    DomainEntry { code: 3, name: "Anulada", description: "Processo de contratação anulado" },
    DomainEntry { code: 4, name: "Cancelada", description: "Processo de contratação cancelado" },
    DomainEntry { code: 5, name: "Concluída", description: "Processo de contratação concluído" },
    DomainEntry { code: 6, name: "Suspensa", description: "Processo de contratação suspenso temporariamente" },
];

pub const DISPUTE_MODES: &[DomainEntry<i64>] = &[
    DomainEntry { code: 1, name: "Aberto", description: "Propostas apresentadas de forma aberta" },
    DomainEntry { code: 2, name: "Fechado", description: "Propostas apresentadas de forma sigilosa" },
    DomainEntry { code: 3, name: "Aberto-Fechado", description: "Primeira fase aberta, segunda fase fechada" },
    DomainEntry { code: 4, name: "Fechado-Aberto", description: "Primeira fase fechada, segunda fase aberta" },
];

pub const JUDGEMENT_CRITERIA: &[DomainEntry<i64>] = &[
    DomainEntry { code: 1, name: "Menor preço", description: "Menor preço ofertado" },
    DomainEntry { code: 2, name: "Maior desconto", description: "Maior desconto oferecido" },
    DomainEntry { code: 3, name: "Melhor técnica", description: "Qualidade técnica" },
    DomainEntry { code: 4, name: "Técnica e preço", description: "Combina aspectos técnicos e preço" },
    DomainEntry { code: 5, name: "Maior lance", description: "Maior lance oferecido (leilões)" },
    DomainEntry { code: 6, name: "Maior oferta", description: "Maior oferta" },
];

pub const CONVOCATION_INSTRUMENTS: &[DomainEntry<i64>] = &[
    DomainEntry { code: 1, name: "Edital", description: "Leilão, pregão, concorrência, concurso e diálogo competitivo" },
    DomainEntry { code: 2, name: "Aviso de Contratação Direta", description: "Contratação direta" },
    DomainEntry { code: 3, name: "Ato que autoriza a Contratação Direta", description: "Dispensa com disputa" },
    DomainEntry { code: 4, name: "Edital de Chamamento Público", description: "Processos auxiliares" },
];

pub const SPHERES: &[DomainEntry<&str>] = &[
    DomainEntry { code: "F", name: "Federal", description: "Administração Pública Federal" },
    DomainEntry { code: "E", name: "Estadual", description: "Administração Pública Estadual" },
    DomainEntry { code: "M", name: "Municipal", description: "Administração Pública Municipal" },
];

pub const POWERS: &[DomainEntry<&str>] = &[
    DomainEntry { code: "E", name: "Executivo", description: "Poder Executivo" },
    DomainEntry { code: "L", name: "Legislativo", description: "Poder Legislativo" },
    DomainEntry { code: "J", name: "Judiciário", description: "Poder Judiciário" },
    DomainEntry { code: "N", name: "Não Especificado", description: "Poder não especificado ou outros" },
];

fn lookup<K: PartialEq + Copy>(table: &'static [DomainEntry<K>], code: K) -> Option<&'static DomainEntry<K>> {
    table.iter().find(|entry| entry.code == code)
}

pub fn modality(code: i64) -> Option<&'static Modality> {
    MODALITIES.iter().find(|m| m.code == code)
}

/// Codes of every modality flagged active, in table order.
pub fn active_modalities() -> Vec<i64> {
    MODALITIES.iter().filter(|m| m.active).map(|m| m.code).collect()
}

pub fn purchase_situation_name(code: i64) -> Option<&'static str> {
    lookup(PURCHASE_SITUATIONS, code).map(|e| e.name)
}

pub fn dispute_mode_name(code: i64) -> Option<&'static str> {
    lookup(DISPUTE_MODES, code).map(|e| e.name)
}

pub fn judgement_criterion_name(code: i64) -> Option<&'static str> {
    lookup(JUDGEMENT_CRITERIA, code).map(|e| e.name)
}

pub fn convocation_instrument_name(code: i64) -> Option<&'static str> {
    lookup(CONVOCATION_INSTRUMENTS, code).map(|e| e.name)
}

pub fn sphere_name(code: &str) -> Option<&'static str> {
    SPHERES.iter().find(|e| e.code == code.trim()).map(|e| e.name)
}

pub fn power_name(code: &str) -> Option<&'static str> {
    POWERS.iter().find(|e| e.code == code.trim()).map(|e| e.name)
}

const UNIT_MEMBERS: &[&str] = &[
    "codigoIbge",
    "codigoUnidade",
    "municipioNome",
    "nomeUnidade",
    "ufNome",
    "ufSigla",
];
const AGENCY_MEMBERS: &[&str] = &["cnpj", "esferaId", "poderId", "razaoSocial"];
const LEGAL_BASIS_MEMBERS: &[&str] = &["codigo", "descricao", "nome"];
const BUDGET_SOURCE_MEMBERS: &[&str] = &["codigo", "dataInclusao", "descricao", "nome"];

/// Persisted shape of a nested upstream field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedShape {
    Struct(&'static [&'static str]),
    ListOf(&'static [&'static str]),
}

/// Nested fields written with their full member set on every record.
pub const NESTED_FIELDS: &[(&str, NestedShape)] = &[
    ("unidadeOrgao", NestedShape::Struct(UNIT_MEMBERS)),
    ("orgaoEntidade", NestedShape::Struct(AGENCY_MEMBERS)),
    ("amparoLegal", NestedShape::Struct(LEGAL_BASIS_MEMBERS)),
    ("unidadeSubRogada", NestedShape::Struct(UNIT_MEMBERS)),
    ("orgaoSubRogado", NestedShape::Struct(AGENCY_MEMBERS)),
    ("fontesOrcamentarias", NestedShape::ListOf(BUDGET_SOURCE_MEMBERS)),
];

fn padded_object(members: &[&str], existing: Option<Map<String, JsonValue>>) -> JsonValue {
    let mut object = existing.unwrap_or_default();
    for member in members {
        object.entry(*member).or_insert(JsonValue::Null);
    }
    JsonValue::Object(object)
}

/// Gives every [`NESTED_FIELDS`] entry of `row` its canonical members.
///
/// Absent or null structures become objects of null members, absent or null
/// lists become empty. Values of any other type are left as they are.
pub fn pad_nested_fields(row: &mut Map<String, JsonValue>) {
    for (name, shape) in NESTED_FIELDS {
        let slot = row.entry(*name).or_insert(JsonValue::Null);
        match (shape, slot.take()) {
            (NestedShape::Struct(members), JsonValue::Null) => *slot = padded_object(members, None),
            (NestedShape::Struct(members), JsonValue::Object(map)) => {
                *slot = padded_object(members, Some(map))
            }
            (NestedShape::ListOf(_), JsonValue::Null) => *slot = JsonValue::Array(Vec::new()),
            (NestedShape::ListOf(members), JsonValue::Array(items)) => {
                *slot = JsonValue::Array(
                    items
                        .into_iter()
                        .map(|item| match item {
                            JsonValue::Null => padded_object(members, None),
                            JsonValue::Object(map) => padded_object(members, Some(map)),
                            other => other,
                        })
                        .collect(),
                )
            }
            (_, other) => *slot = other,
        }
    }
}
