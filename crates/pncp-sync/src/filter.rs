//! Keyword acceptance filter over the `objetoCompra` description.
//!
//! Matching is whole-token and insensitive to case and diacritics: both the
//! description and every configured term go through [`normalize`] and
//! [`tokenize`], and a term matches when its token sequence appears as a
//! consecutive run in the description's tokens.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use pncp_core::{ContractRecord, FilterOutcome, FilterReason};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Canonical decomposition, combining marks dropped, lowercased.
pub fn normalize(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn tokenize(normalized: &str) -> Vec<&str> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect()
}

fn contains_run(haystack: &[&str], needle: &[String]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window.iter().zip(needle).all(|(a, b)| *a == b.as_str()))
}

/// Named set of terms, in the order they were configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub name: String,
    pub terms: Vec<String>,
}

/// Loads `group -> [terms]` from a JSON or YAML mapping, keeping file order.
pub fn load_groups(path: &Path) -> Result<Vec<FilterGroup>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading filter groups {}", path.display()))?;
    parse_groups(&raw).with_context(|| format!("parsing filter groups {}", path.display()))
}

pub fn parse_groups(raw: &str) -> Result<Vec<FilterGroup>> {
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(raw)?;
    let mut groups = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let Some(name) = key.as_str() else {
            bail!("filter group names must be strings, found {key:?}");
        };
        let terms: Vec<String> = serde_yaml::from_value(value)
            .with_context(|| format!("terms of group {name} must be a list of strings"))?;
        groups.push(FilterGroup {
            name: name.to_string(),
            terms,
        });
    }
    Ok(groups)
}

#[derive(Debug, Clone)]
struct CompiledTerm {
    original: String,
    tokens: Vec<String>,
}

impl CompiledTerm {
    fn new(original: &str) -> Self {
        let normalized = normalize(original);
        Self {
            original: original.to_string(),
            tokens: tokenize(&normalized).into_iter().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledGroup {
    name: CompiledTerm,
    terms: Vec<CompiledTerm>,
}

/// Pure decision function over a fixed set of groups.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    enabled: bool,
    match_group_names: bool,
    groups: Vec<CompiledGroup>,
}

impl FilterEngine {
    pub fn new(groups: &[FilterGroup], match_group_names: bool) -> Self {
        Self {
            enabled: true,
            match_group_names,
            groups: groups
                .iter()
                .map(|g| CompiledGroup {
                    name: CompiledTerm::new(&g.name),
                    terms: g.terms.iter().map(|t| CompiledTerm::new(t)).collect(),
                })
                .collect(),
        }
    }

    /// Engine that accepts everything with reason `filter_disabled`.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            match_group_names: false,
            groups: Vec::new(),
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn decide(&self, record: &ContractRecord) -> FilterOutcome {
        self.decide_text(record.description.as_deref())
    }

    pub fn decide_text(&self, description: Option<&str>) -> FilterOutcome {
        if !self.enabled {
            return FilterOutcome {
                applied: true,
                reason: FilterReason::FilterDisabled,
                matched_group: None,
                matched_term: None,
            };
        }
        let description = description.map(str::trim).unwrap_or_default();
        if description.is_empty() {
            return FilterOutcome::rejected(FilterReason::EmptyDescription);
        }

        let normalized = normalize(description);
        let tokens = tokenize(&normalized);
        for group in &self.groups {
            if self.match_group_names && contains_run(&tokens, &group.name.tokens) {
                return FilterOutcome::accepted(
                    FilterReason::GroupNameMatch,
                    &group.name.original,
                    &group.name.original,
                );
            }
            if let Some(term) = group.terms.iter().find(|t| contains_run(&tokens, &t.tokens)) {
                return FilterOutcome::accepted(
                    FilterReason::TermMatch,
                    &group.name.original,
                    &term.original,
                );
            }
        }
        FilterOutcome::rejected(FilterReason::NoMatch)
    }
}

/// Counters accumulated from filter outcomes, outside the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    pub analysed: u64,
    pub approved: u64,
    pub rejected: u64,
    pub by_group: BTreeMap<String, u64>,
    pub by_term: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterReport {
    pub analysed: u64,
    pub approved: u64,
    pub rejected: u64,
    pub approval_rate_percent: f64,
    pub top_groups: Vec<(String, u64)>,
    pub top_terms: Vec<(String, u64)>,
}

impl FilterStats {
    pub fn record(&mut self, outcome: &FilterOutcome) {
        self.analysed += 1;
        if !outcome.applied {
            self.rejected += 1;
            return;
        }
        self.approved += 1;
        if let Some(group) = &outcome.matched_group {
            *self.by_group.entry(group.clone()).or_default() += 1;
        }
        if let Some(term) = &outcome.matched_term {
            *self.by_term.entry(term.clone()).or_default() += 1;
        }
    }

    pub fn merge(&mut self, other: &FilterStats) {
        self.analysed += other.analysed;
        self.approved += other.approved;
        self.rejected += other.rejected;
        for (k, v) in &other.by_group {
            *self.by_group.entry(k.clone()).or_default() += v;
        }
        for (k, v) in &other.by_term {
            *self.by_term.entry(k.clone()).or_default() += v;
        }
    }

    pub fn approval_rate_percent(&self) -> f64 {
        if self.analysed == 0 {
            return 0.0;
        }
        let rate = self.approved as f64 / self.analysed as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    }

    pub fn report(&self, top: usize) -> FilterReport {
        FilterReport {
            analysed: self.analysed,
            approved: self.approved,
            rejected: self.rejected,
            approval_rate_percent: self.approval_rate_percent(),
            top_groups: top_n(&self.by_group, top),
            top_terms: top_n(&self.by_term, top),
        }
    }
}

fn top_n(counts: &BTreeMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<_> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    // stable sort keeps name order among equal counts
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.truncate(n);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(groups: &[(&str, &[&str])]) -> FilterEngine {
        let groups = groups
            .iter()
            .map(|(name, terms)| FilterGroup {
                name: name.to_string(),
                terms: terms.iter().map(|t| t.to_string()).collect(),
            })
            .collect::<Vec<_>>();
        FilterEngine::new(&groups, true)
    }

    #[test]
    fn whole_word_match_records_group_and_term() {
        let engine = engine(&[("AUDIO", &["fone"])]);

        let outcome = engine.decide_text(Some("Fone de ouvido bluetooth"));
        assert!(outcome.applied);
        assert_eq!(outcome.reason, FilterReason::TermMatch);
        assert_eq!(outcome.matched_group.as_deref(), Some("AUDIO"));
        assert_eq!(outcome.matched_term.as_deref(), Some("fone"));

        let outcome = engine.decide_text(Some("telefone"));
        assert!(!outcome.applied);
        assert_eq!(outcome.reason, FilterReason::NoMatch);
        assert_eq!(outcome.matched_group, None);
    }

    #[test]
    fn decision_ignores_case_and_diacritics() {
        let engine = engine(&[("PAPELARIA", &["lápis", "caneta esferográfica"])]);
        let variants = [
            "Compra de lapis de cor",
            "COMPRA DE LÁPIS DE COR",
            "compra de Lápis de cor",
        ];
        let first = engine.decide_text(Some(variants[0]));
        assert!(first.applied);
        for variant in &variants[1..] {
            assert_eq!(engine.decide_text(Some(variant)), first);
        }

        let multi = engine.decide_text(Some("Canetas; CANETA-Esferografica azul"));
        assert_eq!(multi.matched_term.as_deref(), Some("caneta esferográfica"));
        assert!(!engine.decide_text(Some("caneta azul esferografica")).applied);
    }

    #[test]
    fn first_group_in_configuration_order_wins() {
        let engine = engine(&[("INFORMATICA", &["cabo"]), ("ELETRICA", &["cabo", "fio"])]);
        let outcome = engine.decide_text(Some("cabo de rede e fio"));
        assert_eq!(outcome.matched_group.as_deref(), Some("INFORMATICA"));
    }

    #[test]
    fn group_name_is_tried_before_its_terms() {
        let engine = engine(&[("Microfone", &["lapela"])]);
        let outcome = engine.decide_text(Some("microfone de lapela"));
        assert_eq!(outcome.reason, FilterReason::GroupNameMatch);
        assert_eq!(outcome.matched_term.as_deref(), Some("Microfone"));

        let groups = vec![FilterGroup {
            name: "Microfone".into(),
            terms: vec!["lapela".into()],
        }];
        let without_names = FilterEngine::new(&groups, false);
        let outcome = without_names.decide_text(Some("microfone de lapela"));
        assert_eq!(outcome.reason, FilterReason::TermMatch);
    }

    #[test]
    fn empty_and_disabled_cases() {
        let engine = engine(&[("AUDIO", &["fone"])]);
        assert_eq!(
            engine.decide_text(Some("   ")).reason,
            FilterReason::EmptyDescription
        );
        assert_eq!(engine.decide_text(None).reason, FilterReason::EmptyDescription);

        let disabled = FilterEngine::disabled().decide_text(Some("qualquer coisa"));
        assert!(disabled.applied);
        assert_eq!(disabled.reason, FilterReason::FilterDisabled);
    }

    #[test]
    fn groups_parse_from_json_and_yaml_in_file_order() {
        let json = r#"{"ZETA": ["z"], "ALFA": ["a", "b"]}"#;
        let groups = parse_groups(json).unwrap();
        assert_eq!(groups[0].name, "ZETA");
        assert_eq!(groups[1].terms, vec!["a".to_string(), "b".to_string()]);

        let yaml = "AUDIO:\n  - fone\n  - caixa de som\n";
        let groups = parse_groups(yaml).unwrap();
        assert_eq!(groups[0].terms[1], "caixa de som");

        assert!(parse_groups("AUDIO: 3").is_err());
    }

    #[test]
    fn stats_accumulate_and_rank() {
        let engine = engine(&[("AUDIO", &["fone", "microfone"]), ("VIDEO", &["camera"])]);
        let mut stats = FilterStats::default();
        for text in ["fone", "fone", "camera", "nada", "microfone"] {
            stats.record(&engine.decide_text(Some(text)));
        }
        assert_eq!(stats.analysed, 5);
        assert_eq!(stats.approved, 4);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.approval_rate_percent(), 80.0);

        let report = stats.report(1);
        assert_eq!(report.top_groups, vec![("AUDIO".to_string(), 3)]);
        assert_eq!(report.top_terms, vec![("fone".to_string(), 2)]);

        let mut total = FilterStats::default();
        total.merge(&stats);
        total.merge(&stats);
        assert_eq!(total.by_group["VIDEO"], 2);
    }
}
