//! Two-tier declarative/procedural rule cascade, grounded on
//! `rule_processor.py`'s `RuleProcessor`. Declarative rules run first (lower
//! `execution_order`), producing state that procedural rules may then
//! consult; every rule occupies a strict ordering, enforced at load time by
//! `validate_repository`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::error::{CdssError, Result};
use crate::models::abstracted::AbstractedMeasurement;
use crate::models::rule::{HierarchyLevel, LogicType, RawRuleDoc, RuleValue, StructuredRule};

const DECLARATIVE_DIR: &str = "declarative_knowledge";
const PROCEDURAL_DIR: &str = "procedural_knowledge";

pub struct RuleRepository {
    pub declarative: Vec<StructuredRule>,
    pub procedural: Vec<StructuredRule>,
}

impl RuleRepository {
    /// Load and validate both tiers. Missing tier directories are created
    /// empty rather than treated as an error — a fresh repository is valid.
    pub fn load(rules_dir: impl AsRef<Path>) -> Result<Self> {
        let rules_dir = rules_dir.as_ref();
        let declarative_dir = rules_dir.join(DECLARATIVE_DIR);
        let procedural_dir = rules_dir.join(PROCEDURAL_DIR);
        fs::create_dir_all(&declarative_dir)
            .map_err(|e| CdssError::RulesValidation(format!("cannot create {DECLARATIVE_DIR}: {e}")))?;
        fs::create_dir_all(&procedural_dir)
            .map_err(|e| CdssError::RulesValidation(format!("cannot create {PROCEDURAL_DIR}: {e}")))?;

        if rules_dir.exists() {
            for entry in
                fs::read_dir(rules_dir).map_err(|e| CdssError::RulesValidation(format!("cannot read {}: {e}", rules_dir.display())))?
            {
                let entry = entry.map_err(|e| CdssError::RulesValidation(e.to_string()))?;
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name != DECLARATIVE_DIR && name != PROCEDURAL_DIR {
                        return Err(CdssError::RulesValidation(format!("unexpected subdirectory '{name}' in rule repository")));
                    }
                }
            }
        }

        let declarative = load_tier(&declarative_dir, HierarchyLevel::Declarative)?;
        let procedural = load_tier(&procedural_dir, HierarchyLevel::Procedural)?;
        validate_hierarchy(&declarative, &procedural)?;

        tracing::info!(
            declarative = declarative.len(),
            procedural = procedural.len(),
            "rule repository loaded"
        );
        Ok(Self { declarative, procedural })
    }

    fn all_rules_in_order(&self) -> Vec<&StructuredRule> {
        let mut all: Vec<&StructuredRule> = self.declarative.iter().chain(self.procedural.iter()).collect();
        all.sort_by_key(|r| r.execution_order);
        all
    }
}

fn load_tier(dir: &Path, level: HierarchyLevel) -> Result<Vec<StructuredRule>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| CdssError::RulesValidation(format!("cannot read {}: {e}", dir.display())))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")))
        .collect();
    paths.sort();

    let mut rule_names = std::collections::HashSet::new();
    let mut rules = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = fs::read_to_string(&path).map_err(|e| CdssError::RulesValidation(format!("{}: {e}", path.display())))?;
        let doc: RawRuleDoc = serde_json::from_str(&raw)
            .map_err(|e| CdssError::RulesValidation(format!("{}: malformed rule document: {e}", path.display())))?;
        if !rule_names.insert(doc.rule_name.clone()) {
            return Err(CdssError::RulesValidation(format!("duplicate rule name '{}'", doc.rule_name)));
        }
        rules.push(validate_rule(doc, level, &path)?);
    }
    Ok(rules)
}

fn validate_rule(doc: RawRuleDoc, level: HierarchyLevel, path: &Path) -> Result<StructuredRule> {
    let where_ = path.display();

    for condition_id in doc.rules.keys() {
        if !doc.values.contains_key(condition_id) {
            return Err(CdssError::RulesValidation(format!(
                "{where_}: condition '{condition_id}' has no matching entry in 'values'"
            )));
        }
    }
    for value_key in doc.values.keys() {
        if !doc.rules.contains_key(value_key) {
            return Err(CdssError::RulesValidation(format!(
                "{where_}: 'values' entry '{value_key}' has no matching condition in 'rules'"
            )));
        }
    }

    let values = doc
        .values
        .into_iter()
        .map(|(id, raw)| convert_value(raw, level).map(|v| (id, v)))
        .collect::<Result<IndexMap<_, _>>>()
        .map_err(|e| CdssError::RulesValidation(format!("{where_}: {e}")))?;
    let fallback_value = convert_value(doc.fallback_value, level).map_err(|e| CdssError::RulesValidation(format!("{where_}: {e}")))?;

    Ok(StructuredRule {
        rule_name: doc.rule_name,
        hierarchy_level: level,
        execution_order: doc.execution_order,
        synthetic_loinc: doc.synthetic_loinc,
        input_parameters: doc.input_parameters,
        logic_type: doc.logic_type,
        rules: doc.rules,
        values,
        fallback_value,
    })
}

/// Declarative rules only ever produce a single string value; procedural
/// rules produce a list. Both shapes are valid JSON on their own, so this is
/// enforced here rather than by serde's type inference (spec §3).
fn convert_value(raw: serde_json::Value, level: HierarchyLevel) -> std::result::Result<RuleValue, String> {
    match level {
        HierarchyLevel::Declarative => match raw {
            serde_json::Value::String(s) => Ok(RuleValue::Declarative(s)),
            other => Err(format!("declarative rule value must be a string, got {other}")),
        },
        HierarchyLevel::Procedural => match raw {
            serde_json::Value::Array(items) => {
                let items = items
                    .into_iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => Ok(s),
                        other => Err(format!("procedural rule value list must contain only strings, found {other}")),
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(RuleValue::Procedural(items))
            }
            other => Err(format!("procedural rule value must be a list of strings, got {other}")),
        },
    }
}

fn validate_hierarchy(declarative: &[StructuredRule], procedural: &[StructuredRule]) -> Result<()> {
    let max_declarative = declarative.iter().map(|r| r.execution_order).max();
    let min_procedural = procedural.iter().map(|r| r.execution_order).min();
    if let (Some(max_d), Some(min_p)) = (max_declarative, min_procedural) {
        if min_p <= max_d {
            return Err(CdssError::RulesValidation(format!(
                "procedural rules must all execute after declarative rules: lowest procedural execution_order \
                 ({min_p}) must be greater than the highest declarative execution_order ({max_d})"
            )));
        }
    }
    Ok(())
}

/// Cascading parameter lookup: `Patients` attributes first, then the state
/// cache built up by earlier rules this run, then the most recent abstracted
/// measurement whose concept name matches — all case-insensitively (spec
/// §4.7).
fn resolve_param(
    name: &str,
    patient_attrs: &BTreeMap<String, String>,
    state: &BTreeMap<String, String>,
    abstracted: &[AbstractedMeasurement],
) -> Option<String> {
    if let Some(v) = patient_attrs.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        return Some(v.1.clone());
    }
    if let Some(v) = state.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        return Some(v.1.clone());
    }
    abstracted
        .iter()
        .filter(|m| m.concept_name.eq_ignore_ascii_case(name))
        .max_by_key(|m| m.start)
        .map(|m| m.value.clone())
}

fn condition_matches(allowed: &BTreeMap<String, Vec<String>>, resolved: &BTreeMap<String, Option<String>>) -> bool {
    allowed.iter().all(|(param, options)| {
        resolved
            .get(param)
            .and_then(|v| v.as_ref())
            .is_some_and(|actual| options.iter().any(|o| o.eq_ignore_ascii_case(actual)))
    })
}

fn condition_partially_matches(allowed: &BTreeMap<String, Vec<String>>, resolved: &BTreeMap<String, Option<String>>) -> bool {
    allowed.iter().any(|(param, options)| {
        resolved
            .get(param)
            .and_then(|v| v.as_ref())
            .is_some_and(|actual| options.iter().any(|o| o.eq_ignore_ascii_case(actual)))
    })
}

fn evaluate_rule(
    rule: &StructuredRule,
    patient_attrs: &BTreeMap<String, String>,
    state: &BTreeMap<String, String>,
    abstracted: &[AbstractedMeasurement],
) -> RuleValue {
    let resolved: BTreeMap<String, Option<String>> = rule
        .input_parameters
        .iter()
        .map(|p| (p.clone(), resolve_param(p, patient_attrs, state, abstracted)))
        .collect();

    let matched = match rule.logic_type {
        // AND: first condition (in document order) whose every parameter matches wins.
        LogicType::And => rule.rules.iter().find(|(_, allowed)| condition_matches(allowed, &resolved)).map(|(id, _)| id.clone()),
        // OR: the *last* condition with at least one matching parameter wins — this
        // gives priority to conditions declared later (maximal severity ordering).
        LogicType::Or => rule
            .rules
            .iter()
            .filter(|(_, allowed)| condition_partially_matches(allowed, &resolved))
            .map(|(id, _)| id.clone())
            .last(),
    };

    match matched {
        Some(id) => rule.values.get(&id).cloned().unwrap_or_else(|| rule.fallback_value.clone()),
        None => rule.fallback_value.clone(),
    }
}

pub struct RuleProcessor {
    repository: RuleRepository,
}

impl RuleProcessor {
    pub fn new(repository: RuleRepository) -> Self {
        Self { repository }
    }

    /// Evaluate every rule, in `execution_order`, for one patient. Returns
    /// the resulting clinical state as a flat string map, including the
    /// `PatientId` key.
    pub fn run(
        &self,
        patient_id: &str,
        patient_attrs: &BTreeMap<String, String>,
        abstracted: &[AbstractedMeasurement],
    ) -> BTreeMap<String, String> {
        let mut state = BTreeMap::new();
        state.insert("PatientId".to_string(), patient_id.to_string());

        for rule in self.repository.all_rules_in_order() {
            let value = evaluate_rule(rule, patient_attrs, &state, abstracted);
            state.insert(rule.rule_name.clone(), value.into_state_string());
        }
        state
    }
}
