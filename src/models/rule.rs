use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyLevel {
    Declarative,
    Procedural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicType {
    And,
    Or,
}

/// A rule's output value. The tier fixes the shape: declarative rules only
/// ever produce a single string, procedural rules a list (spec §3's
/// invariant "all declarative values are strings, all procedural values are
/// lists" — enforced at load time by `RuleProcessor`, not by serde's own
/// type inference, since both shapes are valid JSON on their own).
#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    Declarative(String),
    Procedural(Vec<String>),
}

impl RuleValue {
    /// Join procedural lists with `;`, matching the state-cache join in
    /// `RuleProcessor::run`.
    pub fn into_state_string(self) -> String {
        match self {
            RuleValue::Declarative(s) => s,
            RuleValue::Procedural(items) => items.join(";"),
        }
    }

    pub fn as_declarative(&self) -> Option<&str> {
        match self {
            RuleValue::Declarative(s) => Some(s),
            RuleValue::Procedural(_) => None,
        }
    }

    pub fn as_procedural(&self) -> Option<&[String]> {
        match self {
            RuleValue::Procedural(items) => Some(items),
            RuleValue::Declarative(_) => None,
        }
    }
}

/// Raw JSON shape of a rule document, deserialized before tier-specific
/// validation converts it into a `StructuredRule`.
#[derive(Debug, Deserialize)]
pub struct RawRuleDoc {
    pub rule_name: String,
    pub execution_order: i64,
    pub synthetic_loinc: String,
    pub input_parameters: Vec<String>,
    pub logic_type: LogicType,
    pub rules: IndexMap<String, BTreeMap<String, Vec<String>>>,
    pub values: IndexMap<String, serde_json::Value>,
    pub fallback_value: serde_json::Value,
}

/// A fully validated, tier-tagged rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct StructuredRule {
    pub rule_name: String,
    pub hierarchy_level: HierarchyLevel,
    pub execution_order: i64,
    pub synthetic_loinc: String,
    pub input_parameters: Vec<String>,
    pub logic_type: LogicType,
    pub rules: IndexMap<String, BTreeMap<String, Vec<String>>>,
    pub values: IndexMap<String, RuleValue>,
    pub fallback_value: RuleValue,
}
