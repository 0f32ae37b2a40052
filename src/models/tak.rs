use std::collections::BTreeMap;

use chrono::Duration;

/// A single abstraction threshold: the first one whose bounds contain the
/// measured value wins (spec §4.5 — "first threshold with ... found").
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub label: String,
    pub min_inclusive: Option<f64>,
    pub max_exclusive: Option<f64>,
}

impl Threshold {
    pub fn matches(&self, value: f64) -> bool {
        self.min_inclusive.is_none_or(|min| value >= min) && self.max_exclusive.is_none_or(|max| value < max)
    }
}

/// One temporal-abstraction rule, derived from a `<condition>` element of a
/// TAK XML document.
#[derive(Debug, Clone, PartialEq)]
pub struct TakRule {
    pub abstraction_name: String,
    pub loinc_code: String,
    pub filters: BTreeMap<String, String>,
    pub good_before: Duration,
    pub good_after: Duration,
    pub thresholds: Vec<Threshold>,
}

impl TakRule {
    /// A rule applies to a patient if every filter key exists in the
    /// patient's attributes and equals the filter value, case-insensitively.
    pub fn applies_to(&self, patient_attrs: &BTreeMap<String, String>) -> bool {
        self.filters.iter().all(|(key, value)| {
            patient_attrs
                .get(key)
                .is_some_and(|actual| actual.eq_ignore_ascii_case(value))
        })
    }

    /// First threshold whose bounds contain `value`, if any.
    pub fn classify(&self, value: f64) -> Option<&Threshold> {
        self.thresholds.iter().find(|t| t.matches(value))
    }
}

/// Parse a compact duration string (`72h`, `2d`, `15m`) into a `Duration`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let amount: i64 = digits.parse().ok()?;
    match unit {
        "m" => Some(Duration::minutes(amount)),
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        _ => None,
    }
}
