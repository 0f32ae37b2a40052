//! Temporal Abstraction Mediator, grounded on `mediator.py`'s `TAKParser` and
//! `Mediator`. Converts raw bi-temporal measurements into labeled,
//! temporally-extended clinical-state intervals by running each patient's
//! visible history through a set of Temporal Abstraction Knowledge (TAK)
//! rules loaded from XML.
//!
//! XML parsing uses `roxmltree`'s tree-walk API rather than `quick-xml`'s
//! streaming `Reader`/`Event` model — the original's `ElementTree.findall`
//! style maps onto `Node::children`/`Node::attribute` far more directly.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{Duration, NaiveDateTime};

use crate::error::{CdssError, Result};
use crate::models::abstracted::{AbstractedMeasurement, AbstractedSource};
use crate::models::tak::{TakRule, Threshold, parse_duration};
use crate::store::Store;

pub struct TakParser;

impl TakParser {
    /// Load every `*.xml` file in `dir` into a flat rule set. A TAK
    /// repository directory with no XML files is valid and yields no rules.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<TakRule>> {
        let dir = dir.as_ref();
        let mut rules = Vec::new();
        if !dir.exists() {
            return Ok(rules);
        }
        let mut entries: Vec<_> = fs::read_dir(dir)
            .map_err(|e| CdssError::TakLoad { path: dir.display().to_string(), reason: e.to_string() })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("xml")))
            .collect();
        entries.sort();
        for path in entries {
            let xml = fs::read_to_string(&path)
                .map_err(|e| CdssError::TakLoad { path: path.display().to_string(), reason: e.to_string() })?;
            rules.extend(Self::parse_str(&xml).map_err(|e| CdssError::TakLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?);
        }
        tracing::debug!(dir = %dir.display(), rules = rules.len(), "TAK rules loaded");
        Ok(rules)
    }

    pub fn parse_str(xml: &str) -> Result<Vec<TakRule>> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| CdssError::TakLoad { path: "<inline>".to_string(), reason: e.to_string() })?;
        let root = doc.root_element();
        let mut rules = Vec::new();
        for node in root.children().filter(|n| n.is_element() && n.has_tag_name("abstraction")) {
            rules.push(parse_abstraction(&node)?);
        }
        Ok(rules)
    }
}

fn parse_abstraction(node: &roxmltree::Node) -> Result<TakRule> {
    let name = attr(node, "name")?;
    let loinc_code = attr(node, "loinc-code")?;

    let mut filters = BTreeMap::new();
    if let Some(applicable) = child(node, "applicable-to") {
        for attribute in applicable.children().filter(|n| n.is_element() && n.has_tag_name("attribute")) {
            let key = attr(&attribute, "name")?;
            let value = attr(&attribute, "value")?;
            filters.insert(key, value);
        }
    }

    let (good_before, good_after) = match child(node, "persistence") {
        Some(persistence) => {
            let before = persistence.attribute("good-before").and_then(parse_duration).unwrap_or_default();
            let after = persistence.attribute("good-after").and_then(parse_duration).unwrap_or_default();
            (before, after)
        }
        None => (Duration::zero(), Duration::zero()),
    };

    let mut thresholds = Vec::new();
    if let Some(thresholds_node) = child(node, "thresholds") {
        for threshold in thresholds_node.children().filter(|n| n.is_element() && n.has_tag_name("threshold")) {
            let label = attr(&threshold, "label")?;
            let min_inclusive = parse_f64_attr(&threshold, "min-inclusive")?;
            let max_exclusive = parse_f64_attr(&threshold, "max-exclusive")?;
            thresholds.push(Threshold { label, min_inclusive, max_exclusive });
        }
    }

    Ok(TakRule { abstraction_name: name, loinc_code, filters, good_before, good_after, thresholds })
}

fn attr(node: &roxmltree::Node, name: &str) -> Result<String> {
    node.attribute(name)
        .map(str::to_string)
        .ok_or_else(|| CdssError::TakLoad { path: "<inline>".into(), reason: format!("missing '{name}' attribute") })
}

fn child<'a, 'input>(node: &roxmltree::Node<'a, 'input>, tag: &str) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|n| n.is_element() && n.has_tag_name(tag))
}

fn parse_f64_attr(node: &roxmltree::Node, name: &str) -> Result<Option<f64>> {
    match node.attribute(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| CdssError::TakLoad { path: "<inline>".into(), reason: format!("'{name}' is not numeric: {raw}") }),
    }
}

pub struct Mediator<'a> {
    store: &'a Store,
    rules: &'a [TakRule],
    default_relevance: Duration,
}

impl<'a> Mediator<'a> {
    pub fn new(store: &'a Store, rules: &'a [TakRule], default_relevance: Duration) -> Self {
        Self { store, rules, default_relevance }
    }

    /// Run the abstraction pipeline for one patient: fetch visible raw
    /// measurements, classify each against applicable TAK rules, then merge
    /// same-label runs and truncate conflicting overlaps (spec §4.5).
    pub fn run(&self, patient_id: &str, snapshot: NaiveDateTime) -> Result<Vec<AbstractedMeasurement>> {
        let attrs = self.store.patient_attrs(patient_id)?.unwrap_or_default();
        let measurements = self.store.visible_measurements_for_patient(patient_id, snapshot)?;

        let mut abstracted_intervals: Vec<AbstractedMeasurement> = Vec::with_capacity(measurements.len());
        let mut raw_intervals: Vec<AbstractedMeasurement> = Vec::new();
        for measurement in measurements {
            let applicable = self
                .rules
                .iter()
                .find(|rule| rule.loinc_code == measurement.loinc_num && rule.applies_to(&attrs));

            match applicable {
                Some(rule) => {
                    let Ok(value) = measurement.value.parse::<f64>() else { continue };
                    let Some(threshold) = rule.classify(value) else { continue };
                    abstracted_intervals.push(AbstractedMeasurement {
                        patient_id: patient_id.to_string(),
                        loinc_code: measurement.loinc_num.clone(),
                        concept_name: rule.abstraction_name.clone(),
                        value: threshold.label.clone(),
                        start: measurement.valid_start_time - rule.good_before,
                        end: measurement.valid_start_time + rule.good_after + self.default_relevance,
                        source: AbstractedSource::Abstracted,
                    });
                }
                None => {
                    let entry = self.store.get_loinc(&measurement.loinc_num)?;
                    raw_intervals.push(AbstractedMeasurement {
                        patient_id: patient_id.to_string(),
                        loinc_code: measurement.loinc_num.clone(),
                        concept_name: entry.map(|e| e.component).unwrap_or(measurement.loinc_num.clone()),
                        value: measurement.value.clone(),
                        start: measurement.valid_start_time,
                        end: measurement.valid_start_time + self.default_relevance,
                        source: AbstractedSource::Raw,
                    });
                }
            }
        }

        // Only abstracted intervals participate in same-label merge /
        // different-label truncation (spec §4.5 steps 3-4); untouched raw
        // rows are appended afterward as single-point intervals that never
        // truncate, or get truncated by, an abstracted interval.
        let mut result = merge_intervals(abstracted_intervals);
        result.extend(raw_intervals);
        result.sort_by(|a, b| a.start.cmp(&b.start).then(a.loinc_code.cmp(&b.loinc_code)));
        Ok(result)
    }
}

/// Same-(LoincCode, Value) intervals merge when one touches or overlaps the
/// next; same-LoincCode-different-Value intervals instead get the earlier
/// one's end truncated to the later one's start, so overlapping clinical
/// states never coexist for a single concept.
fn merge_intervals(mut intervals: Vec<AbstractedMeasurement>) -> Vec<AbstractedMeasurement> {
    intervals.sort_by(|a, b| {
        a.loinc_code
            .cmp(&b.loinc_code)
            .then(a.start.cmp(&b.start))
            .then(a.value.cmp(&b.value))
    });

    let mut merged: Vec<AbstractedMeasurement> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(prev) if prev.loinc_code == interval.loinc_code && prev.value == interval.value && interval.start <= prev.end => {
                prev.end = prev.end.max(interval.end);
            }
            Some(prev) if prev.loinc_code == interval.loinc_code && interval.start < prev.end => {
                prev.end = interval.start;
                merged.push(interval);
            }
            _ => merged.push(interval),
        }
    }
    merged.sort_by(|a, b| a.start.cmp(&b.start).then(a.loinc_code.cmp(&b.loinc_code)));
    merged
}
