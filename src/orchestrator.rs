//! Top-level pipeline: refill `AbstractedMeasurements` for every patient, then
//! run the Rule Processor over the most recent abstracted state per concept.
//! Grounded on the two-phase driver implicit in `mediator.py`/`rule_processor.py`
//! being invoked back-to-back from the original's batch entry point.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};

use crate::config::CdssConfig;
use crate::error::{CdssError, Result};
use crate::mediator::{Mediator, TakParser};
use crate::models::abstracted::AbstractedMeasurement;
use crate::rule_processor::{RuleProcessor, RuleRepository};
use crate::store::Store;

pub struct Orchestrator<'a> {
    store: &'a Store,
    default_relevance: Duration,
    tak_dir: std::path::PathBuf,
    rules_dir: std::path::PathBuf,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a Store, config: &CdssConfig) -> Self {
        Self {
            store,
            default_relevance: Duration::hours(config.default_relevance_hours as i64),
            tak_dir: config.tak_dir.clone(),
            rules_dir: config.rules_dir.clone(),
        }
    }

    /// Truncate and refill `AbstractedMeasurements` for every registered
    /// patient (spec §4.8 step 1). Columns that end up entirely null across
    /// every patient are implicitly absent since rows are sparse by concept.
    pub fn abstract_data(&self, snapshot: NaiveDateTime) -> Result<usize> {
        let patient_ids = self.store.all_patient_ids()?;
        if patient_ids.is_empty() {
            return Err(CdssError::NoPatients);
        }

        let rules = TakParser::load_dir(&self.tak_dir)?;
        let mediator = Mediator::new(self.store, &rules, self.default_relevance);
        let mut total = 0usize;
        let mut all_rows: Vec<AbstractedMeasurement> = Vec::new();
        for patient_id in &patient_ids {
            let rows = mediator.run(patient_id, snapshot).map_err(|e| {
                tracing::error!(patient_id, error = %e, "abstraction failed for patient");
                CdssError::AbstractionFailed { patient_id: patient_id.clone(), source: Box::new(e) }
            })?;
            total += rows.len();
            all_rows.extend(rows);
        }

        self.store.transaction(|conn| {
            Store::truncate_abstracted_tx(conn)?;
            for row in &all_rows {
                Store::insert_abstracted_tx(conn, row)?;
            }
            Ok(())
        })?;

        tracing::info!(patients = patient_ids.len(), abstracted_rows = total, "abstraction run complete");
        Ok(total)
    }

    /// Run the Rule Processor for every patient against the abstracted state
    /// visible at `snapshot`, keeping only the most recent interval per LOINC
    /// concept (spec §4.8 step 2). Re-runs abstraction first so
    /// `AbstractedMeasurements` is never stale relative to `snapshot`; an
    /// empty patient roster is tolerated here (yields an empty state map)
    /// rather than propagated as `NoPatients`, since "no clinical state to
    /// report" is a valid answer for a query, unlike for an abstraction run.
    /// Returns the snapshot normalized to the store's datetime convention
    /// alongside the per-patient state map.
    pub fn analyze_clinical_state(&self, snapshot: NaiveDateTime) -> Result<(String, BTreeMap<String, BTreeMap<String, String>>)> {
        match self.abstract_data(snapshot) {
            Ok(_) | Err(CdssError::NoPatients) => {}
            Err(e) => return Err(e),
        }

        let snapshot_s = snapshot.format("%Y-%m-%d %H:%M:%S").to_string();
        let repository = RuleRepository::load(&self.rules_dir)?;
        let processor = RuleProcessor::new(repository);

        let all_abstracted = self.store.abstracted_visible_at(snapshot)?;
        let mut by_patient: BTreeMap<String, Vec<AbstractedMeasurement>> = BTreeMap::new();
        for row in all_abstracted {
            by_patient.entry(row.patient_id.clone()).or_default().push(row);
        }

        let mut result = BTreeMap::new();
        for (patient_id, mut rows) in by_patient {
            rows = most_recent_per_concept(rows);
            let attrs = self
                .store
                .patient_attrs(&patient_id)
                .map_err(|e| CdssError::AnalysisFailed { patient_id: patient_id.clone(), source: Box::new(e) })?
                .unwrap_or_default();
            let state = processor.run(&patient_id, &attrs, &rows);
            result.insert(patient_id, state);
        }
        tracing::info!(patients = result.len(), "clinical-state analysis complete");
        Ok((snapshot_s, result))
    }
}

/// For each (LoincCode, ConceptName) pair, keep only the interval with the
/// latest `start` — rule evaluation always consults the current state, not
/// historical abstracted intervals.
fn most_recent_per_concept(rows: Vec<AbstractedMeasurement>) -> Vec<AbstractedMeasurement> {
    let mut latest: BTreeMap<(String, String), AbstractedMeasurement> = BTreeMap::new();
    for row in rows {
        let key = (row.loinc_code.clone(), row.concept_name.clone());
        match latest.get(&key) {
            Some(existing) if existing.start >= row.start => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::abstracted::AbstractedSource;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn row(loinc: &str, concept: &str, value: &str, start: &str) -> AbstractedMeasurement {
        AbstractedMeasurement {
            patient_id: "123456789".into(),
            loinc_code: loinc.into(),
            concept_name: concept.into(),
            value: value.into(),
            start: dt(start),
            end: dt(start),
            source: AbstractedSource::Abstracted,
        }
    }

    #[test]
    fn most_recent_per_concept_drops_stale_intervals() {
        let rows = vec![
            row("718-7", "HemoglobinState", "Low", "2024-04-01 08:00:00"),
            row("718-7", "HemoglobinState", "Normal", "2024-04-02 08:00:00"),
        ];
        let kept = most_recent_per_concept(rows);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].value, "Normal");
    }

    #[test]
    fn no_patients_registered_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        let config = CdssConfig::default();
        let orchestrator = Orchestrator::new(&store, &config);
        assert!(matches!(orchestrator.abstract_data(dt("2024-04-01 08:00:00")), Err(CdssError::NoPatients)));
    }

    #[test]
    fn analyzing_with_no_patients_yields_an_empty_state_map_not_an_error() {
        let store = Store::open_in_memory().unwrap();
        let config = CdssConfig::default();
        let orchestrator = Orchestrator::new(&store, &config);
        let (snapshot_s, result) = orchestrator.analyze_clinical_state(dt("2024-04-01 08:00:00")).unwrap();
        assert_eq!(snapshot_s, "2024-04-01 08:00:00");
        assert!(result.is_empty());
    }
}
