//! LOINC/component resolution, grounded on `businesslogic.py`'s three-branch
//! `insert_measurement` preamble: a caller may name a measurement by LOINC
//! code, by component name, or both — and both must agree when both are
//! given (spec §4.2).

use rusqlite::Connection;

use crate::error::{CdssError, Result};
use crate::store::{self, Store};

/// Same resolution rules as `ConceptResolver`, but run against a live
/// transaction handle so Record Service can resolve and mutate atomically
/// (spec §5 / REDESIGN FLAGS Open Question (a)).
pub fn resolve_for_insert_tx(conn: &Connection, loinc_num: Option<&str>, component: Option<&str>) -> Result<String> {
    match (loinc_num, component) {
        (Some(loinc), Some(component)) => {
            if !store::loinc_exists_tx(conn, loinc)? {
                return Err(CdssError::LoincCodeNotFound(loinc.to_string()));
            }
            let candidates = store::loinc_nums_for_component_tx(conn, component)?;
            if !candidates.iter().any(|c| c == loinc) {
                return Err(CdssError::LoincMismatch {
                    loinc_num: loinc.to_string(),
                    component: component.to_string(),
                    resolved: candidates.join(", "),
                });
            }
            Ok(loinc.to_string())
        }
        (Some(loinc), None) => {
            if store::loinc_exists_tx(conn, loinc)? {
                Ok(loinc.to_string())
            } else {
                Err(CdssError::LoincCodeNotFound(loinc.to_string()))
            }
        }
        (None, Some(component)) => resolve_unique(component, store::loinc_nums_for_component_tx(conn, component)?),
        (None, None) => Err(CdssError::InvalidInput(
            "either a LOINC code or a component name must be supplied".to_string(),
        )),
    }
}

pub fn resolve_for_update_tx(
    conn: &Connection,
    patient_id: &str,
    loinc_num: Option<&str>,
    component: Option<&str>,
    snapshot: chrono::NaiveDateTime,
) -> Result<String> {
    match (loinc_num, component) {
        (Some(loinc), Some(component)) => {
            let candidates = store::loinc_nums_for_component_in_history_tx(conn, component, patient_id, snapshot)?;
            if !candidates.iter().any(|c| c == loinc) {
                return Err(CdssError::LoincMismatch {
                    loinc_num: loinc.to_string(),
                    component: component.to_string(),
                    resolved: candidates.join(", "),
                });
            }
            Ok(loinc.to_string())
        }
        (Some(loinc), None) => Ok(loinc.to_string()),
        (None, Some(component)) => resolve_unique(
            component,
            store::loinc_nums_for_component_in_history_tx(conn, component, patient_id, snapshot)?,
        ),
        (None, None) => Err(CdssError::InvalidInput(
            "either a LOINC code or a component name must be supplied".to_string(),
        )),
    }
}

pub struct ConceptResolver<'a> {
    store: &'a Store,
}

impl<'a> ConceptResolver<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Resolve a (loinc_num?, component?) pair against the whole LOINC
    /// dictionary — used when inserting a new measurement.
    pub fn resolve_for_insert(&self, loinc_num: Option<&str>, component: Option<&str>) -> Result<String> {
        match (loinc_num, component) {
            (Some(loinc), Some(component)) => {
                if !self.store.loinc_exists(loinc)? {
                    return Err(CdssError::LoincCodeNotFound(loinc.to_string()));
                }
                let candidates = self.store.loinc_nums_for_component(component)?;
                if !candidates.iter().any(|c| c == loinc) {
                    return Err(CdssError::LoincMismatch {
                        loinc_num: loinc.to_string(),
                        component: component.to_string(),
                        resolved: candidates.join(", "),
                    });
                }
                Ok(loinc.to_string())
            }
            (Some(loinc), None) => {
                if self.store.loinc_exists(loinc)? {
                    Ok(loinc.to_string())
                } else {
                    Err(CdssError::LoincCodeNotFound(loinc.to_string()))
                }
            }
            (None, Some(component)) => resolve_unique(component, self.store.loinc_nums_for_component(component)?),
            (None, None) => Err(CdssError::InvalidInput(
                "either a LOINC code or a component name must be supplied".to_string(),
            )),
        }
    }

    /// Resolve a (loinc_num?, component?) pair against one patient's history
    /// visible at `snapshot` — used when updating or deleting.
    pub fn resolve_for_update(
        &self,
        patient_id: &str,
        loinc_num: Option<&str>,
        component: Option<&str>,
        snapshot: chrono::NaiveDateTime,
    ) -> Result<String> {
        match (loinc_num, component) {
            (Some(loinc), Some(component)) => {
                let candidates = self.store.loinc_nums_for_component_in_history(component, patient_id, snapshot)?;
                if !candidates.iter().any(|c| c == loinc) {
                    return Err(CdssError::LoincMismatch {
                        loinc_num: loinc.to_string(),
                        component: component.to_string(),
                        resolved: candidates.join(", "),
                    });
                }
                Ok(loinc.to_string())
            }
            (Some(loinc), None) => Ok(loinc.to_string()),
            (None, Some(component)) => {
                resolve_unique(component, self.store.loinc_nums_for_component_in_history(component, patient_id, snapshot)?)
            }
            (None, None) => Err(CdssError::InvalidInput(
                "either a LOINC code or a component name must be supplied".to_string(),
            )),
        }
    }
}

fn resolve_unique(component: &str, candidates: Vec<String>) -> Result<String> {
    match candidates.len() {
        0 => Err(CdssError::UnknownComponent(component.to_string())),
        1 => Ok(candidates.into_iter().next().unwrap()),
        _ => Err(CdssError::AmbiguousComponent {
            component: component.to_string(),
            candidates,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::loinc::{AllowedValues, LoincEntry};

    fn entry(num: &str, component: &str) -> LoincEntry {
        LoincEntry {
            loinc_num: num.into(),
            component: component.into(),
            property: "MCnc".into(),
            time_aspect: "Pt".into(),
            system: "Bld".into(),
            scale_type: "Qn".into(),
            method_type: "".into(),
            allowed_values: Some(AllowedValues::Numeric),
        }
    }

    #[test]
    fn component_only_resolves_when_unique() {
        let store = Store::open_in_memory().unwrap();
        store.insert_loinc_row(&entry("718-7", "Hemoglobin")).unwrap();
        let resolver = ConceptResolver::new(&store);
        assert_eq!(resolver.resolve_for_insert(None, Some("Hemoglobin")).unwrap(), "718-7");
    }

    #[test]
    fn component_only_is_ambiguous_with_two_matches() {
        let store = Store::open_in_memory().unwrap();
        store.insert_loinc_row(&entry("718-7", "Hemoglobin")).unwrap();
        store.insert_loinc_row(&entry("718-8", "Hemoglobin")).unwrap();
        let resolver = ConceptResolver::new(&store);
        match resolver.resolve_for_insert(None, Some("Hemoglobin")) {
            Err(CdssError::AmbiguousComponent { candidates, .. }) => assert_eq!(candidates.len(), 2),
            other => panic!("expected AmbiguousComponent, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_loinc_and_component_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.insert_loinc_row(&entry("718-7", "Hemoglobin")).unwrap();
        store.insert_loinc_row(&entry("2345-7", "Glucose")).unwrap();
        let resolver = ConceptResolver::new(&store);
        assert!(matches!(
            resolver.resolve_for_insert(Some("718-7"), Some("Glucose")),
            Err(CdssError::LoincMismatch { .. })
        ));
    }
}
