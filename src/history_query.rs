//! Ad-hoc history search, grounded on `businesslogic.py`'s
//! `PatientRecord.search_history` (dynamic filter list + parameters, date-only
//! end bound widened to `23:59:59`, spec §4.3).

use chrono::NaiveDateTime;

use crate::error::{CdssError, Result};
use crate::models::measurement::HistoryRow;
use crate::store::{HistoryFilter, HistoryQueryParams, Store};
use crate::validator;

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub loinc_num: Option<String>,
    pub component: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

pub struct HistoryQueryService<'a> {
    store: &'a Store,
}

impl<'a> HistoryQueryService<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn run(&self, patient_id: &str, query: &HistoryQuery, snapshot: NaiveDateTime) -> Result<Vec<HistoryRow>> {
        validator::validate_patient_id(patient_id)?;
        if !self.store.patient_exists(patient_id)? {
            return Err(CdssError::PatientNotFound(patient_id.to_string()));
        }

        let mut filters = Vec::new();
        if let Some(loinc) = &query.loinc_num {
            filters.push(HistoryFilter::LoincNum(loinc.clone()));
        }
        if let Some(component) = &query.component {
            filters.push(HistoryFilter::ComponentLike(component.clone()));
        }
        if let Some(start) = &query.start {
            filters.push(HistoryFilter::StartAtOrAfter(validator::parse_datetime(start, false)?));
        }
        if let Some(end) = &query.end {
            filters.push(HistoryFilter::EndAtOrBefore(validator::parse_datetime(end, true)?));
        }

        self.store.history(&HistoryQueryParams {
            patient_id: patient_id.to_string(),
            snapshot,
            filters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::loinc::{AllowedValues, LoincEntry};
    use crate::models::measurement::Measurement;
    use crate::models::patient::{Patient, Sex};

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn fixture() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_patient_row(&Patient {
                patient_id: "123456789".into(),
                first_name: "Eyal".into(),
                last_name: "Rothman".into(),
                sex: Sex::Male,
            })
            .unwrap();
        store
            .insert_loinc_row(&LoincEntry {
                loinc_num: "718-7".into(),
                component: "Hemoglobin".into(),
                property: "MCnc".into(),
                time_aspect: "Pt".into(),
                system: "Bld".into(),
                scale_type: "Qn".into(),
                method_type: "".into(),
                allowed_values: Some(AllowedValues::Numeric),
            })
            .unwrap();
        store
            .transaction(|conn| {
                Store::insert_measurement_tx(
                    conn,
                    &Measurement {
                        patient_id: "123456789".into(),
                        loinc_num: "718-7".into(),
                        value: "14.2".into(),
                        unit: "mmol/L".into(),
                        valid_start_time: dt("2024-04-01 08:00:00"),
                        transaction_insertion_time: dt("2024-04-01 08:05:00"),
                        transaction_deletion_time: None,
                    },
                )
            })
            .unwrap();
        store
    }

    #[test]
    fn filters_by_component_substring_case_insensitively() {
        let store = fixture();
        let svc = HistoryQueryService::new(&store);
        let query = HistoryQuery { component: Some("hemo".into()), ..Default::default() };
        let rows = svc.run("123456789", &query, dt("2024-04-01 09:00:00")).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn end_bound_is_inclusive_through_end_of_day() {
        let store = fixture();
        let svc = HistoryQueryService::new(&store);
        let query = HistoryQuery { end: Some("2024-04-01".into()), ..Default::default() };
        let rows = svc.run("123456789", &query, dt("2024-04-01 09:00:00")).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn unknown_patient_is_rejected() {
        let store = fixture();
        let svc = HistoryQueryService::new(&store);
        assert!(matches!(
            svc.run("999999999", &HistoryQuery::default(), dt("2024-04-01 09:00:00")),
            Err(CdssError::PatientNotFound(_))
        ));
    }
}
