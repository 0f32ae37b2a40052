use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A single bi-temporal measurement row. See spec §3 for the invariants this
/// type's lineage must satisfy — enforced by `record_service`, not by this
/// struct itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub patient_id: String,
    pub loinc_num: String,
    pub value: String,
    pub unit: String,
    pub valid_start_time: NaiveDateTime,
    pub transaction_insertion_time: NaiveDateTime,
    pub transaction_deletion_time: Option<NaiveDateTime>,
}

impl Measurement {
    /// Visible at snapshot S iff insertion <= S and (no deletion or deletion > S).
    pub fn visible_at(&self, snapshot: NaiveDateTime) -> bool {
        self.transaction_insertion_time <= snapshot
            && self.transaction_deletion_time.is_none_or(|d| d > snapshot)
    }
}

/// A measurement row joined with its LOINC component name, as returned by
/// history queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub loinc_num: String,
    pub concept_name: String,
    pub value: String,
    pub unit: String,
    pub valid_start_time: NaiveDateTime,
    pub transaction_insertion_time: NaiveDateTime,
}
