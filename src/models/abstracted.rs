use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbstractedSource {
    Abstracted,
    Raw,
}

impl AbstractedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbstractedSource::Abstracted => "abstracted",
            AbstractedSource::Raw => "raw",
        }
    }
}

/// A derived, fully-rebuilt-per-run record produced by the Mediator. Carries
/// no bi-temporal semantics of its own — the whole table is truncated and
/// refilled on each abstraction run (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbstractedMeasurement {
    pub patient_id: String,
    pub loinc_code: String,
    pub concept_name: String,
    pub value: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub source: AbstractedSource,
}
