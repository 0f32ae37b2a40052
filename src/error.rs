use chrono::NaiveDateTime;
use thiserror::Error;

/// Every fallible operation in the core returns this. Callers branch on
/// variant, never on message text.
#[derive(Error, Debug)]
pub enum CdssError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{later_field} ({later}) cannot be earlier than {early_field} ({early})")]
    DateOrderViolation {
        early_field: String,
        later_field: String,
        early: NaiveDateTime,
        later: NaiveDateTime,
    },

    #[error("patient {0} not found")]
    PatientNotFound(String),

    #[error("LOINC code {0} not found")]
    LoincCodeNotFound(String),

    #[error("component '{0}' did not resolve to any known LOINC code")]
    UnknownComponent(String),

    #[error("component '{component}' is ambiguous: matches {candidates:?}")]
    AmbiguousComponent {
        component: String,
        candidates: Vec<String>,
    },

    #[error("LOINC code '{loinc_num}' and component '{component}' do not agree (component resolves to {resolved})")]
    LoincMismatch {
        loinc_num: String,
        component: String,
        resolved: String,
    },

    #[error("no visible record for patient {patient_id}, loinc {loinc_num}, valid-start {valid_start_time} at the requested snapshot")]
    RecordNotFound {
        patient_id: String,
        loinc_num: String,
        valid_start_time: NaiveDateTime,
    },

    #[error("a visible record already exists for patient {patient_id}, loinc {loinc_num}, valid-start {valid_start_time}; use update instead")]
    DuplicateInsert {
        patient_id: String,
        loinc_num: String,
        valid_start_time: NaiveDateTime,
    },

    #[error("cannot update/delete at {attempted}: a newer transaction ({newest}) already exists for this record")]
    StaleUpdate {
        attempted: NaiveDateTime,
        newest: NaiveDateTime,
    },

    #[error("patient {0} is already registered")]
    AlreadyExists(String),

    #[error("rule repository failed validation:\n{0}")]
    RulesValidation(String),

    #[error("failed to load TAK file {path}: {reason}")]
    TakLoad { path: String, reason: String },

    #[error("abstraction failed for patient {patient_id}: {source}")]
    AbstractionFailed {
        patient_id: String,
        #[source]
        source: Box<CdssError>,
    },

    #[error("clinical-state analysis failed for patient {patient_id}: {source}")]
    AnalysisFailed {
        patient_id: String,
        #[source]
        source: Box<CdssError>,
    },

    #[error("database has no registered patients")]
    NoPatients,

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CdssError>;
