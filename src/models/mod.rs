pub mod abstracted;
pub mod loinc;
pub mod measurement;
pub mod patient;
pub mod rule;
pub mod tak;
