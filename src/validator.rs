//! Pure input-validation functions, grounded on `backend/businesslogic.py`'s
//! `validate_patient_id` / `validate_name` / `validate_datetime` /
//! `validate_dates_relation`. None of these touch the `Store` — they only
//! ever reject malformed input before it reaches persistence.

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{CdssError, Result};
use crate::models::loinc::AllowedValues;

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z'-]+$").unwrap())
}

pub fn validate_patient_id(patient_id: &str) -> Result<()> {
    if patient_id.len() == 9 && patient_id.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(CdssError::InvalidInput(format!(
            "patient id '{patient_id}' must be exactly 9 digits"
        )))
    }
}

pub fn validate_name(field: &str, value: &str) -> Result<()> {
    if !value.is_empty() && name_pattern().is_match(value) {
        Ok(())
    } else {
        Err(CdssError::InvalidInput(format!(
            "{field} '{value}' may only contain letters, apostrophes and hyphens"
        )))
    }
}

pub fn validate_sex(value: &str) -> Result<crate::models::patient::Sex> {
    crate::models::patient::Sex::parse(value)
        .ok_or_else(|| CdssError::InvalidInput(format!("sex must be 'Male' or 'Female', got '{value}'")))
}

/// Parse a datetime or bare date, day-first when ambiguous — the original
/// drives `pandas.to_datetime(..., dayfirst=True)`; a bare date is treated as
/// a full day at `00:00:00` unless `end_of_day` widens it to `23:59:59` (used
/// for history-query upper bounds and delete-by-date, spec §4.3/§4.4).
pub fn parse_datetime(raw: &str, end_of_day: bool) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt);
        }
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            let time = if end_of_day { (23, 59, 59) } else { (0, 0, 0) };
            return Ok(date.and_hms_opt(time.0, time.1, time.2).unwrap());
        }
    }
    Err(CdssError::InvalidInput(format!("'{raw}' is not a recognizable date or datetime")))
}

pub fn validate_date_order(early_field: &str, early: NaiveDateTime, later_field: &str, later: NaiveDateTime) -> Result<()> {
    if early <= later {
        Ok(())
    } else {
        Err(CdssError::DateOrderViolation {
            early_field: early_field.to_string(),
            later_field: later_field.to_string(),
            early,
            later,
        })
    }
}

/// Validate a measurement value against the LOINC entry's `AllowedValues`.
pub fn validate_allowed_value(value: &str, allowed: Option<&AllowedValues>) -> Result<()> {
    match allowed {
        None => Ok(()),
        Some(AllowedValues::Numeric) => value
            .parse::<f64>()
            .map(|_| ())
            .map_err(|_| CdssError::InvalidInput(format!("value '{value}' is not numeric"))),
        Some(AllowedValues::List(options)) => {
            if options.iter().any(|o| o.eq_ignore_ascii_case(value)) {
                Ok(())
            } else {
                Err(CdssError::InvalidInput(format!(
                    "value '{value}' is not one of the allowed values {options:?}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patient_id_must_be_nine_digits() {
        assert!(validate_patient_id("123456789").is_ok());
        assert!(validate_patient_id("12345678").is_err());
        assert!(validate_patient_id("12345678a").is_err());
    }

    #[test]
    fn names_reject_digits_and_spaces() {
        assert!(validate_name("FirstName", "O'Brien").is_ok());
        assert!(validate_name("FirstName", "Smith-Jones").is_ok());
        assert!(validate_name("FirstName", "Jo3").is_err());
        assert!(validate_name("FirstName", "").is_err());
    }

    #[test]
    fn bare_date_widens_to_end_of_day_only_when_asked() {
        let start = parse_datetime("2024-04-01", false).unwrap();
        let end = parse_datetime("2024-04-01", true).unwrap();
        assert_eq!(start.format("%H:%M:%S").to_string(), "00:00:00");
        assert_eq!(end.format("%H:%M:%S").to_string(), "23:59:59");
    }

    #[test]
    fn minute_precision_datetimes_parse_without_seconds() {
        let iso = parse_datetime("2024-04-01 08:00", false).unwrap();
        assert_eq!(iso.format("%H:%M:%S").to_string(), "08:00:00");
        let day_first = parse_datetime("01/04/2024 08:00", false).unwrap();
        assert_eq!(day_first.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-04-01 08:00:00");
    }

    #[test]
    fn date_order_violation_is_reported() {
        let early = parse_datetime("2024-04-01", false).unwrap();
        let later = parse_datetime("2024-03-01", false).unwrap();
        assert!(validate_date_order("Start", early, "End", later).is_err());
    }

    #[test]
    fn allowed_values_numeric_and_list() {
        assert!(validate_allowed_value("14.2", Some(&AllowedValues::Numeric)).is_ok());
        assert!(validate_allowed_value("abc", Some(&AllowedValues::Numeric)).is_err());
        let list = AllowedValues::List(vec!["Positive".into(), "Negative".into()]);
        assert!(validate_allowed_value("positive", Some(&list)).is_ok());
        assert!(validate_allowed_value("Unknown", Some(&list)).is_err());
    }
}
