//! Integration tests for the six end-to-end scenarios of spec.md §8, each
//! driven through the public `cdss_core` API against an in-memory `Store`.

use chrono::NaiveDateTime;
use std::path::Path;

use cdss_core::error::CdssError;
use cdss_core::history_query::{HistoryQuery, HistoryQueryService};
use cdss_core::models::loinc::{AllowedValues, LoincEntry};
use cdss_core::record_service::RecordService;
use cdss_core::store::Store;
use cdss_core::{CdssConfig, Orchestrator};

fn dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn seed_loinc(store: &Store) {
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
        .insert_loinc_row(&LoincEntry {
            loinc_num: "6690-2".into(),
            component: "Leukocytes".into(),
            property: "NCnc".into(),
            time_aspect: "Pt".into(),
            system: "Bld".into(),
            scale_type: "Qn".into(),
            method_type: "".into(),
            allowed_values: Some(AllowedValues::Numeric),
        })
        .unwrap();
}

/// Scenario 1: bi-temporal update — insert then update, history differs by snapshot.
#[test]
fn scenario_1_bitemporal_update() {
    let store = Store::open_in_memory().unwrap();
    seed_loinc(&store);
    let svc = RecordService::new(&store);
    svc.register_patient("100000001", "Ayala", "Cohen", "Male").unwrap();
    svc.insert_measurement(
        "100000001",
        Some("718-7"),
        None,
        "14.2",
        "mmol/L",
        "2024-04-01 08:00:00",
        dt("2024-04-01 08:01:00"),
    )
    .unwrap();
    svc.update_measurement(
        "100000001",
        Some("718-7"),
        None,
        "14.5",
        "2024-04-01 08:00:00",
        dt("2024-04-02 09:00:00"),
    )
    .unwrap();

    let history = HistoryQueryService::new(&store);
    let before = history
        .run("100000001", &HistoryQuery::default(), dt("2024-04-01 12:00:00"))
        .unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].value, "14.2");

    let after = history
        .run("100000001", &HistoryQuery::default(), dt("2024-04-02 10:00:00"))
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].value, "14.5");
}

/// Scenario 2: a stale update (behind an already-recorded future transaction) is rejected.
#[test]
fn scenario_2_stale_update_rejected() {
    let store = Store::open_in_memory().unwrap();
    seed_loinc(&store);
    let svc = RecordService::new(&store);
    svc.register_patient("100000001", "Ayala", "Cohen", "Male").unwrap();
    svc.insert_measurement(
        "100000001",
        Some("718-7"),
        None,
        "14.2",
        "mmol/L",
        "2024-04-01 08:00:00",
        dt("2024-04-01 08:01:00"),
    )
    .unwrap();
    svc.update_measurement(
        "100000001",
        Some("718-7"),
        None,
        "14.5",
        "2024-04-01 08:00:00",
        dt("2024-04-02 09:00:00"),
    )
    .unwrap();

    let result = svc.update_measurement(
        "100000001",
        Some("718-7"),
        None,
        "99.0",
        "2024-04-01 08:00:00",
        dt("2024-04-01 23:00:00"),
    );
    assert!(matches!(result, Err(CdssError::StaleUpdate { .. })));
}

/// Scenario 3: logical delete by date-only picks the latest valid-start that day.
#[test]
fn scenario_3_logical_delete_by_date_only() {
    let store = Store::open_in_memory().unwrap();
    seed_loinc(&store);
    let svc = RecordService::new(&store);
    svc.register_patient("100000001", "Ayala", "Cohen", "Male").unwrap();
    svc.insert_measurement(
        "100000001",
        Some("718-7"),
        None,
        "14.2",
        "mmol/L",
        "2024-04-01 08:00:00",
        dt("2024-04-01 08:01:00"),
    )
    .unwrap();
    svc.insert_measurement(
        "100000001",
        Some("718-7"),
        None,
        "14.9",
        "mmol/L",
        "2024-04-01 20:00:00",
        dt("2024-04-01 20:01:00"),
    )
    .unwrap();

    svc.delete_measurement("100000001", Some("718-7"), None, "2024-04-01", dt("2024-04-02 00:00:00"))
        .unwrap();

    let history = HistoryQueryService::new(&store);
    let remaining = history
        .run("100000001", &HistoryQuery::default(), dt("2024-04-02 01:00:00"))
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].value, "14.2");
}

/// Scenario 4: a component resolving to two LOINC codes is ambiguous on insert,
/// but a component with a single match in the patient's own history resolves on update.
#[test]
fn scenario_4_component_disambiguation() {
    let store = Store::open_in_memory().unwrap();
    store
        .insert_loinc_row(&LoincEntry {
            loinc_num: "2345-7".into(),
            component: "Glucose".into(),
            property: "MCnc".into(),
            time_aspect: "Pt".into(),
            system: "Ser/Plas".into(),
            scale_type: "Qn".into(),
            method_type: "".into(),
            allowed_values: Some(AllowedValues::Numeric),
        })
        .unwrap();
    store
        .insert_loinc_row(&LoincEntry {
            loinc_num: "2339-0".into(),
            component: "Glucose".into(),
            property: "MCnc".into(),
            time_aspect: "Pt".into(),
            system: "Bld".into(),
            scale_type: "Qn".into(),
            method_type: "".into(),
            allowed_values: Some(AllowedValues::Numeric),
        })
        .unwrap();

    let svc = RecordService::new(&store);
    svc.register_patient("100000002", "Noa", "Levi", "Female").unwrap();

    let ambiguous = svc.insert_measurement(
        "100000002",
        None,
        Some("Glucose"),
        "95",
        "mg/dL",
        "2024-04-01 08:00:00",
        dt("2024-04-01 08:01:00"),
    );
    assert!(matches!(ambiguous, Err(CdssError::AmbiguousComponent { .. })));

    svc.insert_measurement(
        "100000002",
        Some("2345-7"),
        None,
        "95",
        "mg/dL",
        "2024-04-01 08:00:00",
        dt("2024-04-01 08:01:00"),
    )
    .unwrap();

    // now only 2345-7 is in this patient's history, so Component-only resolves uniquely
    svc.update_measurement(
        "100000002",
        None,
        Some("Glucose"),
        "110",
        "2024-04-01 08:00:00",
        dt("2024-04-02 09:00:00"),
    )
    .unwrap();

    let history = HistoryQueryService::new(&store);
    let rows = history
        .run("100000002", &HistoryQuery::default(), dt("2024-04-02 10:00:00"))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, "110");
}

/// Scenario 5: TAK merge — two same-label readings merge into one interval,
/// and a later threshold-crossing reading truncates the earlier one's end.
#[test]
fn scenario_5_tak_merge_and_truncation() {
    let store = Store::open_in_memory().unwrap();
    seed_loinc(&store);
    let svc = RecordService::new(&store);
    svc.register_patient("100000003", "Dov", "Katz", "Male").unwrap();

    svc.insert_measurement(
        "100000003",
        Some("718-7"),
        None,
        "10",
        "mmol/L",
        "2024-04-01 09:00:00",
        dt("2024-04-01 09:01:00"),
    )
    .unwrap();
    svc.insert_measurement(
        "100000003",
        Some("718-7"),
        None,
        "11",
        "mmol/L",
        "2024-04-01 15:00:00",
        dt("2024-04-01 15:01:00"),
    )
    .unwrap();

    let config = CdssConfig {
        tak_dir: Path::new("tests/fixtures/tak").to_path_buf(),
        rules_dir: Path::new("tests/fixtures/rules").to_path_buf(),
        ..CdssConfig::default()
    };
    let orchestrator = Orchestrator::new(&store, &config);
    orchestrator.abstract_data(dt("2024-04-02 00:00:00")).unwrap();

    let rows = store.abstracted_visible_at(dt("2024-04-01 10:00:00")).unwrap();
    let low: Vec<_> = rows.iter().filter(|r| r.loinc_code == "718-7" && r.value == "Low").collect();
    assert_eq!(low.len(), 1, "the two Low readings should have merged into one interval");
    assert_eq!(low[0].start, dt("2024-03-31 21:00:00")); // 09:00 - 12h good-before
    assert_eq!(low[0].end, dt("2024-04-03 03:00:00")); // 15:00 + 12h good-after + 24h relevance

    // a High reading later the same day truncates the Low interval's end.
    svc.insert_measurement(
        "100000003",
        Some("718-7"),
        None,
        "17",
        "mmol/L",
        "2024-04-01 20:00:00",
        dt("2024-04-01 20:01:00"),
    )
    .unwrap();
    orchestrator.abstract_data(dt("2024-04-02 00:00:00")).unwrap();
    let rows = store.abstracted_visible_at(dt("2024-04-01 00:00:00")).unwrap();
    let low: Vec<_> = rows.iter().filter(|r| r.loinc_code == "718-7" && r.value == "Low").collect();
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].end, dt("2024-04-01 08:00:00")); // truncated to High's start (20:00 - 12h)
}

/// Scenario 6: declarative rule feeds the state cache consulted by a procedural rule;
/// a missing procedural parameter falls back.
#[test]
fn scenario_6_rule_cascade_with_state_cache() {
    let store = Store::open_in_memory().unwrap();
    seed_loinc(&store);
    let svc = RecordService::new(&store);
    svc.register_patient("100000004", "Roni", "Mizrahi", "Male").unwrap();
    svc.insert_measurement(
        "100000004",
        Some("718-7"),
        None,
        "10",
        "mmol/L",
        "2024-04-01 08:00:00",
        dt("2024-04-01 08:01:00"),
    )
    .unwrap();
    svc.insert_measurement(
        "100000004",
        Some("6690-2"),
        None,
        "6",
        "10*3/uL",
        "2024-04-01 08:00:00",
        dt("2024-04-01 08:01:00"),
    )
    .unwrap();

    let config = CdssConfig {
        tak_dir: Path::new("tests/fixtures/tak").to_path_buf(),
        rules_dir: Path::new("tests/fixtures/rules").to_path_buf(),
        ..CdssConfig::default()
    };
    let orchestrator = Orchestrator::new(&store, &config);
    orchestrator.abstract_data(dt("2024-04-01 12:00:00")).unwrap();

    let (snapshot_s, result) = orchestrator.analyze_clinical_state(dt("2024-04-01 12:00:00")).unwrap();
    assert_eq!(snapshot_s, "2024-04-01 12:00:00");
    let state = result.get("100000004").expect("patient present in result map");
    assert_eq!(state.get("hematological_state").map(String::as_str), Some("Anemia"));
    // systemic_toxicity is never supplied anywhere, so the procedural rule falls back.
    assert_eq!(
        state.get("treatment").map(String::as_str),
        Some("No recommendation - insufficient data")
    );
}
