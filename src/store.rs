//! Bi-temporal persistence. One exclusive SQLite connection behind a mutex —
//! every Record Service operation and every Orchestrator run takes the lock
//! once and holds it for the whole logical operation, so callers observe
//! atomic inserts/updates/deletes/abstraction-runs (spec §5).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params};

use crate::error::{CdssError, Result};
use crate::models::abstracted::{AbstractedMeasurement, AbstractedSource};
use crate::models::loinc::{AllowedValues, LoincEntry};
use crate::models::measurement::{HistoryRow, Measurement};
use crate::models::patient::{Patient, Sex};

/// A single WHERE-clause fragment for the history query. Each variant owns
/// its bound value; rendering never concatenates a user-supplied string into
/// the SQL text itself (spec §4.1 / REDESIGN FLAGS).
pub enum HistoryFilter {
    LoincNum(String),
    ComponentLike(String),
    StartAtOrAfter(NaiveDateTime),
    EndAtOrBefore(NaiveDateTime),
}

impl HistoryFilter {
    fn fragment(&self) -> &'static str {
        match self {
            HistoryFilter::LoincNum(_) => "m.LoincNum = ?",
            HistoryFilter::ComponentLike(_) => "LOWER(l.Component) LIKE '%' || LOWER(?) || '%'",
            HistoryFilter::StartAtOrAfter(_) => "m.ValidStartTime >= ?",
            HistoryFilter::EndAtOrBefore(_) => "m.ValidStartTime <= ?",
        }
    }

    fn bound(&self) -> Box<dyn ToSql> {
        match self {
            HistoryFilter::LoincNum(v) => Box::new(v.clone()),
            HistoryFilter::ComponentLike(v) => Box::new(v.clone()),
            HistoryFilter::StartAtOrAfter(v) | HistoryFilter::EndAtOrBefore(v) => Box::new(fmt_dt(*v)),
        }
    }
}

pub struct HistoryQueryParams {
    pub patient_id: String,
    pub snapshot: NaiveDateTime,
    pub filters: Vec<HistoryFilter>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

fn fmt_dt(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn parse_dt(s: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map_err(|_| rusqlite::Error::InvalidColumnType(0, s.to_string(), rusqlite::types::Type::Text))
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        let store = Self { conn: Mutex::new(conn) };
        store.log_table_counts();
        Ok(store)
    }

    fn log_table_counts(&self) {
        let conn = self.conn.lock().unwrap();
        for table in ["Patients", "Loinc", "Measurements", "AbstractedMeasurements"] {
            if let Ok(count) = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get::<_, i64>(0)) {
                tracing::info!(table, count, "table row count at startup");
            }
        }
    }

    // ---- generic primitives -------------------------------------------------

    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(sql, params)?)
    }

    pub fn scalar_string(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(sql, params, |r| r.get::<_, String>(0)).optional()?)
    }

    /// `sql` is expected to select a single INTEGER scalar (e.g. `SELECT 1 FROM ...`);
    /// reading it as `i64` — not `String` — avoids rusqlite's `FromSql` rejecting the
    /// literal's INTEGER storage class.
    pub fn exists(&self, sql: &str, params: &[&dyn ToSql]) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(sql, params, |r| r.get::<_, i64>(0)).optional()?.is_some())
    }

    // ---- transactional operations ------------------------------------------

    /// Run `f` inside one SQLite transaction. Either all of `f`'s writes
    /// commit, or none do (spec §5 — update's deletion-stamp-then-insert
    /// must be atomic; REDESIGN FLAGS addresses Open Question (a)).
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // ---- Patients -----------------------------------------------------------

    pub fn patient_exists(&self, patient_id: &str) -> Result<bool> {
        self.exists("SELECT 1 FROM Patients WHERE PatientId = ?1", &[&patient_id])
    }

    pub fn insert_patient_row(&self, patient: &Patient) -> Result<()> {
        self.execute(
            "INSERT INTO Patients (PatientId, FirstName, LastName, Sex) VALUES (?1, ?2, ?3, ?4)",
            &[&patient.patient_id, &patient.first_name, &patient.last_name, &patient.sex.as_str()],
        )?;
        Ok(())
    }

    pub fn get_patient(&self, patient_id: &str) -> Result<Option<Patient>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT PatientId, FirstName, LastName, Sex FROM Patients WHERE PatientId = ?1",
            [patient_id],
            |row| row_to_patient(row),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn patient_attrs(&self, patient_id: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.get_patient(patient_id)?.map(|p| {
            let mut attrs = BTreeMap::new();
            attrs.insert("sex".to_string(), p.sex.as_str().to_string());
            attrs
        }))
    }

    pub fn all_patient_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT PatientId FROM Patients ORDER BY PatientId")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- LOINC ---------------------------------------------------------------

    pub fn loinc_exists(&self, loinc_num: &str) -> Result<bool> {
        self.exists("SELECT 1 FROM Loinc WHERE LoincNum = ?1", &[&loinc_num])
    }

    pub fn insert_loinc_row(&self, entry: &LoincEntry) -> Result<()> {
        let allowed = entry.allowed_values.as_ref().map(|a| a.serialize());
        self.execute(
            "INSERT INTO Loinc (LoincNum, Component, Property, TimeAspect, System, ScaleType, MethodType, AllowedValues) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            &[
                &entry.loinc_num,
                &entry.component,
                &entry.property,
                &entry.time_aspect,
                &entry.system,
                &entry.scale_type,
                &entry.method_type,
                &allowed,
            ],
        )?;
        Ok(())
    }

    pub fn get_loinc(&self, loinc_num: &str) -> Result<Option<LoincEntry>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT LoincNum, Component, Property, TimeAspect, System, ScaleType, MethodType, AllowedValues \
             FROM Loinc WHERE LoincNum = ?1",
            [loinc_num],
            row_to_loinc,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Component → LoincNum resolution scoped to the whole LOINC dictionary
    /// (used for inserts, per spec §4.2).
    pub fn loinc_nums_for_component(&self, component: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT LoincNum FROM Loinc WHERE Component = ?1")?;
        let rows = stmt
            .query_map([component], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Component → LoincNum resolution scoped to one patient's measurements
    /// visible at `snapshot` (used for update/delete, per spec §4.2).
    pub fn loinc_nums_for_component_in_history(
        &self,
        component: &str,
        patient_id: &str,
        snapshot: NaiveDateTime,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let snapshot_s = fmt_dt(snapshot);
        let mut stmt = conn.prepare(
            "SELECT DISTINCT m.LoincNum FROM Measurements m \
             JOIN Loinc l ON l.LoincNum = m.LoincNum \
             WHERE l.Component = ?1 AND m.PatientId = ?2 \
             AND m.TransactionInsertionTime <= ?3 \
             AND (m.TransactionDeletionTime IS NULL OR m.TransactionDeletionTime > ?3)",
        )?;
        let rows = stmt
            .query_map(params![component, patient_id, snapshot_s], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- Measurements ---------------------------------------------------------

    /// The visible row (if any) for this natural key at `snapshot`.
    pub fn visible_measurement(
        &self,
        patient_id: &str,
        loinc_num: &str,
        valid_start_time: NaiveDateTime,
        snapshot: NaiveDateTime,
    ) -> Result<Option<Measurement>> {
        let conn = self.conn.lock().unwrap();
        visible_measurement_tx(&conn, patient_id, loinc_num, valid_start_time, snapshot)
    }

    /// The earliest `TransactionInsertionTime` strictly after `after`, for
    /// the same natural key — used to reject stale updates/deletes.
    pub fn next_lineage_time(
        &self,
        patient_id: &str,
        loinc_num: &str,
        valid_start_time: NaiveDateTime,
        after: NaiveDateTime,
    ) -> Result<Option<NaiveDateTime>> {
        let conn = self.conn.lock().unwrap();
        next_lineage_time_tx(&conn, patient_id, loinc_num, valid_start_time, after)
    }

    pub fn latest_valid_start_on_date(
        &self,
        patient_id: &str,
        loinc_num: &str,
        date: chrono::NaiveDate,
        snapshot: NaiveDateTime,
    ) -> Result<Option<NaiveDateTime>> {
        let conn = self.conn.lock().unwrap();
        let day_start = fmt_dt(date.and_hms_opt(0, 0, 0).unwrap());
        let day_end = fmt_dt(date.and_hms_opt(23, 59, 59).unwrap());
        let snapshot_s = fmt_dt(snapshot);
        conn.query_row(
            "SELECT MAX(ValidStartTime) FROM Measurements \
             WHERE PatientId = ?1 AND LoincNum = ?2 \
             AND ValidStartTime BETWEEN ?3 AND ?4 \
             AND TransactionInsertionTime <= ?5 \
             AND (TransactionDeletionTime IS NULL OR TransactionDeletionTime > ?5)",
            params![patient_id, loinc_num, day_start, day_end, snapshot_s],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten()
        .map(|s| parse_dt(&s).map_err(CdssError::from))
        .transpose()
    }

    pub fn insert_measurement_tx(conn: &Connection, m: &Measurement) -> Result<()> {
        conn.execute(
            "INSERT INTO Measurements (PatientId, LoincNum, Value, Unit, ValidStartTime, TransactionInsertionTime, TransactionDeletionTime) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                m.patient_id,
                m.loinc_num,
                m.value,
                m.unit,
                fmt_dt(m.valid_start_time),
                fmt_dt(m.transaction_insertion_time),
                m.transaction_deletion_time.map(fmt_dt),
            ],
        )?;
        Ok(())
    }

    /// Close every open (or later-than-`at`) lineage row for this natural key
    /// by stamping `TransactionDeletionTime = at`.
    pub fn close_lineage_tx(
        conn: &Connection,
        patient_id: &str,
        loinc_num: &str,
        valid_start_time: NaiveDateTime,
        at: NaiveDateTime,
    ) -> Result<usize> {
        let at_s = fmt_dt(at);
        let n = conn.execute(
            "UPDATE Measurements SET TransactionDeletionTime = ?1 \
             WHERE PatientId = ?2 AND LoincNum = ?3 AND ValidStartTime = ?4 \
             AND (TransactionDeletionTime IS NULL OR TransactionDeletionTime > ?1)",
            params![at_s, patient_id, loinc_num, fmt_dt(valid_start_time)],
        )?;
        Ok(n)
    }

    pub fn sticky_unit_tx(
        conn: &Connection,
        patient_id: &str,
        loinc_num: &str,
        valid_start_time: NaiveDateTime,
    ) -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT Unit FROM Measurements WHERE PatientId = ?1 AND LoincNum = ?2 AND ValidStartTime = ?3 \
                 ORDER BY TransactionInsertionTime DESC LIMIT 1",
                params![patient_id, loinc_num, fmt_dt(valid_start_time)],
                |r| r.get::<_, String>(0),
            )
            .optional()?)
    }

    pub fn measurement_key_visible_tx(
        conn: &Connection,
        patient_id: &str,
        loinc_num: &str,
        valid_start_time: NaiveDateTime,
        transaction_insertion_time: NaiveDateTime,
        snapshot: NaiveDateTime,
    ) -> Result<bool> {
        let snapshot_s = fmt_dt(snapshot);
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM Measurements WHERE PatientId = ?1 AND LoincNum = ?2 AND ValidStartTime = ?3 \
                 AND TransactionInsertionTime = ?4 \
                 AND TransactionInsertionTime <= ?5 \
                 AND (TransactionDeletionTime IS NULL OR TransactionDeletionTime > ?5)",
                params![
                    patient_id,
                    loinc_num,
                    fmt_dt(valid_start_time),
                    fmt_dt(transaction_insertion_time),
                    snapshot_s
                ],
                |r| r.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn history(&self, query: &HistoryQueryParams) -> Result<Vec<HistoryRow>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT m.LoincNum, l.Component, m.Value, m.Unit, m.ValidStartTime, m.TransactionInsertionTime \
             FROM Measurements m JOIN Loinc l ON l.LoincNum = m.LoincNum \
             WHERE m.PatientId = ? \
             AND m.TransactionInsertionTime <= ? \
             AND (m.TransactionDeletionTime IS NULL OR m.TransactionDeletionTime > ?)",
        );
        let snapshot_s = fmt_dt(query.snapshot);
        let mut bound: Vec<Box<dyn ToSql>> =
            vec![Box::new(query.patient_id.clone()), Box::new(snapshot_s.clone()), Box::new(snapshot_s)];
        for filter in &query.filters {
            sql.push_str(" AND ");
            sql.push_str(filter.fragment());
            bound.push(filter.bound());
        }
        sql.push_str(" ORDER BY m.ValidStartTime ASC, m.TransactionInsertionTime ASC");

        let refs: Vec<&dyn ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(refs.as_slice(), row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All measurement rows visible at `snapshot`, unfiltered — the raw
    /// input to the Mediator (spec §4.5 step 1).
    pub fn visible_measurements_for_patient(
        &self,
        patient_id: &str,
        snapshot: NaiveDateTime,
    ) -> Result<Vec<Measurement>> {
        let conn = self.conn.lock().unwrap();
        let snapshot_s = fmt_dt(snapshot);
        let mut stmt = conn.prepare(
            "SELECT PatientId, LoincNum, Value, Unit, ValidStartTime, TransactionInsertionTime, TransactionDeletionTime \
             FROM Measurements WHERE PatientId = ?1 \
             AND TransactionInsertionTime <= ?2 \
             AND (TransactionDeletionTime IS NULL OR TransactionDeletionTime > ?2)",
        )?;
        let rows = stmt
            .query_map(params![patient_id, snapshot_s], row_to_measurement)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- AbstractedMeasurements ------------------------------------------------

    pub fn truncate_abstracted_tx(conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM AbstractedMeasurements", [])?;
        Ok(())
    }

    pub fn insert_abstracted_tx(conn: &Connection, row: &AbstractedMeasurement) -> Result<()> {
        conn.execute(
            "INSERT INTO AbstractedMeasurements (PatientId, LoincCode, ConceptName, Value, StartDateTime, EndDateTime) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.patient_id,
                row.loinc_code,
                row.concept_name,
                row.value,
                fmt_dt(row.start),
                fmt_dt(row.end),
            ],
        )?;
        Ok(())
    }

    pub fn abstracted_visible_at(&self, snapshot: NaiveDateTime) -> Result<Vec<AbstractedMeasurement>> {
        let conn = self.conn.lock().unwrap();
        let snapshot_s = fmt_dt(snapshot);
        let mut stmt = conn.prepare(
            "SELECT PatientId, LoincCode, ConceptName, Value, StartDateTime, EndDateTime \
             FROM AbstractedMeasurements WHERE StartDateTime <= ?1 AND EndDateTime >= ?1",
        )?;
        let rows = stmt
            .query_map([&snapshot_s], row_to_abstracted)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_patient(row: &Row) -> rusqlite::Result<Patient> {
    let sex_s: String = row.get(3)?;
    let sex = Sex::parse(&sex_s).unwrap_or(Sex::Male);
    Ok(Patient {
        patient_id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        sex,
    })
}

fn row_to_loinc(row: &Row) -> rusqlite::Result<LoincEntry> {
    let allowed: Option<String> = row.get(7)?;
    Ok(LoincEntry {
        loinc_num: row.get(0)?,
        component: row.get(1)?,
        property: row.get(2)?,
        time_aspect: row.get(3)?,
        system: row.get(4)?,
        scale_type: row.get(5)?,
        method_type: row.get(6)?,
        allowed_values: allowed.map(|a| AllowedValues::parse(&a)),
    })
}

fn row_to_history(row: &Row) -> rusqlite::Result<HistoryRow> {
    Ok(HistoryRow {
        loinc_num: row.get(0)?,
        concept_name: row.get(1)?,
        value: row.get(2)?,
        unit: row.get(3)?,
        valid_start_time: parse_row_dt(row, 4)?,
        transaction_insertion_time: parse_row_dt(row, 5)?,
    })
}

fn row_to_measurement(row: &Row) -> rusqlite::Result<Measurement> {
    let deletion: Option<String> = row.get(6)?;
    Ok(Measurement {
        patient_id: row.get(0)?,
        loinc_num: row.get(1)?,
        value: row.get(2)?,
        unit: row.get(3)?,
        valid_start_time: parse_row_dt(row, 4)?,
        transaction_insertion_time: parse_row_dt(row, 5)?,
        transaction_deletion_time: deletion.map(|s| parse_dt(&s)).transpose()?,
    })
}

fn row_to_abstracted(row: &Row) -> rusqlite::Result<AbstractedMeasurement> {
    Ok(AbstractedMeasurement {
        patient_id: row.get(0)?,
        loinc_code: row.get(1)?,
        concept_name: row.get(2)?,
        value: row.get(3)?,
        start: parse_row_dt(row, 4)?,
        end: parse_row_dt(row, 5)?,
        source: AbstractedSource::Abstracted,
    })
}

fn parse_row_dt(row: &Row, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let s: String = row.get(idx)?;
    parse_dt(&s)
}

pub(crate) fn patient_exists_tx(conn: &Connection, patient_id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM Patients WHERE PatientId = ?1", [patient_id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub(crate) fn loinc_exists_tx(conn: &Connection, loinc_num: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM Loinc WHERE LoincNum = ?1", [loinc_num], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub(crate) fn get_loinc_tx(conn: &Connection, loinc_num: &str) -> Result<Option<LoincEntry>> {
    conn.query_row(
        "SELECT LoincNum, Component, Property, TimeAspect, System, ScaleType, MethodType, AllowedValues \
         FROM Loinc WHERE LoincNum = ?1",
        [loinc_num],
        row_to_loinc,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn loinc_nums_for_component_tx(conn: &Connection, component: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT LoincNum FROM Loinc WHERE Component = ?1")?;
    let rows = stmt
        .query_map([component], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn loinc_nums_for_component_in_history_tx(
    conn: &Connection,
    component: &str,
    patient_id: &str,
    snapshot: NaiveDateTime,
) -> Result<Vec<String>> {
    let snapshot_s = fmt_dt(snapshot);
    let mut stmt = conn.prepare(
        "SELECT DISTINCT m.LoincNum FROM Measurements m \
         JOIN Loinc l ON l.LoincNum = m.LoincNum \
         WHERE l.Component = ?1 AND m.PatientId = ?2 \
         AND m.TransactionInsertionTime <= ?3 \
         AND (m.TransactionDeletionTime IS NULL OR m.TransactionDeletionTime > ?3)",
    )?;
    let rows = stmt
        .query_map(params![component, patient_id, snapshot_s], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn latest_valid_start_on_date_tx(
    conn: &Connection,
    patient_id: &str,
    loinc_num: &str,
    date: chrono::NaiveDate,
    snapshot: NaiveDateTime,
) -> Result<Option<NaiveDateTime>> {
    let day_start = fmt_dt(date.and_hms_opt(0, 0, 0).unwrap());
    let day_end = fmt_dt(date.and_hms_opt(23, 59, 59).unwrap());
    let snapshot_s = fmt_dt(snapshot);
    conn.query_row(
        "SELECT MAX(ValidStartTime) FROM Measurements \
         WHERE PatientId = ?1 AND LoincNum = ?2 \
         AND ValidStartTime BETWEEN ?3 AND ?4 \
         AND TransactionInsertionTime <= ?5 \
         AND (TransactionDeletionTime IS NULL OR TransactionDeletionTime > ?5)",
        params![patient_id, loinc_num, day_start, day_end, snapshot_s],
        |r| r.get::<_, Option<String>>(0),
    )
    .optional()?
    .flatten()
    .map(|s| parse_dt(&s).map_err(CdssError::from))
    .transpose()
}

pub(crate) fn visible_measurement_tx(
    conn: &Connection,
    patient_id: &str,
    loinc_num: &str,
    valid_start_time: NaiveDateTime,
    snapshot: NaiveDateTime,
) -> Result<Option<Measurement>> {
    let snapshot_s = fmt_dt(snapshot);
    conn.query_row(
        "SELECT PatientId, LoincNum, Value, Unit, ValidStartTime, TransactionInsertionTime, TransactionDeletionTime \
         FROM Measurements WHERE PatientId = ?1 AND LoincNum = ?2 AND ValidStartTime = ?3 \
         AND TransactionInsertionTime <= ?4 \
         AND (TransactionDeletionTime IS NULL OR TransactionDeletionTime > ?4) \
         ORDER BY TransactionInsertionTime DESC LIMIT 1",
        params![patient_id, loinc_num, fmt_dt(valid_start_time), snapshot_s],
        row_to_measurement,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn next_lineage_time_tx(
    conn: &Connection,
    patient_id: &str,
    loinc_num: &str,
    valid_start_time: NaiveDateTime,
    after: NaiveDateTime,
) -> Result<Option<NaiveDateTime>> {
    let after_s = fmt_dt(after);
    let s: Option<String> = conn
        .query_row(
            "SELECT MIN(TransactionInsertionTime) FROM Measurements \
             WHERE PatientId = ?1 AND LoincNum = ?2 AND ValidStartTime = ?3 AND TransactionInsertionTime > ?4",
            params![patient_id, loinc_num, fmt_dt(valid_start_time), after_s],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    s.map(|s| parse_dt(&s).map_err(CdssError::from)).transpose()
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS Patients (
            PatientId TEXT PRIMARY KEY,
            FirstName TEXT NOT NULL,
            LastName  TEXT NOT NULL,
            Sex       TEXT NOT NULL CHECK(Sex IN ('Male','Female'))
        );

        CREATE TABLE IF NOT EXISTS Loinc (
            LoincNum      TEXT PRIMARY KEY,
            Component     TEXT NOT NULL,
            Property      TEXT NOT NULL,
            TimeAspect    TEXT NOT NULL,
            System        TEXT NOT NULL,
            ScaleType     TEXT NOT NULL,
            MethodType    TEXT NOT NULL,
            AllowedValues TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_loinc_component ON Loinc(Component);

        CREATE TABLE IF NOT EXISTS Measurements (
            MeasurementId INTEGER PRIMARY KEY AUTOINCREMENT,
            PatientId TEXT NOT NULL REFERENCES Patients(PatientId),
            LoincNum  TEXT NOT NULL REFERENCES Loinc(LoincNum),
            Value     TEXT NOT NULL,
            Unit      TEXT NOT NULL,
            ValidStartTime TEXT NOT NULL,
            TransactionInsertionTime TEXT NOT NULL,
            TransactionDeletionTime TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_measurements_natural_key
            ON Measurements(PatientId, LoincNum, ValidStartTime, TransactionInsertionTime);
        CREATE INDEX IF NOT EXISTS idx_measurements_lineage
            ON Measurements(PatientId, LoincNum, ValidStartTime);

        CREATE TABLE IF NOT EXISTS AbstractedMeasurements (
            PatientId TEXT NOT NULL,
            LoincCode TEXT NOT NULL,
            ConceptName TEXT NOT NULL,
            Value TEXT NOT NULL,
            StartDateTime TEXT NOT NULL,
            EndDateTime TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_abstracted_patient ON AbstractedMeasurements(PatientId, LoincCode);
        ",
    )?;
    Ok(())
}
