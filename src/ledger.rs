use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),
    #[error("no qualifying rows in submission")]
    EmptySubmission,
    #[error("{0}")]
    Aggregation(String),
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Busy/locked store failures are worth one more try; everything else is not.
pub fn is_transient(e: &LedgerError) -> bool {
    match e {
        LedgerError::Store(rusqlite::Error::SqliteFailure(f, _)) => matches!(
            f.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentSlot {
    Ia1,
    Ia2,
    TotalIa,
}

impl AssessmentSlot {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ia1" => Some(Self::Ia1),
            "ia2" => Some(Self::Ia2),
            "totalia" | "total_ia" => Some(Self::TotalIa),
            _ => None,
        }
    }

    /// Stable code stored in marks_log.slot; doubles as the marks_summary column name.
    pub fn code(self) -> &'static str {
        match self {
            Self::Ia1 => "ia1",
            Self::Ia2 => "ia2",
            Self::TotalIa => "total_ia",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub total_classes: i64,
    pub attended_classes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarksSummary {
    pub ia1: Option<f64>,
    pub ia2: Option<f64>,
    pub total_ia: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub student_id: String,
    pub subject_id: String,
    pub date: String,
    pub present: bool,
}

/// Submission dates are day-granular ISO dates; the future is not recordable.
pub fn parse_submission_date(raw: &str, today: NaiveDate) -> LedgerResult<NaiveDate> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| LedgerError::Validation(format!("date must be YYYY-MM-DD, got '{}'", raw)))?;
    if date > today {
        return Err(LedgerError::Validation(format!(
            "date {} is in the future",
            date
        )));
    }
    Ok(date)
}

fn roster_linked(conn: &Connection, student_id: &str, subject_id: &str) -> LedgerResult<()> {
    let student: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()?;
    if student.is_none() {
        return Err(LedgerError::Validation(format!(
            "unknown student: {}",
            student_id
        )));
    }
    let subject: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()?;
    if subject.is_none() {
        return Err(LedgerError::Validation(format!(
            "unknown subject: {}",
            subject_id
        )));
    }
    Ok(())
}

/// Append one attendance fact at its natural key and fold it into the summary.
///
/// A first sighting of (student, subject, date) grows the summary; a repeat
/// sighting is a correction: the ledger row is overwritten in place and the
/// summary is adjusted by the delta between old and new, never re-counted.
/// The prior value is read under the same transaction the caller opened, so
/// two corrections to one key cannot interleave their read and write.
pub fn record_attendance(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    date: &str,
    present: bool,
) -> LedgerResult<()> {
    roster_linked(conn, student_id, subject_id)?;

    let prior: Option<bool> = conn
        .query_row(
            "SELECT present FROM attendance_log
             WHERE student_id = ? AND subject_id = ? AND date = ?",
            (student_id, subject_id, date),
            |r| Ok(r.get::<_, i64>(0)? != 0),
        )
        .optional()?;
    let recorded_at = Utc::now().to_rfc3339();

    match prior {
        None => {
            conn.execute(
                "INSERT INTO attendance_log(id, student_id, subject_id, date, present, recorded_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    student_id,
                    subject_id,
                    date,
                    present as i64,
                    &recorded_at,
                ),
            )?;
            conn.execute(
                "INSERT INTO attendance_summary(student_id, subject_id, total_classes, attended_classes)
                 VALUES(?, ?, 1, ?)
                 ON CONFLICT(student_id, subject_id) DO UPDATE SET
                   total_classes = total_classes + 1,
                   attended_classes = attended_classes + excluded.attended_classes",
                (student_id, subject_id, present as i64),
            )?;
        }
        Some(old) => {
            conn.execute(
                "UPDATE attendance_log SET present = ?, recorded_at = ?
                 WHERE student_id = ? AND subject_id = ? AND date = ?",
                (present as i64, &recorded_at, student_id, subject_id, date),
            )?;
            let delta = present as i64 - old as i64;
            if delta != 0 {
                let touched = conn.execute(
                    "UPDATE attendance_summary
                     SET attended_classes = attended_classes + ?
                     WHERE student_id = ? AND subject_id = ?",
                    (delta, student_id, subject_id),
                )?;
                if touched != 1 {
                    return Err(LedgerError::Aggregation(format!(
                        "correction for ({}, {}) found no summary row",
                        student_id, subject_id
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Append one marks fact and overwrite its slot in the summary.
/// Slots carry no running totals: the latest submission wins outright.
pub fn record_marks(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    slot: AssessmentSlot,
    score: f64,
    date: &str,
) -> LedgerResult<()> {
    roster_linked(conn, student_id, subject_id)?;

    let recorded_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO marks_log(id, student_id, subject_id, slot, score, date, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, slot, date) DO UPDATE SET
           score = excluded.score,
           recorded_at = excluded.recorded_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            subject_id,
            slot.code(),
            score,
            date,
            &recorded_at,
        ),
    )?;

    // slot.code() is a static identifier, not caller input.
    let sql = format!(
        "INSERT INTO marks_summary(student_id, subject_id, {col})
         VALUES(?, ?, ?)
         ON CONFLICT(student_id, subject_id) DO UPDATE SET {col} = excluded.{col}",
        col = slot.code()
    );
    conn.execute(&sql, (student_id, subject_id, score))?;
    Ok(())
}

pub fn attendance_summary_for(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
) -> LedgerResult<Option<AttendanceSummary>> {
    let row = conn
        .query_row(
            "SELECT total_classes, attended_classes FROM attendance_summary
             WHERE student_id = ? AND subject_id = ?",
            (student_id, subject_id),
            |r| {
                Ok(AttendanceSummary {
                    total_classes: r.get(0)?,
                    attended_classes: r.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn marks_summary_for(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
) -> LedgerResult<Option<MarksSummary>> {
    let row = conn
        .query_row(
            "SELECT ia1, ia2, total_ia FROM marks_summary
             WHERE student_id = ? AND subject_id = ?",
            (student_id, subject_id),
            |r| {
                Ok(MarksSummary {
                    ia1: r.get(0)?,
                    ia2: r.get(1)?,
                    total_ia: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn attendance_by_student(
    conn: &Connection,
    student_id: &str,
) -> LedgerResult<Vec<AttendanceRecord>> {
    let mut stmt = conn.prepare(
        "SELECT student_id, subject_id, date, present FROM attendance_log
         WHERE student_id = ?
         ORDER BY subject_id ASC, date DESC",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok(AttendanceRecord {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                date: r.get(2)?,
                present: r.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn attendance_by_subject(
    conn: &Connection,
    subject_id: &str,
) -> LedgerResult<Vec<AttendanceRecord>> {
    let mut stmt = conn.prepare(
        "SELECT student_id, subject_id, date, present FROM attendance_log
         WHERE subject_id = ?
         ORDER BY student_id ASC, date DESC",
    )?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok(AttendanceRecord {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                date: r.get(2)?,
                present: r.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Recompute every attendance summary by full scan of the log.
/// Recovery path; tests use it to check the incremental fold.
pub fn rebuild_attendance_summary(conn: &Connection) -> LedgerResult<()> {
    conn.execute("DELETE FROM attendance_summary", [])?;
    conn.execute(
        "INSERT INTO attendance_summary(student_id, subject_id, total_classes, attended_classes)
         SELECT student_id, subject_id, COUNT(DISTINCT date), COALESCE(SUM(present), 0)
         FROM attendance_log
         GROUP BY student_id, subject_id",
        [],
    )?;
    Ok(())
}

/// Recompute marks summaries by replaying the log in submission order,
/// so the most recent entry per slot wins, same as the incremental path.
pub fn rebuild_marks_summary(conn: &Connection) -> LedgerResult<()> {
    conn.execute("DELETE FROM marks_summary", [])?;
    let mut stmt = conn.prepare(
        "SELECT student_id, subject_id, slot, score FROM marks_log
         ORDER BY date ASC, recorded_at ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (student_id, subject_id, slot_code, score) in rows {
        let slot = AssessmentSlot::parse(&slot_code).ok_or_else(|| {
            LedgerError::Aggregation(format!("unknown slot '{}' in marks_log", slot_code))
        })?;
        let sql = format!(
            "INSERT INTO marks_summary(student_id, subject_id, {col})
             VALUES(?, ?, ?)
             ON CONFLICT(student_id, subject_id) DO UPDATE SET {col} = excluded.{col}",
            col = slot.code()
        );
        conn.execute(&sql, (&student_id, &subject_id, score))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn seeded_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn.execute("INSERT INTO course(id, name) VALUES('C1', 'BCA')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO year_table(id, course_id, year_label) VALUES('Y1', 'C1', '2nd Year')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO sections(id, year_id, section_name) VALUES('SEC1', 'Y1', 'A')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO teachers(id, name, email) VALUES('T1', 'Asha', 'asha@college.test')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO students(id, section_id, name, email, usn_number)
             VALUES('S1', 'SEC1', 'Ravi', NULL, 'USN001'),
                   ('S2', 'SEC1', 'Meena', NULL, 'USN002')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO subjects(id, teacher_id, year_id, name) VALUES('P1', 'T1', 'Y1', 'DBMS')",
            [],
        )
        .unwrap();
        conn
    }

    fn summary(conn: &Connection, student: &str, subject: &str) -> AttendanceSummary {
        attendance_summary_for(conn, student, subject)
            .expect("query summary")
            .expect("summary row present")
    }

    #[test]
    fn two_dates_then_correction() {
        let conn = seeded_conn();
        record_attendance(&conn, "S1", "P1", "2024-01-10", true).unwrap();
        record_attendance(&conn, "S1", "P1", "2024-01-11", false).unwrap();
        assert_eq!(
            summary(&conn, "S1", "P1"),
            AttendanceSummary {
                total_classes: 2,
                attended_classes: 1
            }
        );

        // Correcting an existing date keeps the total and moves attended by the delta.
        record_attendance(&conn, "S1", "P1", "2024-01-10", false).unwrap();
        assert_eq!(
            summary(&conn, "S1", "P1"),
            AttendanceSummary {
                total_classes: 2,
                attended_classes: 0
            }
        );

        let log_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM attendance_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(log_rows, 2);
    }

    #[test]
    fn identical_resubmission_is_idempotent() {
        let conn = seeded_conn();
        record_attendance(&conn, "S1", "P1", "2024-02-01", true).unwrap();
        record_attendance(&conn, "S1", "P1", "2024-02-01", true).unwrap();
        assert_eq!(
            summary(&conn, "S1", "P1"),
            AttendanceSummary {
                total_classes: 1,
                attended_classes: 1
            }
        );
    }

    #[test]
    fn ordered_corrections_leave_last_value() {
        let conn = seeded_conn();
        record_attendance(&conn, "S1", "P1", "2024-03-05", false).unwrap();
        record_attendance(&conn, "S1", "P1", "2024-03-05", true).unwrap();
        record_attendance(&conn, "S1", "P1", "2024-03-05", false).unwrap();
        assert_eq!(
            summary(&conn, "S1", "P1"),
            AttendanceSummary {
                total_classes: 1,
                attended_classes: 0
            }
        );
    }

    #[test]
    fn incremental_fold_matches_full_rebuild() {
        let conn = seeded_conn();
        let script: &[(&str, &str, bool)] = &[
            ("S1", "2024-01-10", true),
            ("S2", "2024-01-10", false),
            ("S1", "2024-01-11", true),
            ("S2", "2024-01-11", true),
            ("S1", "2024-01-10", false), // correction
            ("S2", "2024-01-12", true),
            ("S2", "2024-01-10", false), // identical resubmission
        ];
        for (student, date, present) in script {
            record_attendance(&conn, student, "P1", date, *present).unwrap();
        }

        let incremental: Vec<(String, i64, i64)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT student_id, total_classes, attended_classes
                     FROM attendance_summary ORDER BY student_id",
                )
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap()
        };

        rebuild_attendance_summary(&conn).unwrap();
        let rebuilt: Vec<(String, i64, i64)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT student_id, total_classes, attended_classes
                     FROM attendance_summary ORDER BY student_id",
                )
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap()
        };

        assert_eq!(incremental, rebuilt);
        assert_eq!(incremental[0], ("S1".to_string(), 2, 1));
        assert_eq!(incremental[1], ("S2".to_string(), 3, 2));
    }

    #[test]
    fn marks_slot_overwrites_not_adds() {
        let conn = seeded_conn();
        record_marks(&conn, "S1", "P1", AssessmentSlot::Ia1, 40.0, "2024-02-10").unwrap();
        record_marks(&conn, "S1", "P1", AssessmentSlot::Ia1, 45.0, "2024-02-20").unwrap();
        record_marks(&conn, "S1", "P1", AssessmentSlot::Ia2, 30.0, "2024-03-15").unwrap();

        let s = marks_summary_for(&conn, "S1", "P1").unwrap().unwrap();
        assert_eq!(s.ia1, Some(45.0));
        assert_eq!(s.ia2, Some(30.0));
        assert_eq!(s.total_ia, None);
    }

    #[test]
    fn marks_rebuild_replays_in_submission_order() {
        let conn = seeded_conn();
        record_marks(&conn, "S1", "P1", AssessmentSlot::Ia1, 40.0, "2024-02-10").unwrap();
        record_marks(&conn, "S1", "P1", AssessmentSlot::Ia1, 45.0, "2024-02-20").unwrap();
        rebuild_marks_summary(&conn).unwrap();
        let s = marks_summary_for(&conn, "S1", "P1").unwrap().unwrap();
        assert_eq!(s.ia1, Some(45.0));
    }

    #[test]
    fn unknown_roster_keys_are_rejected() {
        let conn = seeded_conn();
        let e = record_attendance(&conn, "NOPE", "P1", "2024-01-10", true).unwrap_err();
        assert!(matches!(e, LedgerError::Validation(_)));
        let e = record_attendance(&conn, "S1", "NOPE", "2024-01-10", true).unwrap_err();
        assert!(matches!(e, LedgerError::Validation(_)));

        let log_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM attendance_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(log_rows, 0);
    }

    #[test]
    fn correction_without_summary_row_is_an_aggregation_error() {
        let conn = seeded_conn();
        record_attendance(&conn, "S1", "P1", "2024-01-10", true).unwrap();
        // Simulate a summary lost out from under the ledger.
        conn.execute("DELETE FROM attendance_summary", []).unwrap();
        let e = record_attendance(&conn, "S1", "P1", "2024-01-10", false).unwrap_err();
        assert!(matches!(e, LedgerError::Aggregation(_)));
    }

    #[test]
    fn submission_dates_must_be_well_formed_and_not_future() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert!(parse_submission_date("2024-05-31", today).is_ok());
        assert!(parse_submission_date("2024-06-01", today).is_ok());
        assert!(matches!(
            parse_submission_date("2024-06-02", today),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            parse_submission_date("01/06/2024", today),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn slot_codes_round_trip() {
        for slot in [
            AssessmentSlot::Ia1,
            AssessmentSlot::Ia2,
            AssessmentSlot::TotalIa,
        ] {
            assert_eq!(AssessmentSlot::parse(slot.code()), Some(slot));
        }
        assert_eq!(AssessmentSlot::parse("IA1"), Some(AssessmentSlot::Ia1));
        assert_eq!(AssessmentSlot::parse("TotalIA"), Some(AssessmentSlot::TotalIa));
        assert_eq!(AssessmentSlot::parse("final"), None);
    }
}
