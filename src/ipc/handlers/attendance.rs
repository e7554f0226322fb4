use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, with_store_retry, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, LedgerError};
use crate::roster;
use chrono::Local;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{HashMap, HashSet};

struct AttendanceBatch {
    subject_id: String,
    date: String,
    rows: Vec<(String, bool)>,
}

/// Gateway validation: the whole batch is vetted before a single ledger
/// write, so a rejection never leaves a partial application behind.
fn validate_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<AttendanceBatch, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date_raw = get_required_str(params, "date")?;

    let date = ledger::parse_submission_date(&date_raw, Local::now().date_naive())
        .map_err(HandlerErr::from)?;

    if !roster::subject_exists(conn, &subject_id).map_err(HandlerErr::db)? {
        return Err(LedgerError::Validation(format!("unknown subject: {}", subject_id)).into());
    }
    if !roster::is_authorized(conn, &teacher_id, &subject_id).map_err(HandlerErr::db)? {
        return Err(LedgerError::Validation(format!(
            "teacher {} is not authorized for subject {}",
            teacher_id, subject_id
        ))
        .into());
    }

    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };

    // Entries without a present flag were never filled in by the teacher;
    // they are not part of the batch.
    let mut rows: Vec<(String, bool)> = Vec::new();
    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr::bad_params("entry missing studentId"));
        };
        let Some(present) = entry.get("present").and_then(|v| v.as_bool()) else {
            continue;
        };
        rows.push((student_id.to_string(), present));
    }

    let scope: HashSet<String> = roster::students_in_subject_scope(conn, &subject_id)
        .map_err(HandlerErr::db)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    for (student_id, _) in &rows {
        if !scope.contains(student_id) {
            return Err(LedgerError::Validation(format!(
                "student {} is not in the roster scope of subject {}",
                student_id, subject_id
            ))
            .into());
        }
    }

    if rows.is_empty() {
        return Err(LedgerError::EmptySubmission.into());
    }

    Ok(AttendanceBatch {
        subject_id,
        date: date.format("%Y-%m-%d").to_string(),
        rows,
    })
}

fn submit_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch = validate_batch(conn, params)?;

    let applied = with_store_retry(|| {
        let tx = conn.unchecked_transaction()?;
        for (student_id, present) in &batch.rows {
            ledger::record_attendance(&tx, student_id, &batch.subject_id, &batch.date, *present)?;
        }
        tx.commit()?;
        Ok(batch.rows.len())
    })
    .map_err(|e| {
        if matches!(e, LedgerError::Aggregation(_)) {
            tracing::error!(subject = %batch.subject_id, date = %batch.date, error = %e,
                "attendance batch rolled back");
        }
        HandlerErr::from(e)
    })?;

    tracing::info!(subject = %batch.subject_id, date = %batch.date, applied,
        "attendance batch applied");
    Ok(json!({ "applied": applied }))
}

/// Own-record view: every subject of the student's year, zero-valued where
/// no class has been held yet, plus the raw log newest-first per subject.
fn by_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if roster::resolve_student_section(conn, &student_id)
        .map_err(HandlerErr::db)?
        .is_none()
    {
        return Err(HandlerErr::not_found("student not found"));
    }

    let subjects = roster::subjects_for_student(conn, &student_id).map_err(HandlerErr::db)?;
    let log = ledger::attendance_by_student(conn, &student_id).map_err(HandlerErr::from)?;
    let mut log_by_subject: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    for rec in log {
        log_by_subject
            .entry(rec.subject_id.clone())
            .or_default()
            .push(json!({ "date": rec.date, "present": rec.present }));
    }

    let mut records = Vec::with_capacity(subjects.len());
    for subject in subjects {
        let summary = ledger::attendance_summary_for(conn, &student_id, &subject.id)
            .map_err(HandlerErr::from)?
            .unwrap_or(ledger::AttendanceSummary {
                total_classes: 0,
                attended_classes: 0,
            });
        records.push(json!({
            "subjectId": subject.id,
            "subjectName": subject.name,
            "totalClasses": summary.total_classes,
            "attendedClasses": summary.attended_classes,
            "log": log_by_subject.remove(&subject.id).unwrap_or_default()
        }));
    }
    Ok(json!({ "records": records }))
}

/// Class-roster view: every student in the subject's scope appears, with a
/// zero-valued summary when nothing has been recorded for them yet.
fn by_subject(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    if !roster::subject_exists(conn, &subject_id).map_err(HandlerErr::db)? {
        return Err(HandlerErr::not_found("subject not found"));
    }

    let students = roster::students_in_subject_scope(conn, &subject_id).map_err(HandlerErr::db)?;
    let mut rows = Vec::with_capacity(students.len());
    for student in students {
        let summary = ledger::attendance_summary_for(conn, &student.id, &subject_id)
            .map_err(HandlerErr::from)?
            .unwrap_or(ledger::AttendanceSummary {
                total_classes: 0,
                attended_classes: 0,
            });
        let percent = if summary.total_classes > 0 {
            100.0 * summary.attended_classes as f64 / summary.total_classes as f64
        } else {
            0.0
        };
        rows.push(json!({
            "studentId": student.id,
            "name": student.name,
            "usnNumber": student.usn_number,
            "totalClasses": summary.total_classes,
            "attendedClasses": summary.attended_classes,
            "percent": (percent * 10.0).round() / 10.0
        }));
    }
    Ok(json!({ "rows": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |state: &mut AppState,
               f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>|
     -> serde_json::Value {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        match f(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(error) => error.response(&req.id),
        }
    };

    match req.method.as_str() {
        "attendance.submitBatch" => Some(run(state, submit_batch)),
        "attendance.byStudent" => Some(run(state, by_student)),
        "attendance.bySubject" => Some(run(state, by_subject)),
        _ => None,
    }
}
