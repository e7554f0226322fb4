use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, with_store_retry, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, AssessmentSlot, LedgerError, MarksSummary};
use crate::roster;
use chrono::Local;
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;

struct MarksBatch {
    subject_id: String,
    slot: AssessmentSlot,
    date: String,
    rows: Vec<(String, f64)>,
}

fn validate_batch(conn: &Connection, params: &serde_json::Value) -> Result<MarksBatch, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date_raw = get_required_str(params, "date")?;
    let slot_raw = get_required_str(params, "slot")?;

    let slot = AssessmentSlot::parse(&slot_raw).ok_or_else(|| {
        HandlerErr::bad_params(format!("slot must be IA1, IA2 or TotalIA, got '{}'", slot_raw))
    })?;
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

    // Blank, non-numeric and zero scores mean "not submitted for this
    // student"; they are excluded, never coerced to a real zero mark.
    let mut rows: Vec<(String, f64)> = Vec::new();
    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr::bad_params("entry missing studentId"));
        };
        let Some(score) = entry.get("score").and_then(|v| v.as_f64()) else {
            continue;
        };
        if score < 0.0 {
            return Err(LedgerError::Validation(format!(
                "negative score for student {}",
                student_id
            ))
            .into());
        }
        if score == 0.0 {
            continue;
        }
        rows.push((student_id.to_string(), score));
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

    Ok(MarksBatch {
        subject_id,
        slot,
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
        for (student_id, score) in &batch.rows {
            ledger::record_marks(
                &tx,
                student_id,
                &batch.subject_id,
                batch.slot,
                *score,
                &batch.date,
            )?;
        }
        tx.commit()?;
        Ok(batch.rows.len())
    })
    .map_err(|e| {
        if matches!(e, LedgerError::Aggregation(_)) {
            tracing::error!(subject = %batch.subject_id, slot = batch.slot.code(), error = %e,
                "marks batch rolled back");
        }
        HandlerErr::from(e)
    })?;

    tracing::info!(subject = %batch.subject_id, slot = batch.slot.code(), date = %batch.date,
        applied, "marks batch applied");
    Ok(json!({ "applied": applied }))
}

fn slot_values(summary: Option<MarksSummary>) -> (f64, f64, f64) {
    // Dashboards render a plain 0 for never-submitted slots.
    match summary {
        Some(s) => (
            s.ia1.unwrap_or(0.0),
            s.ia2.unwrap_or(0.0),
            s.total_ia.unwrap_or(0.0),
        ),
        None => (0.0, 0.0, 0.0),
    }
}

fn by_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if roster::resolve_student_section(conn, &student_id)
        .map_err(HandlerErr::db)?
        .is_none()
    {
        return Err(HandlerErr::not_found("student not found"));
    }

    let subjects = roster::subjects_for_student(conn, &student_id).map_err(HandlerErr::db)?;
    let mut records = Vec::with_capacity(subjects.len());
    for subject in subjects {
        let summary =
            ledger::marks_summary_for(conn, &student_id, &subject.id).map_err(HandlerErr::from)?;
        let (ia1, ia2, total_ia) = slot_values(summary);
        records.push(json!({
            "subjectId": subject.id,
            "subjectName": subject.name,
            "ia1": ia1,
            "ia2": ia2,
            "totalIa": total_ia
        }));
    }
    Ok(json!({ "records": records }))
}

fn by_subject(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    if !roster::subject_exists(conn, &subject_id).map_err(HandlerErr::db)? {
        return Err(HandlerErr::not_found("subject not found"));
    }

    let students = roster::students_in_subject_scope(conn, &subject_id).map_err(HandlerErr::db)?;
    let mut rows = Vec::with_capacity(students.len());
    for student in students {
        let summary =
            ledger::marks_summary_for(conn, &student.id, &subject_id).map_err(HandlerErr::from)?;
        let (ia1, ia2, total_ia) = slot_values(summary);
        rows.push(json!({
            "studentId": student.id,
            "name": student.name,
            "usnNumber": student.usn_number,
            "ia1": ia1,
            "ia2": ia2,
            "totalIa": total_ia
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
        "marks.submitBatch" => Some(run(state, submit_batch)),
        "marks.byStudent" => Some(run(state, by_student)),
        "marks.bySubject" => Some(run(state, by_subject)),
        _ => None,
    }
}
