use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourseSeed {
    id: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YearSeed {
    id: Option<String>,
    course_id: String,
    year_label: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SectionSeed {
    id: Option<String>,
    year_id: String,
    section_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeacherSeed {
    id: Option<String>,
    name: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentSeed {
    id: Option<String>,
    section_id: String,
    name: String,
    email: Option<String>,
    usn_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectSeed {
    id: Option<String>,
    teacher_id: String,
    year_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterSeed {
    #[serde(default)]
    courses: Vec<CourseSeed>,
    #[serde(default)]
    years: Vec<YearSeed>,
    #[serde(default)]
    sections: Vec<SectionSeed>,
    #[serde(default)]
    teachers: Vec<TeacherSeed>,
    #[serde(default)]
    students: Vec<StudentSeed>,
    #[serde(default)]
    subjects: Vec<SubjectSeed>,
}

fn seed_id(explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn map_seed_db_err(table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            HandlerErr {
                code: "bad_params",
                message: format!("unresolved reference or duplicate in {}: {}", table, e),
                details: Some(json!({ "table": table })),
            }
        }
        _ => HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        },
    }
}

/// Bulk roster import. The whole seed lands in one transaction; rows with
/// ids that already exist are updated in place.
fn roster_load(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let seed: RosterSeed = serde_json::from_value(params.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid roster seed: {}", e)))?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db)?;

    let mut counts = [0usize; 6];
    for c in seed.courses {
        tx.execute(
            "INSERT INTO course(id, name) VALUES(?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            (seed_id(c.id), &c.name),
        )
        .map_err(map_seed_db_err("course"))?;
        counts[0] += 1;
    }
    for y in seed.years {
        tx.execute(
            "INSERT INTO year_table(id, course_id, year_label) VALUES(?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               course_id = excluded.course_id,
               year_label = excluded.year_label",
            (seed_id(y.id), &y.course_id, &y.year_label),
        )
        .map_err(map_seed_db_err("year_table"))?;
        counts[1] += 1;
    }
    for s in seed.sections {
        tx.execute(
            "INSERT INTO sections(id, year_id, section_name) VALUES(?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               year_id = excluded.year_id,
               section_name = excluded.section_name",
            (seed_id(s.id), &s.year_id, &s.section_name),
        )
        .map_err(map_seed_db_err("sections"))?;
        counts[2] += 1;
    }
    for t in seed.teachers {
        tx.execute(
            "INSERT INTO teachers(id, name, email) VALUES(?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               email = excluded.email",
            (seed_id(t.id), &t.name, &t.email),
        )
        .map_err(map_seed_db_err("teachers"))?;
        counts[3] += 1;
    }
    for s in seed.students {
        tx.execute(
            "INSERT INTO students(id, section_id, name, email, usn_number)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               section_id = excluded.section_id,
               name = excluded.name,
               email = excluded.email,
               usn_number = excluded.usn_number",
            (seed_id(s.id), &s.section_id, &s.name, &s.email, &s.usn_number),
        )
        .map_err(map_seed_db_err("students"))?;
        counts[4] += 1;
    }
    for s in seed.subjects {
        tx.execute(
            "INSERT INTO subjects(id, teacher_id, year_id, name) VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               teacher_id = excluded.teacher_id,
               year_id = excluded.year_id,
               name = excluded.name",
            (seed_id(s.id), &s.teacher_id, &s.year_id, &s.name),
        )
        .map_err(map_seed_db_err("subjects"))?;
        counts[5] += 1;
    }

    tx.commit().map_err(HandlerErr::db)?;
    tracing::info!(
        courses = counts[0],
        years = counts[1],
        sections = counts[2],
        teachers = counts[3],
        students = counts[4],
        subjects = counts[5],
        "roster seed loaded"
    );
    Ok(json!({
        "courses": counts[0],
        "years": counts[1],
        "sections": counts[2],
        "teachers": counts[3],
        "students": counts[4],
        "subjects": counts[5]
    }))
}

fn students_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let students = roster::all_students(conn).map_err(HandlerErr::db)?;
    Ok(json!({ "students": students }))
}

fn students_by_subject(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    if !roster::subject_exists(conn, &subject_id).map_err(HandlerErr::db)? {
        return Err(HandlerErr::not_found("subject not found"));
    }
    let students = roster::students_in_subject_scope(conn, &subject_id).map_err(HandlerErr::db)?;
    Ok(json!({ "students": students }))
}

fn students_by_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let students = roster::students_by_teacher(conn, &teacher_id).map_err(HandlerErr::db)?;
    Ok(json!({ "students": students }))
}

fn subjects_by_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let subjects = roster::subjects_by_teacher(conn, &teacher_id).map_err(HandlerErr::db)?;
    Ok(json!({ "subjects": subjects }))
}

fn teacher_scope(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let scope = roster::resolve_teacher_scope(conn, &teacher_id).map_err(HandlerErr::db)?;
    Ok(json!({
        "subjectIds": scope.subject_ids,
        "yearIds": scope.year_ids
    }))
}

fn teacher_courses(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT c.id, c.name
             FROM course c
             JOIN year_table y ON y.course_id = c.id
             JOIN subjects s ON s.year_id = y.id
             WHERE s.teacher_id = ?
             ORDER BY c.name",
        )
        .map_err(HandlerErr::db)?;
    let courses = stmt
        .query_map([&teacher_id], |r| {
            Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "courses": courses }))
}

fn teacher_subjects_by_year(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let mut stmt = conn
        .prepare(
            "SELECT y.id, y.year_label, s.id, s.name
             FROM subjects s
             JOIN year_table y ON y.id = s.year_id
             WHERE s.teacher_id = ?
             ORDER BY y.year_label, s.name",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&teacher_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut years: Vec<(String, String, Vec<serde_json::Value>)> = Vec::new();
    for (year_id, year_label, subject_id, subject_name) in rows {
        let subject = json!({ "id": subject_id, "name": subject_name });
        match years.iter_mut().find(|(id, _, _)| *id == year_id) {
            Some((_, _, subjects)) => subjects.push(subject),
            None => years.push((year_id, year_label, vec![subject])),
        }
    }
    let years: Vec<serde_json::Value> = years
        .into_iter()
        .map(|(year_id, year_label, subjects)| {
            json!({ "yearId": year_id, "yearLabel": year_label, "subjects": subjects })
        })
        .collect();
    Ok(json!({ "years": years }))
}

fn section_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    conn.query_row(
        "SELECT id, year_id, section_name FROM sections WHERE id = ?",
        [&section_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "yearId": r.get::<_, String>(1)?,
                "sectionName": r.get::<_, String>(2)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::not_found("section not found"))
}

fn year_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let year_id = get_required_str(params, "yearId")?;
    conn.query_row(
        "SELECT id, course_id, year_label FROM year_table WHERE id = ?",
        [&year_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseId": r.get::<_, String>(1)?,
                "yearLabel": r.get::<_, String>(2)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::not_found("year not found"))
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
        "roster.load" => Some(run(state, roster_load)),
        "students.list" => Some(run(state, |c, _| students_list(c))),
        "students.bySubject" => Some(run(state, students_by_subject)),
        "students.byTeacher" => Some(run(state, students_by_teacher)),
        "subjects.byTeacher" => Some(run(state, subjects_by_teacher)),
        "teacher.scope" => Some(run(state, teacher_scope)),
        "teacher.courses" => Some(run(state, teacher_courses)),
        "teacher.subjectsByYear" => Some(run(state, teacher_subjects_by_year)),
        "sections.get" => Some(run(state, section_get)),
        "years.get" => Some(run(state, year_get)),
        _ => None,
    }
}
