use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

/// One student with the section/year/course chain resolved up front.
/// Queries either produce a fully-joined row or fail; there is no partially
/// resolved student.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStudent {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub usn_number: String,
    pub section_id: String,
    pub section_name: String,
    pub year_label: String,
    pub course_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterSubject {
    pub id: String,
    pub teacher_id: String,
    pub year_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct TeacherScope {
    pub subject_ids: Vec<String>,
    pub year_ids: Vec<String>,
}

const STUDENT_JOIN: &str = "SELECT st.id, st.name, st.email, st.usn_number,
        sec.id, sec.section_name, yr.year_label, c.name
     FROM students st
     JOIN sections sec ON sec.id = st.section_id
     JOIN year_table yr ON yr.id = sec.year_id
     JOIN course c ON c.id = yr.course_id";

fn student_from_row(r: &rusqlite::Row) -> rusqlite::Result<RosterStudent> {
    Ok(RosterStudent {
        id: r.get(0)?,
        name: r.get(1)?,
        email: r.get(2)?,
        usn_number: r.get(3)?,
        section_id: r.get(4)?,
        section_name: r.get(5)?,
        year_label: r.get(6)?,
        course_name: r.get(7)?,
    })
}

pub fn all_students(conn: &Connection) -> rusqlite::Result<Vec<RosterStudent>> {
    let sql = format!("{} ORDER BY st.usn_number", STUDENT_JOIN);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Roster scope of one subject: every student whose section belongs to the
/// subject's year. This is the population a teacher may submit for.
pub fn students_in_subject_scope(
    conn: &Connection,
    subject_id: &str,
) -> rusqlite::Result<Vec<RosterStudent>> {
    let sql = format!(
        "{} WHERE sec.year_id = (SELECT year_id FROM subjects WHERE id = ?)
         ORDER BY st.usn_number",
        STUDENT_JOIN
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([subject_id], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn students_by_teacher(
    conn: &Connection,
    teacher_id: &str,
) -> rusqlite::Result<Vec<RosterStudent>> {
    let sql = format!(
        "{} WHERE sec.year_id IN (SELECT year_id FROM subjects WHERE teacher_id = ?)
         ORDER BY st.usn_number",
        STUDENT_JOIN
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([teacher_id], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn subjects_by_teacher(
    conn: &Connection,
    teacher_id: &str,
) -> rusqlite::Result<Vec<RosterSubject>> {
    let mut stmt = conn.prepare(
        "SELECT id, teacher_id, year_id, name FROM subjects
         WHERE teacher_id = ? ORDER BY name",
    )?;
    let rows = stmt
        .query_map([teacher_id], |r| {
            Ok(RosterSubject {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                year_id: r.get(2)?,
                name: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn resolve_teacher_scope(
    conn: &Connection,
    teacher_id: &str,
) -> rusqlite::Result<TeacherScope> {
    let subjects = subjects_by_teacher(conn, teacher_id)?;
    let mut year_ids: Vec<String> = subjects.iter().map(|s| s.year_id.clone()).collect();
    year_ids.sort();
    year_ids.dedup();
    Ok(TeacherScope {
        subject_ids: subjects.into_iter().map(|s| s.id).collect(),
        year_ids,
    })
}

pub fn is_authorized(
    conn: &Connection,
    teacher_id: &str,
    subject_id: &str,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM subjects WHERE id = ? AND teacher_id = ?",
        (subject_id, teacher_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

pub fn resolve_student_section(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT section_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
}

pub fn subject_exists(conn: &Connection, subject_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

/// Subjects of the year a student's section belongs to: the set of rows the
/// student's own dashboards are scoped to.
pub fn subjects_for_student(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Vec<RosterSubject>> {
    let mut stmt = conn.prepare(
        "SELECT sub.id, sub.teacher_id, sub.year_id, sub.name
         FROM subjects sub
         WHERE sub.year_id = (
             SELECT sec.year_id FROM students st
             JOIN sections sec ON sec.id = st.section_id
             WHERE st.id = ?
         )
         ORDER BY sub.id",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok(RosterSubject {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                year_id: r.get(2)?,
                name: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
