use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rollbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn seed_two_year_roster(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let _ = request_ok(
        stdin,
        reader,
        "seed",
        "roster.load",
        json!({
            "courses": [{ "id": "C1", "name": "BCA" }],
            "years": [
                { "id": "Y1", "courseId": "C1", "yearLabel": "2nd Year" },
                { "id": "Y2", "courseId": "C1", "yearLabel": "3rd Year" }
            ],
            "sections": [
                { "id": "SEC-A", "yearId": "Y1", "sectionName": "A" },
                { "id": "SEC-B", "yearId": "Y2", "sectionName": "B" }
            ],
            "teachers": [{ "id": "T1", "name": "Asha" }],
            "students": [
                { "id": "S1", "sectionId": "SEC-A", "name": "Ravi", "usnNumber": "USN001" },
                { "id": "S2", "sectionId": "SEC-A", "name": "Meena", "usnNumber": "USN002" },
                { "id": "S3", "sectionId": "SEC-B", "name": "Kiran", "usnNumber": "USN003" }
            ],
            "subjects": [
                { "id": "P1", "teacherId": "T1", "yearId": "Y1", "name": "DBMS" },
                { "id": "P2", "teacherId": "T1", "yearId": "Y1", "name": "OS" },
                { "id": "P3", "teacherId": "T1", "yearId": "Y2", "name": "Networks" }
            ]
        }),
    );
}

#[test]
fn subject_view_shows_every_roster_member() {
    let workspace = temp_dir("rollbook-views-zero-fill");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_two_year_roster(&mut stdin, &mut reader);

    // Only S1 has any attendance; S2 must still appear, zero-valued.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.submitBatch",
        json!({
            "teacherId": "T1",
            "subjectId": "P1",
            "date": "2024-01-10",
            "entries": [{ "studentId": "S1", "present": true }]
        }),
    );

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.bySubject",
        json!({ "subjectId": "P1" }),
    );
    let rows = view["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2, "Y1 has exactly S1 and S2");
    let s2 = rows
        .iter()
        .find(|r| r["studentId"].as_str() == Some("S2"))
        .expect("S2 listed");
    assert_eq!(s2["totalClasses"].as_i64(), Some(0));
    assert_eq!(s2["attendedClasses"].as_i64(), Some(0));
    assert_eq!(s2["percent"].as_f64(), Some(0.0));

    // Student view covers every subject of the student's year.
    let record = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.byStudent",
        json!({ "studentId": "S1" }),
    );
    let records = record["records"].as_array().expect("records");
    assert_eq!(records.len(), 2, "Y1 carries P1 and P2");
    let p2 = records
        .iter()
        .find(|r| r["subjectId"].as_str() == Some("P2"))
        .expect("P2 present");
    assert_eq!(p2["totalClasses"].as_i64(), Some(0));
    assert_eq!(p2["log"].as_array().map(|a| a.len()), Some(0));
}

#[test]
fn roster_queries_resolve_the_hierarchy() {
    let workspace = temp_dir("rollbook-views-roster");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_two_year_roster(&mut stdin, &mut reader);

    let all = request_ok(&mut stdin, &mut reader, "2", "students.list", json!({}));
    let students = all["students"].as_array().expect("students");
    assert_eq!(students.len(), 3);
    let s1 = &students[0];
    assert_eq!(s1["usnNumber"].as_str(), Some("USN001"));
    assert_eq!(s1["sectionName"].as_str(), Some("A"));
    assert_eq!(s1["yearLabel"].as_str(), Some("2nd Year"));
    assert_eq!(s1["courseName"].as_str(), Some("BCA"));

    let scoped = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.bySubject",
        json!({ "subjectId": "P3" }),
    );
    let scoped = scoped["students"].as_array().expect("students");
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0]["id"].as_str(), Some("S3"));

    let taught = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.byTeacher",
        json!({ "teacherId": "T1" }),
    );
    assert_eq!(taught["students"].as_array().map(|a| a.len()), Some(3));

    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teacher.subjectsByYear",
        json!({ "teacherId": "T1" }),
    );
    let years = overview["years"].as_array().expect("years");
    assert_eq!(years.len(), 2);
    let y1 = years
        .iter()
        .find(|y| y["yearId"].as_str() == Some("Y1"))
        .expect("Y1 group");
    assert_eq!(y1["subjects"].as_array().map(|a| a.len()), Some(2));

    let scope = request_ok(
        &mut stdin,
        &mut reader,
        "5b",
        "teacher.scope",
        json!({ "teacherId": "T1" }),
    );
    assert_eq!(scope["subjectIds"].as_array().map(|a| a.len()), Some(3));
    assert_eq!(scope["yearIds"].as_array().map(|a| a.len()), Some(2));

    let courses = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "teacher.courses",
        json!({ "teacherId": "T1" }),
    );
    let courses = courses["courses"].as_array().expect("courses");
    assert_eq!(courses.len(), 1);
    assert_eq!(courses[0]["name"].as_str(), Some("BCA"));

    let section = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sections.get",
        json!({ "sectionId": "SEC-B" }),
    );
    assert_eq!(section["sectionName"].as_str(), Some("B"));
    assert_eq!(section["yearId"].as_str(), Some("Y2"));

    // Missing rows are reported, not defaulted.
    let missing = request(
        &mut stdin,
        &mut reader,
        "8",
        "years.get",
        json!({ "yearId": "Y9" }),
    );
    assert_eq!(missing.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(missing["error"]["code"].as_str(), Some("not_found"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.byStudent",
        json!({ "studentId": "S9" }),
    );
    assert_eq!(missing["error"]["code"].as_str(), Some("not_found"));
}
