use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
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

fn spawn_sidecar(cwd: &Path) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .current_dir(cwd)
        .env_remove("GROQ_API_KEY")
        .env_remove("GRADEBOOK_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
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

fn assert_close(actual: &serde_json::Value, expected: f64) {
    let v = actual.as_f64().unwrap_or_else(|| panic!("not a number: {}", actual));
    assert!((v - expected).abs() < 1e-9, "expected {}, got {}", expected, v);
}

/// One student in one class record, seeded with zero task and assessment
/// maxima so every grade starts at 0.
fn seed_single_record(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) -> (String, String, String) {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "t",
        "teachers.create",
        json!({ "firstname": "Jo", "lastname": "Lim", "email": "jo.lim@school.test" }),
    );
    let subject = request_ok(stdin, reader, "sub", "subjects.create", json!({ "title": "Science 8" }));
    let section = request_ok(stdin, reader, "sec", "sections.create", json!({ "code": "8-Mabini" }));
    let section_id = section["sectionId"].as_str().expect("sectionId").to_string();
    let student = request_ok(
        stdin,
        reader,
        "st",
        "students.create",
        json!({ "sectionId": section_id, "firstname": "Rico", "lastname": "Tan" }),
    );
    let created = request_ok(
        stdin,
        reader,
        "cr",
        "classRecords.create",
        json!({
            "quarter": "2nd",
            "subjectId": subject["subjectId"],
            "sectionId": section_id,
            "teacherId": teacher["teacherId"],
        }),
    );
    let class_record_id = created["classRecordId"].as_str().expect("classRecordId").to_string();
    let seeded = request_ok(
        stdin,
        reader,
        "seed",
        "records.seedForSection",
        json!({ "classRecordId": class_record_id, "ptMax": 0, "qaMax": 0 }),
    );
    assert_eq!(seeded["created"], json!(1));
    assert_eq!(seeded["topicCount"], json!(0));
    let record_id = seeded["records"][0]["recordId"].as_str().expect("recordId").to_string();
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    (class_record_id, record_id, student_id)
}

fn set_cell(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    record_id: &str,
    field: &str,
    value: serde_json::Value,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &format!("set-{}", field),
        "records.update",
        json!({ "recordId": record_id, "field": field, "value": value }),
    )
}

#[test]
fn cell_edits_recompute_and_store_grades() {
    let workspace = temp_dir("gradebook-records-recompute");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let (class_record_id, record_id, student_id) = seed_single_record(&mut stdin, &mut reader, &workspace);

    let initial = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "records.initialGrade",
        json!({ "studentId": student_id, "classRecordId": class_record_id }),
    );
    assert_close(&initial["initialGrade"], 0.0);

    set_cell(&mut stdin, &mut reader, &record_id, "topic1", json!(20));
    set_cell(&mut stdin, &mut reader, &record_id, "wwMax1", json!(20));
    for n in 2..=10 {
        set_cell(&mut stdin, &mut reader, &record_id, &format!("pt{}", n), json!(null));
    }
    set_cell(&mut stdin, &mut reader, &record_id, "pt1", json!(5));
    set_cell(&mut stdin, &mut reader, &record_id, "ptMax1", json!(8));
    set_cell(&mut stdin, &mut reader, &record_id, "qaMax1", json!(40));
    let updated = set_cell(&mut stdin, &mut reader, &record_id, "qa1", json!(18));

    let grades = &updated["grades"];
    assert_close(&grades["wwPercent"], 100.0);
    assert_close(&grades["ptPercent"], 62.5);
    assert_close(&grades["qaPercent"], 45.0);
    assert_close(&grades["initialGrade"], 74.0);
    assert_eq!(grades["quarterlyGrade"], json!(74));
    assert_eq!(updated["record"]["qa1"], json!(18.0));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "records.list",
        json!({ "classRecordId": class_record_id }),
    );
    assert_close(&listed["records"][0]["initialGrade"], 74.0);
    assert_eq!(listed["records"][0]["quarterlyGrade"], json!(74));

    let passed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "records.countPassed",
        json!({ "classRecordId": class_record_id }),
    );
    assert_eq!(passed["count"], json!(0));

    // 75 exactly is a pass.
    let bumped = set_cell(&mut stdin, &mut reader, &record_id, "qa1", json!(20));
    assert_close(&bumped["grades"]["initialGrade"], 75.0);
    let passed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "records.countPassed",
        json!({ "classRecordId": class_record_id }),
    );
    assert_eq!(passed["count"], json!(1));

    let missed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "records.missedActivities",
        json!({ "classRecordId": class_record_id }),
    );
    // topic2..5 and pt2..10 are ungraded.
    assert_eq!(missed["missedActivities"][0]["missedCount"], json!(13));

    // A cleared maximum counts as zero; written work drops to 0%.
    let cleared = set_cell(&mut stdin, &mut reader, &record_id, "wwMax1", json!(null));
    assert_eq!(cleared["record"]["wwMax1"], json!(0.0));
    assert_close(&cleared["grades"]["wwPercent"], 0.0);
    assert_close(&cleared["grades"]["initialGrade"], 35.0);

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "records.grade",
        json!({ "recordId": record_id }),
    );
    assert_close(&stored["grades"]["initialGrade"], 35.0);
    assert_eq!(stored["grades"]["quarterlyGrade"], json!(35));

    let recomputed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "records.recompute",
        json!({ "classRecordId": class_record_id }),
    );
    assert_eq!(recomputed["updated"], json!(1));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn invalid_cell_edits_are_rejected() {
    let workspace = temp_dir("gradebook-records-invalid");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let (_, record_id, _) = seed_single_record(&mut stdin, &mut reader, &workspace);

    let cases = [
        ("topic1", json!(-1)),
        ("topic6", json!(10)),
        ("pt11", json!(10)),
        ("qa2", json!(10)),
        ("topic1", json!("ten")),
    ];
    for (i, (field, value)) in cases.iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "records.update",
            json!({ "recordId": record_id, "field": field, "value": value }),
        );
        assert_eq!(resp["error"]["code"], json!("bad_params"), "{} -> {}", field, resp);
    }

    let missing = request(
        &mut stdin,
        &mut reader,
        "1",
        "records.update",
        json!({ "recordId": "nope", "field": "topic1", "value": 1 }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn inline_grading_follows_the_weighting_rules() {
    let workspace = temp_dir("gradebook-records-inline");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);

    let full = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "records.grade",
        json!({ "record": {
            "topic1": 10, "topic2": 10,
            "wwMax1": 10, "wwMax2": 10,
            "pt1": 45, "ptMax1": 50,
            "qa1": 18, "qaMax1": 20,
        } }),
    );
    assert_close(&full["grades"]["wwWeighted"], 40.0);
    assert_close(&full["grades"]["ptWeighted"], 36.0);
    assert_close(&full["grades"]["qaWeighted"], 18.0);
    assert_close(&full["grades"]["initialGrade"], 94.0);
    assert_eq!(full["grades"]["quarterlyGrade"], json!(94));

    let empty = request_ok(&mut stdin, &mut reader, "2", "records.grade", json!({ "record": {} }));
    assert_close(&empty["grades"]["initialGrade"], 0.0);
    assert_eq!(empty["grades"]["quarterlyGrade"], json!(0));

    // Scores above the maxima are not clamped.
    let over = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "records.grade",
        json!({ "record": { "topic1": 30, "wwMax1": 20 } }),
    );
    assert_close(&over["grades"]["wwPercent"], 150.0);

    let invalid = request(
        &mut stdin,
        &mut reader,
        "4",
        "records.grade",
        json!({ "record": { "topic1": "abc" } }),
    );
    assert_eq!(invalid["error"]["code"], json!("invalid_input"));
    assert_eq!(invalid["error"]["details"]["field"], json!("topic1"));

    let not_object = request(&mut stdin, &mut reader, "5", "records.grade", json!({ "record": [1, 2] }));
    assert_eq!(not_object["error"]["code"], json!("invalid_input"));

    drop(stdin);
    let _ = child.wait();
}
