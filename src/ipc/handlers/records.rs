//! Score records: roster seeding, cell edits and grade computation.

use crate::bands::PASSING_GRADE;
use crate::calc::{self, ScoreField, ScoreRecord, PT_SLOTS, TOPIC_SLOTS};
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::setup::topic_titles;
use crate::ipc::helpers::{db_conn, ensure_exists, optional_f64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rand::Rng;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

/// Inclusive ranges used when seeding performance-task scores, per task.
const PT_SEED_RANGES: [(i32, i32); PT_SLOTS] = [
    (50, 100),
    (50, 100),
    (70, 100),
    (50, 100),
    (70, 100),
    (20, 100),
    (70, 100),
    (70, 100),
    (50, 100),
    (50, 100),
];
const QA_SEED_RANGE: (i32, i32) = (50, 100);
const TOPIC_SEED_RANGE: (i32, i32) = (50, 100);
const DEFAULT_SLOT_MAX: f64 = 100.0;

fn record_row_json(
    record_id: String,
    class_record_id: String,
    student_id: String,
    student_name: Option<(String, String)>,
    record: &ScoreRecord,
    initial_grade: f64,
    quarterly_grade: i64,
) -> serde_json::Value {
    let mut v = record.to_json();
    v["id"] = json!(record_id);
    v["classRecordId"] = json!(class_record_id);
    v["studentId"] = json!(student_id);
    if let Some((firstname, lastname)) = student_name {
        v["students"] = json!({ "firstname": firstname, "lastname": lastname });
    }
    v["initialGrade"] = json!(initial_grade);
    v["quarterlyGrade"] = json!(quarterly_grade);
    v
}

fn records_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_record_id = optional_str(req, "classRecordId");
    let section_id = optional_str(req, "sectionId");
    let (filter, key) = match (class_record_id, section_id) {
        (Some(cr), _) => ("r.class_record_id = ?", cr),
        (None, Some(sec)) => ("st.section_id = ?", sec),
        (None, None) => return Err(HandlerErr::bad_params("missing classRecordId or sectionId")),
    };

    let sql = format!(
        "SELECT r.id, r.class_record_id, r.student_id, st.firstname, st.lastname,
                r.initial_grade, r.quarterly_grade, {}
         FROM records r
         JOIN students st ON st.id = r.student_id
         WHERE {}
         ORDER BY st.lastname, st.firstname",
        db::score_columns(Some("r")),
        filter
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let records = stmt
        .query_map([&key], |r| {
            let record = db::score_record_from_row(r, 7)?;
            Ok(record_row_json(
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                Some((r.get(3)?, r.get(4)?)),
                &record,
                r.get(5)?,
                r.get(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "count": records.len(), "records": records }))
}

fn non_negative(req: &Request, key: &str, default: f64) -> Result<f64, HandlerErr> {
    let v = optional_f64(req, key)?.unwrap_or(default);
    if v < 0.0 {
        return Err(HandlerErr::bad_params(format!("{} must be >= 0", key)).with_details(json!({ "field": key, "value": v })));
    }
    Ok(v)
}

fn seeded_record(rng: &mut impl Rng, topic_count: usize, ww_max: f64, pt_max: f64, qa_max: f64) -> ScoreRecord {
    let mut record = ScoreRecord::default();
    for i in 0..topic_count.min(TOPIC_SLOTS) {
        record.topics[i] = Some(rng.random_range(TOPIC_SEED_RANGE.0..=TOPIC_SEED_RANGE.1) as f64);
        record.ww_max[i] = ww_max;
    }
    for (i, (lo, hi)) in PT_SEED_RANGES.iter().enumerate() {
        record.pt[i] = Some(rng.random_range(*lo..=*hi) as f64);
        record.pt_max[i] = pt_max;
    }
    record.qa = Some(rng.random_range(QA_SEED_RANGE.0..=QA_SEED_RANGE.1) as f64);
    record.qa_max = qa_max;
    record
}

fn insert_record(
    conn: &Connection,
    class_record_id: &str,
    student_id: &str,
    record: &ScoreRecord,
) -> Result<String, HandlerErr> {
    let fields = ScoreField::all();
    let grades = calc::grade_breakdown(record);
    let record_id = Uuid::new_v4().to_string();

    let placeholders = vec!["?"; fields.len() + 6].join(", ");
    let sql = format!(
        "INSERT INTO records(id, class_record_id, student_id, {}, initial_grade, quarterly_grade, updated_at)
         VALUES({})",
        db::score_columns(None),
        placeholders
    );
    let mut values: Vec<Value> = vec![
        Value::Text(record_id.clone()),
        Value::Text(class_record_id.to_string()),
        Value::Text(student_id.to_string()),
    ];
    for f in fields {
        values.push(match record.get(f) {
            Some(n) => Value::Real(n),
            None => Value::Null,
        });
    }
    values.push(Value::Real(grades.initial_grade));
    values.push(Value::Integer(grades.quarterly_grade));
    values.push(Value::Text(db::now_rfc3339()));

    conn.execute(&sql, params_from_iter(values))
        .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "records" })))?;
    Ok(record_id)
}

fn records_seed_for_section(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_record_id = required_str(req, "classRecordId")?;
    let ww_max = non_negative(req, "wwMax", DEFAULT_SLOT_MAX)?;
    let pt_max = non_negative(req, "ptMax", DEFAULT_SLOT_MAX)?;
    let qa_max = non_negative(req, "qaMax", DEFAULT_SLOT_MAX)?;

    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT section_id, subject_id FROM class_records WHERE id = ?",
            [&class_record_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((section_id, subject_id)) = row else {
        return Err(HandlerErr::not_found("class record"));
    };

    // Class-specific topics take precedence over the subject's general list.
    let mut topics = topic_titles(conn, &subject_id, Some(class_record_id.as_str()))?;
    if topics.is_empty() {
        topics = topic_titles(conn, &subject_id, None)?;
    }
    let topic_count = topics.len().min(TOPIC_SLOTS);
    debug!(subject = %subject_id, topic_count, "seeding records");

    let mut stmt = conn
        .prepare(
            "SELECT s.id FROM students s
             WHERE s.section_id = ?
               AND NOT EXISTS (
                 SELECT 1 FROM records r WHERE r.class_record_id = ? AND r.student_id = s.id
               )
             ORDER BY s.lastname, s.firstname",
        )
        .map_err(HandlerErr::query)?;
    let student_ids = stmt
        .query_map((&section_id, &class_record_id), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut rng = rand::rng();
    let mut created = Vec::with_capacity(student_ids.len());
    for student_id in &student_ids {
        let record = seeded_record(&mut rng, topic_count, ww_max, pt_max, qa_max);
        let record_id = insert_record(&tx, &class_record_id, student_id, &record)?;
        created.push(json!({ "recordId": record_id, "studentId": student_id }));
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    info!(class_record = %class_record_id, created = created.len(), "records seeded");
    Ok(json!({ "created": created.len(), "topicCount": topic_count, "records": created }))
}

fn refresh_grades(conn: &Connection, record_id: &str) -> Result<(ScoreRecord, calc::GradeBreakdown), HandlerErr> {
    let record = db::load_score_record(conn, record_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("record"))?;
    let grades = calc::grade_breakdown(&record);
    db::store_computed_grades(conn, record_id, &grades)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok((record, grades))
}

fn records_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let record_id = required_str(req, "recordId")?;
    let field_name = required_str(req, "field")?;
    let Some(field) = ScoreField::parse(&field_name) else {
        return Err(HandlerErr::bad_params("unknown score field").with_details(json!({ "field": field_name })));
    };
    let value = optional_f64(req, "value")?;
    if let Some(v) = value {
        if v < 0.0 {
            return Err(HandlerErr::bad_params("negative scores are not allowed")
                .with_details(json!({ "field": field_name, "value": v })));
        }
    }
    // Maxima have no ungraded state.
    let value = if field.is_maximum() {
        Some(value.unwrap_or(0.0))
    } else {
        value
    };
    ensure_exists(conn, "records", &record_id, "record")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let sql = format!("UPDATE records SET {} = ? WHERE id = ?", field.column());
    tx.execute(&sql, (value, &record_id))
        .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "records" })))?;
    let (record, grades) = refresh_grades(&tx, &record_id)?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    debug!(record = %record_id, field = %field_name, initial = grades.initial_grade, "score updated");
    Ok(json!({ "record": record.to_json(), "grades": grades }))
}

fn records_grade(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    if let Some(raw) = req.params.get("record") {
        let record = ScoreRecord::from_json(raw)
            .map_err(|e| HandlerErr::new(e.code(), e.to_string()).with_details(e.details()))?;
        return Ok(json!({ "grades": calc::grade_breakdown(&record) }));
    }

    let conn = db_conn(state)?;
    let record_id = required_str(req, "recordId")?;
    let record = db::load_score_record(conn, &record_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("record"))?;
    Ok(json!({
        "record": record.to_json(),
        "grades": calc::grade_breakdown(&record),
    }))
}

fn records_recompute(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_record_id = required_str(req, "classRecordId")?;
    ensure_exists(conn, "class_records", &class_record_id, "class record")?;

    let mut stmt = conn
        .prepare("SELECT id FROM records WHERE class_record_id = ?")
        .map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map([&class_record_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for id in &ids {
        refresh_grades(&tx, id)?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "updated": ids.len() }))
}

fn records_initial_grade(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let class_record_id = required_str(req, "classRecordId")?;
    let grade: Option<f64> = conn
        .query_row(
            "SELECT initial_grade FROM records WHERE student_id = ? AND class_record_id = ?",
            (&student_id, &class_record_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    Ok(json!({ "initialGrade": grade.unwrap_or(0.0) }))
}

fn records_missed_activities(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_record_id = optional_str(req, "classRecordId");
    let sql = format!(
        "SELECT id, student_id, {} FROM records
         WHERE (?1 IS NULL OR class_record_id = ?1)
         ORDER BY student_id",
        db::score_columns(None)
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([&class_record_id], |r| {
            let record = db::score_record_from_row(r, 2)?;
            Ok(json!({
                "recordId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "missedCount": record.missed_count(),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "missedActivities": rows }))
}

fn records_count_passed(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_record_id = optional_str(req, "classRecordId");
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM records
             WHERE initial_grade >= ?1 AND (?2 IS NULL OR class_record_id = ?2)",
            (PASSING_GRADE, &class_record_id),
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    Ok(json!({ "count": count }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "records.list" => records_list(state, req),
        "records.seedForSection" => records_seed_for_section(state, req),
        "records.update" => records_update(state, req),
        "records.grade" => records_grade(state, req),
        "records.recompute" => records_recompute(state, req),
        "records.initialGrade" => records_initial_grade(state, req),
        "records.missedActivities" => records_missed_activities(state, req),
        "records.countPassed" => records_count_passed(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
