use crate::db::now_rfc3339;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, ensure_exists, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn class_records_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let teacher_id = optional_str(req, "teacherId");

    // Roster size via correlated subquery.
    let mut stmt = conn
        .prepare(
            "SELECT
               cr.id,
               cr.quarter,
               cr.created_at,
               cr.teacher_id,
               t.email,
               cr.subject_id,
               s.title,
               cr.section_id,
               sec.code,
               (SELECT COUNT(*) FROM records r WHERE r.class_record_id = cr.id) AS student_count
             FROM class_records cr
             JOIN teachers t ON t.id = cr.teacher_id
             JOIN subjects s ON s.id = cr.subject_id
             JOIN sections sec ON sec.id = cr.section_id
             WHERE (?1 IS NULL OR cr.teacher_id = ?1)
             ORDER BY cr.created_at DESC, cr.id",
        )
        .map_err(HandlerErr::query)?;
    let class_records = stmt
        .query_map([&teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "quarter": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, String>(2)?,
                "teacherId": r.get::<_, String>(3)?,
                "handledBy": r.get::<_, String>(4)?,
                "subjectId": r.get::<_, String>(5)?,
                "subjectName": r.get::<_, String>(6)?,
                "sectionId": r.get::<_, String>(7)?,
                "section": r.get::<_, String>(8)?,
                "studentCount": r.get::<_, i64>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "count": class_records.len(), "classRecords": class_records }))
}

fn class_records_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let quarter = required_str(req, "quarter")?;
    let subject_id = required_str(req, "subjectId")?;
    let section_id = required_str(req, "sectionId")?;
    let teacher_id = required_str(req, "teacherId")?;
    ensure_exists(conn, "teachers", &teacher_id, "teacher")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    ensure_exists(conn, "sections", &section_id, "section")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let class_record_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO class_records(id, teacher_id, subject_id, section_id, quarter, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &class_record_id,
            &teacher_id,
            &subject_id,
            &section_id,
            &quarter,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "class_records" })))?;
    // A section may already be linked to the subject through another quarter.
    tx.execute(
        "INSERT OR IGNORE INTO section_subjects(section_id, subject_id) VALUES(?, ?)",
        (&section_id, &subject_id),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "section_subjects" })))?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    info!(class_record = %class_record_id, quarter = %quarter, "class record created");
    Ok(json!({ "classRecordId": class_record_id }))
}

fn class_records_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_record_id = required_str(req, "classRecordId")?;
    ensure_exists(conn, "class_records", &class_record_id, "class record")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    // Dependency order; there is no ON DELETE CASCADE.
    let records_deleted = tx
        .execute("DELETE FROM records WHERE class_record_id = ?", [&class_record_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "records" })))?;
    tx.execute("DELETE FROM topics WHERE class_record_id = ?", [&class_record_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "topics" })))?;
    tx.execute("DELETE FROM class_records WHERE id = ?", [&class_record_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "class_records" }))
        })?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    info!(class_record = %class_record_id, records_deleted, "class record deleted");
    Ok(json!({ "ok": true, "recordsDeleted": records_deleted }))
}

fn class_records_students(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_record_id = required_str(req, "classRecordId")?;
    ensure_exists(conn, "class_records", &class_record_id, "class record")?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.firstname, s.lastname, s.section_id, s.standing
             FROM records r
             JOIN students s ON s.id = r.student_id
             WHERE r.class_record_id = ?
             ORDER BY s.lastname, s.firstname",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&class_record_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "firstname": r.get::<_, String>(1)?,
                "lastname": r.get::<_, String>(2)?,
                "sectionId": r.get::<_, String>(3)?,
                "standing": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classRecords.list" => class_records_list(state, req),
        "classRecords.create" => class_records_create(state, req),
        "classRecords.delete" => class_records_delete(state, req),
        "classRecords.students" => class_records_students(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
