use crate::bands::{BandTally, PassFailTally, PASSING_GRADE};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, ensure_exists, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::narrative::SubjectSummary;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// Stored initial grades of every record whose class record matches the
/// given section and/or subject.
fn initial_grades(
    conn: &Connection,
    section_id: Option<&str>,
    subject_id: Option<&str>,
) -> Result<Vec<f64>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT r.initial_grade
             FROM records r
             JOIN class_records cr ON cr.id = r.class_record_id
             WHERE (?1 IS NULL OR cr.section_id = ?1)
               AND (?2 IS NULL OR cr.subject_id = ?2)",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map((section_id, subject_id), |r| r.get::<_, f64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)
}

pub fn subject_summary(
    conn: &Connection,
    subject_id: &str,
    section_id: Option<&str>,
) -> Result<SubjectSummary, HandlerErr> {
    let grades = initial_grades(conn, section_id, Some(subject_id))?;
    let tally: PassFailTally = grades.iter().copied().collect();
    let average_grade = if grades.is_empty() {
        0.0
    } else {
        grades.iter().sum::<f64>() / grades.len() as f64
    };
    Ok(SubjectSummary {
        passing_count: tally.passing,
        failing_count: tally.failing,
        average_grade,
    })
}

pub fn section_distribution(
    conn: &Connection,
    section_id: &str,
    subject_id: Option<&str>,
) -> Result<BandTally, HandlerErr> {
    Ok(initial_grades(conn, Some(section_id), subject_id)?
        .into_iter()
        .collect())
}

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [], |r| r.get(0)).map_err(HandlerErr::query)
}

fn analytics_overview(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let passed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM records WHERE initial_grade >= ?",
            [PASSING_GRADE],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    Ok(json!({
        "studentCount": count(conn, "SELECT COUNT(*) FROM students")?,
        "teacherCount": count(conn, "SELECT COUNT(*) FROM teachers WHERE user_type = 'teacher'")?,
        "subjectCount": count(conn, "SELECT COUNT(*) FROM subjects")?,
        "sectionCount": count(conn, "SELECT COUNT(*) FROM sections")?,
        "classRecordCount": count(conn, "SELECT COUNT(*) FROM class_records")?,
        "recordCount": count(conn, "SELECT COUNT(*) FROM records")?,
        "passedCount": passed,
    }))
}

fn analytics_failure_rate(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_code = required_str(req, "sectionCode")?;
    let subject_id = required_str(req, "subjectId")?;
    let section_id: Option<String> = conn
        .query_row("SELECT id FROM sections WHERE code = ?", [&section_code], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(section_id) = section_id else {
        return Err(HandlerErr::not_found("section").with_details(json!({ "code": section_code })));
    };

    let tally: PassFailTally = initial_grades(conn, Some(section_id.as_str()), Some(subject_id.as_str()))?
        .into_iter()
        .collect();
    Ok(json!({
        "sectionId": section_id,
        "passing": tally.passing,
        "failing": tally.failing,
        "total": tally.total(),
    }))
}

fn analytics_section_distribution(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    let subject_id = optional_str(req, "subjectId");
    ensure_exists(conn, "sections", &section_id, "section")?;

    let tally = section_distribution(conn, &section_id, subject_id.as_deref())?;
    Ok(json!({
        "excellentCount": tally.excellent,
        "goodCount": tally.good,
        "averageCount": tally.average,
        "failingCount": tally.failing,
        "total": tally.total(),
    }))
}

fn analytics_subject_summary(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;
    let section_id = optional_str(req, "sectionId");
    ensure_exists(conn, "subjects", &subject_id, "subject")?;

    let summary = subject_summary(conn, &subject_id, section_id.as_deref())?;
    Ok(json!(summary))
}

fn analytics_low_scores(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_record_id = optional_str(req, "classRecordId");
    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.student_id, st.firstname, st.lastname, s.title, sec.code, cr.quarter, r.initial_grade
             FROM records r
             JOIN students st ON st.id = r.student_id
             JOIN class_records cr ON cr.id = r.class_record_id
             JOIN subjects s ON s.id = cr.subject_id
             JOIN sections sec ON sec.id = cr.section_id
             WHERE r.initial_grade < ?1 AND (?2 IS NULL OR r.class_record_id = ?2)
             ORDER BY r.initial_grade, st.lastname",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map((PASSING_GRADE, &class_record_id), |r| {
            Ok(json!({
                "recordId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "firstname": r.get::<_, String>(2)?,
                "lastname": r.get::<_, String>(3)?,
                "subject": r.get::<_, String>(4)?,
                "section": r.get::<_, String>(5)?,
                "quarter": r.get::<_, String>(6)?,
                "initialGrade": r.get::<_, f64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "count": students.len(), "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "analytics.overview" => analytics_overview(state),
        "analytics.failureRate" => analytics_failure_rate(state, req),
        "analytics.sectionDistribution" => analytics_section_distribution(state, req),
        "analytics.subjectSummary" => analytics_subject_summary(state, req),
        "analytics.lowScores" => analytics_low_scores(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
