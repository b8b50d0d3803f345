//! Roster and catalogue maintenance: teachers, subjects, sections, students
//! and topics.

use crate::db::now_rfc3339;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, ensure_exists, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const TEACHERS_PER_PAGE: usize = 8;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectRef {
    id: String,
    title: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TeacherRow {
    id: String,
    firstname: String,
    lastname: String,
    email: String,
    phone: Option<String>,
    complete_address: Option<String>,
    user_type: String,
    image_path: Option<String>,
    subjects: Vec<SubjectRef>,
}

impl TeacherRow {
    fn matches(&self, query: &str) -> bool {
        let full_name = format!("{} {}", self.firstname, self.lastname).to_lowercase();
        full_name.contains(query) || self.email.to_lowercase().contains(query)
    }
}

fn load_teachers(conn: &Connection, teachers_only: bool) -> Result<Vec<TeacherRow>, HandlerErr> {
    let sql = if teachers_only {
        "SELECT id, firstname, lastname, email, phone, complete_address, user_type, image_path
         FROM teachers WHERE user_type = 'teacher' ORDER BY lastname, firstname"
    } else {
        "SELECT id, firstname, lastname, email, phone, complete_address, user_type, image_path
         FROM teachers ORDER BY lastname, firstname"
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    let mut teachers = stmt
        .query_map([], |r| {
            Ok(TeacherRow {
                id: r.get(0)?,
                firstname: r.get(1)?,
                lastname: r.get(2)?,
                email: r.get(3)?,
                phone: r.get(4)?,
                complete_address: r.get(5)?,
                user_type: r.get(6)?,
                image_path: r.get(7)?,
                subjects: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut assigned: HashMap<String, Vec<SubjectRef>> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT a.teacher_id, s.id, s.title
             FROM assigned_subjects a
             JOIN subjects s ON s.id = a.subject_id
             ORDER BY s.title",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                SubjectRef {
                    id: r.get(1)?,
                    title: r.get(2)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    for (teacher_id, subject) in rows {
        assigned.entry(teacher_id).or_default().push(subject);
    }

    for t in &mut teachers {
        t.subjects = assigned.remove(&t.id).unwrap_or_default();
    }
    Ok(teachers)
}

fn teachers_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let teachers = load_teachers(conn, true)?;
    Ok(json!({ "count": teachers.len(), "teachers": teachers }))
}

fn teachers_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let firstname = required_str(req, "firstname")?;
    let lastname = required_str(req, "lastname")?;
    let email = required_str(req, "email")?;
    let user_type = optional_str(req, "userType").unwrap_or_else(|| "teacher".to_string());
    if user_type != "teacher" && user_type != "admin" {
        return Err(HandlerErr::bad_params("userType must be teacher or admin")
            .with_details(json!({ "userType": user_type })));
    }

    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, firstname, lastname, email, phone, complete_address, user_type, image_path, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &teacher_id,
            &firstname,
            &lastname,
            &email,
            optional_str(req, "phone"),
            optional_str(req, "completeAddress"),
            &user_type,
            optional_str(req, "imagePath"),
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "teachers" })))?;

    Ok(json!({ "teacherId": teacher_id }))
}

fn teachers_assign_subject(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let teacher_id = required_str(req, "teacherId")?;
    let subject_id = required_str(req, "subjectId")?;
    ensure_exists(conn, "teachers", &teacher_id, "teacher")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;

    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO assigned_subjects(teacher_id, subject_id) VALUES(?, ?)",
            (&teacher_id, &subject_id),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(json!({ "assigned": inserted > 0 }))
}

fn teachers_search(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let query = optional_str(req, "query").unwrap_or_default().to_lowercase();
    let page = req.params.get("page").and_then(|v| v.as_u64()).unwrap_or(1).max(1);
    let page = usize::try_from(page).unwrap_or(usize::MAX);

    let filtered: Vec<TeacherRow> = load_teachers(conn, false)?
        .into_iter()
        .filter(|t| query.is_empty() || t.matches(&query))
        .collect();
    let total = filtered.len();
    let total_pages = total.div_ceil(TEACHERS_PER_PAGE);
    let start = page.saturating_sub(1).saturating_mul(TEACHERS_PER_PAGE);
    let teachers: Vec<serde_json::Value> = filtered
        .into_iter()
        .skip(start)
        .take(TEACHERS_PER_PAGE)
        .map(|t| {
            let titles: Vec<&str> = t.subjects.iter().map(|s| s.title.as_str()).collect();
            json!({
                "id": t.id,
                "firstname": t.firstname,
                "lastname": t.lastname,
                "email": t.email,
                "imagePath": t.image_path,
                "subjects": titles,
            })
        })
        .collect();

    Ok(json!({
        "teachers": teachers,
        "total": total,
        "page": page,
        "totalPages": total_pages,
        "itemsPerPage": TEACHERS_PER_PAGE,
    }))
}

fn subjects_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare("SELECT id, title, created_at FROM subjects ORDER BY title")
        .map_err(HandlerErr::query)?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "count": subjects.len(), "subjects": subjects }))
}

fn subjects_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let title = required_str(req, "title")?;
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, title, created_at) VALUES(?, ?, ?)",
        (&subject_id, &title, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "subjects" })))?;
    Ok(json!({ "subjectId": subject_id, "title": title }))
}

fn subjects_find_by_title(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let title = required_str(req, "title")?;
    let id: Option<String> = conn
        .query_row("SELECT id FROM subjects WHERE title = ?", [&title], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    Ok(json!({ "subjectId": id }))
}

fn sections_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let include_students = req
        .params
        .get("includeStudents")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut links: HashMap<String, Vec<SubjectRef>> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT ss.section_id, s.id, s.title
             FROM section_subjects ss
             JOIN subjects s ON s.id = ss.subject_id
             ORDER BY s.title",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                SubjectRef {
                    id: r.get(1)?,
                    title: r.get(2)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    for (section_id, subject) in rows {
        links.entry(section_id).or_default().push(subject);
    }

    let mut members: HashMap<String, Vec<String>> = HashMap::new();
    if include_students {
        let mut stmt = conn
            .prepare("SELECT section_id, id FROM students ORDER BY lastname, firstname")
            .map_err(HandlerErr::query)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        for (section_id, student_id) in rows {
            members.entry(section_id).or_default().push(student_id);
        }
    }

    let mut stmt = conn
        .prepare("SELECT id, code, description, teacher_id, created_at FROM sections ORDER BY code")
        .map_err(HandlerErr::query)?;
    let sections = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|(id, code, description, teacher_id, created_at)| {
            let subjects = links.remove(&id).unwrap_or_default();
            let subject_ids: Vec<&str> = subjects.iter().map(|s| s.id.as_str()).collect();
            let subject_titles: Vec<&str> = subjects.iter().map(|s| s.title.as_str()).collect();
            let mut v = json!({
                "id": id,
                "code": code,
                "description": description,
                "teacherId": teacher_id,
                "createdAt": created_at,
                "subjectIds": subject_ids,
                "subjectTitles": subject_titles,
            });
            if include_students {
                v["studentIds"] = json!(members.remove(&id).unwrap_or_default());
            }
            v
        })
        .collect::<Vec<_>>();

    Ok(json!({ "count": sections.len(), "sections": sections }))
}

fn sections_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let code = required_str(req, "code")?;
    let description = optional_str(req, "description").unwrap_or_default();
    let teacher_id = optional_str(req, "teacherId");
    if let Some(t) = teacher_id.as_deref() {
        ensure_exists(conn, "teachers", t, "teacher")?;
    }

    let section_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sections(id, code, description, teacher_id, created_at) VALUES(?, ?, ?, ?, ?)",
        (&section_id, &code, &description, &teacher_id, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "sections" })))?;
    Ok(json!({ "sectionId": section_id, "code": code }))
}

fn sections_find_by_code(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let code = required_str(req, "code")?;
    let id: Option<String> = conn
        .query_row("SELECT id FROM sections WHERE code = ?", [&code], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    Ok(json!({ "sectionId": id }))
}

fn students_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = optional_str(req, "sectionId");
    let mut stmt = conn
        .prepare(
            "SELECT id, section_id, firstname, lastname, standing, phone, address, remarks, created_at
             FROM students
             WHERE (?1 IS NULL OR section_id = ?1)
             ORDER BY lastname, firstname",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&section_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "sectionId": r.get::<_, String>(1)?,
                "firstname": r.get::<_, String>(2)?,
                "lastname": r.get::<_, String>(3)?,
                "standing": r.get::<_, Option<String>>(4)?,
                "phone": r.get::<_, Option<String>>(5)?,
                "address": r.get::<_, Option<String>>(6)?,
                "remarks": r.get::<_, Option<String>>(7)?,
                "createdAt": r.get::<_, String>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "count": students.len(), "students": students }))
}

fn students_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    let firstname = required_str(req, "firstname")?;
    let lastname = required_str(req, "lastname")?;
    ensure_exists(conn, "sections", &section_id, "section")?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, section_id, firstname, lastname, standing, phone, address, remarks, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &section_id,
            &firstname,
            &lastname,
            optional_str(req, "standing"),
            optional_str(req, "phone"),
            optional_str(req, "address"),
            optional_str(req, "remarks"),
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" })))?;
    Ok(json!({ "studentId": student_id }))
}

/// Topic titles for a subject, in entry order. With no class record the
/// subject's general topics are returned.
pub fn topic_titles(
    conn: &Connection,
    subject_id: &str,
    class_record_id: Option<&str>,
) -> Result<Vec<(String, String)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title FROM topics
             WHERE subject_id = ? AND class_record_id IS ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map((subject_id, class_record_id), |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)
}

fn topics_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;
    let class_record_id = optional_str(req, "classRecordId");
    let topics: Vec<serde_json::Value> = topic_titles(conn, &subject_id, class_record_id.as_deref())?
        .into_iter()
        .map(|(id, title)| json!({ "id": id, "title": title }))
        .collect();
    Ok(json!({ "topics": topics }))
}

fn topics_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;
    let title = required_str(req, "title")?;
    let class_record_id = optional_str(req, "classRecordId");
    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    if let Some(cr) = class_record_id.as_deref() {
        ensure_exists(conn, "class_records", cr, "class record")?;
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM topics WHERE subject_id = ? AND class_record_id IS ?",
            (&subject_id, &class_record_id),
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    let topic_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO topics(id, subject_id, class_record_id, title, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&topic_id, &subject_id, &class_record_id, &title, sort_order),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "topics" })))?;
    Ok(json!({ "topicId": topic_id, "sortOrder": sort_order }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "teachers.list" => teachers_list(state),
        "teachers.create" => teachers_create(state, req),
        "teachers.assignSubject" => teachers_assign_subject(state, req),
        "teachers.search" => teachers_search(state, req),
        "subjects.list" => subjects_list(state),
        "subjects.create" => subjects_create(state, req),
        "subjects.findByTitle" => subjects_find_by_title(state, req),
        "sections.list" => sections_list(state, req),
        "sections.create" => sections_create(state, req),
        "sections.findByCode" => sections_find_by_code(state, req),
        "students.list" => students_list(state, req),
        "students.create" => students_create(state, req),
        "topics.list" => topics_list(state, req),
        "topics.create" => topics_create(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
