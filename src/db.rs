use crate::calc::{GradeBreakdown, ScoreField, ScoreRecord};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::debug;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    debug!(path = %db_path.display(), "opened workspace database");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            firstname TEXT NOT NULL,
            lastname TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            phone TEXT,
            complete_address TEXT,
            user_type TEXT NOT NULL DEFAULT 'teacher',
            image_path TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            teacher_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            firstname TEXT NOT NULL,
            lastname TEXT NOT NULL,
            standing TEXT,
            phone TEXT,
            address TEXT,
            remarks TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_section ON students(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assigned_subjects(
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, subject_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS section_subjects(
            section_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(section_id, subject_id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_records(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            quarter TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_records_teacher ON class_records(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_records_section_subject
         ON class_records(section_id, subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS topics(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            class_record_id TEXT,
            title TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_record_id) REFERENCES class_records(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_topics_subject ON topics(subject_id)",
        [],
    )?;

    conn.execute(&records_table_sql(), [])?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_class_record ON records(class_record_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_student ON records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn records_table_sql() -> String {
    let mut score_cols = Vec::new();
    for field in ScoreField::all() {
        if field.is_maximum() {
            score_cols.push(format!("{} REAL NOT NULL DEFAULT 0", field.column()));
        } else {
            score_cols.push(format!("{} REAL", field.column()));
        }
    }
    format!(
        "CREATE TABLE IF NOT EXISTS records(
            id TEXT PRIMARY KEY,
            class_record_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            {},
            initial_grade REAL NOT NULL DEFAULT 0,
            quarterly_grade INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(class_record_id, student_id),
            FOREIGN KEY(class_record_id) REFERENCES class_records(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        score_cols.join(",\n            ")
    )
}

/// Comma-separated score columns in `ScoreField::all()` order, optionally
/// qualified with a table alias.
pub fn score_columns(alias: Option<&str>) -> String {
    ScoreField::all()
        .into_iter()
        .map(|f| match alias {
            Some(a) => format!("{}.{}", a, f.column()),
            None => f.column(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reads a `ScoreRecord` from `row`, starting at column `offset`, in the
/// order produced by [`score_columns`].
pub fn score_record_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<ScoreRecord> {
    let mut record = ScoreRecord::default();
    for (i, field) in ScoreField::all().into_iter().enumerate() {
        let value: Option<f64> = row.get(offset + i)?;
        record.set(field, value);
    }
    Ok(record)
}

pub fn load_score_record(conn: &Connection, record_id: &str) -> anyhow::Result<Option<ScoreRecord>> {
    let sql = format!("SELECT {} FROM records WHERE id = ?", score_columns(None));
    let record = conn
        .query_row(&sql, [record_id], |r| score_record_from_row(r, 0))
        .optional()?;
    Ok(record)
}

pub fn store_computed_grades(
    conn: &Connection,
    record_id: &str,
    grades: &GradeBreakdown,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE records SET initial_grade = ?, quarterly_grade = ?, updated_at = ? WHERE id = ?",
        (
            grades.initial_grade,
            grades.quarterly_grade,
            now_rfc3339(),
            record_id,
        ),
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
