use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "school.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Current UTC time in the single timestamp format stored everywhere, so that
/// text ordering equals time ordering.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL,
            name TEXT NOT NULL,
            phone TEXT NOT NULL,
            email TEXT,
            birth_date TEXT,
            address TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            approval_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            grade INTEGER NOT NULL,
            class_number INTEGER NOT NULL,
            teacher_id TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(grade, class_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classrooms_teacher ON classrooms(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            teacher_id TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            classroom_id TEXT,
            student_no TEXT NOT NULL UNIQUE,
            number INTEGER NOT NULL,
            profile_image TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_classroom ON students(classroom_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS parents(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS parent_students(
            parent_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            relation TEXT NOT NULL,
            PRIMARY KEY(parent_id, student_id),
            FOREIGN KEY(parent_id) REFERENCES parents(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_parent_students_student ON parent_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_class_history(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            grade INTEGER NOT NULL,
            class_number INTEGER NOT NULL,
            number INTEGER NOT NULL,
            homeroom_teacher TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_academic_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            description TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_history_student ON student_class_history(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_academic_records_student ON student_academic_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_groups(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            grade TEXT NOT NULL,
            semester TEXT NOT NULL,
            status TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_groups_student ON grade_groups(student_id, updated_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_groups_period ON grade_groups(grade, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            grade_group_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            credits INTEGER NOT NULL,
            midterm REAL NOT NULL,
            final REAL NOT NULL,
            performance REAL NOT NULL,
            total_score REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(grade_group_id) REFERENCES grade_groups(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_group ON grades(grade_group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject ON grades(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_summaries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            grade INTEGER NOT NULL,
            year INTEGER NOT NULL,
            home_teacher TEXT NOT NULL DEFAULT '',
            total_days INTEGER NOT NULL DEFAULT 0,
            remarks TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, grade, year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            grade INTEGER NOT NULL,
            year INTEGER NOT NULL,
            attendance_type TEXT NOT NULL,
            reason_type TEXT NOT NULL,
            date TEXT NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student ON attendance_records(student_id, grade, year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback_groups(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            grade INTEGER NOT NULL,
            class_number INTEGER NOT NULL,
            teacher_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedbacks(
            id TEXT PRIMARY KEY,
            feedback_group_id TEXT NOT NULL,
            category TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(feedback_group_id) REFERENCES feedback_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_groups_student ON feedback_groups(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedbacks_group ON feedbacks(feedback_group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS special_notes(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            grade INTEGER NOT NULL,
            class_number INTEGER NOT NULL,
            teacher_id TEXT,
            teacher_name TEXT NOT NULL,
            special_talent TEXT NOT NULL,
            career_student TEXT NOT NULL,
            career_parent TEXT NOT NULL,
            note TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_special_notes_student ON special_notes(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS counselings(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            request_date TEXT NOT NULL,
            counseling_date TEXT NOT NULL,
            counseling_time TEXT NOT NULL,
            counseling_type TEXT NOT NULL,
            counseling_category TEXT NOT NULL,
            status TEXT NOT NULL,
            location TEXT,
            request_content TEXT NOT NULL,
            result_content TEXT,
            contact_number TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_counselings_student ON counselings(student_id, counseling_date)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .expect("prepare");
        stmt.query_map([], |r| r.get::<_, String>(0))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("collect")
    }

    #[test]
    fn schema_bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = open_db(dir.path()).expect("first open");
        let tables = table_names(&first);
        drop(first);

        let second = open_db(dir.path()).expect("second open");
        assert_eq!(table_names(&second), tables);
        for t in ["users", "students", "grade_groups", "grades", "counselings"] {
            assert!(tables.iter().any(|n| n == t), "missing table {t}");
        }
    }

    #[test]
    fn now_timestamp_is_utc_seconds() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'), "{ts}");
        assert_eq!(ts.len(), "2025-05-01T09:00:00Z".len());
    }
}
