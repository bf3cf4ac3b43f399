use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cache::{self, keys};
use crate::db;
use crate::error::ServiceError;
use crate::ipc::error::respond;
use crate::ipc::params::{required_id, Fields};
use crate::ipc::types::{AppState, Request};

const NOTE_SELECT: &str = "SELECT n.id, s.student_no, n.grade, n.class_number, n.teacher_id, n.teacher_name,
            n.special_talent, n.career_student, n.career_parent, n.note, n.created_at, n.updated_at
     FROM special_notes n
     JOIN students s ON s.id = n.student_id";

fn note_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "grade": r.get::<_, i64>(2)?,
        "classNumber": r.get::<_, i64>(3)?,
        "teacherId": r.get::<_, Option<String>>(4)?,
        "teacherName": r.get::<_, String>(5)?,
        "specialTalent": r.get::<_, String>(6)?,
        "careerAspiration": {
            "student": r.get::<_, String>(7)?,
            "parent": r.get::<_, String>(8)?,
        },
        "note": r.get::<_, String>(9)?,
        "createdAt": r.get::<_, String>(10)?,
        "updatedAt": r.get::<_, String>(11)?,
    }))
}

fn load_note(conn: &Connection, note_id: &str) -> Result<Value, ServiceError> {
    let sql = format!("{NOTE_SELECT} WHERE n.id = ?");
    conn.query_row(&sql, [note_id], note_from_row)
        .optional()?
        .ok_or_else(|| ServiceError::not_found("special note not found"))
}

fn note_owner_no(conn: &Connection, note_id: &str) -> Result<String, ServiceError> {
    conn.query_row(
        "SELECT s.student_no FROM special_notes n JOIN students s ON s.id = n.student_id
         WHERE n.id = ?",
        [note_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| ServiceError::not_found("special note not found"))
}

fn handle_list(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let student_no = required_id(params, "studentNo")?;
    let conn = state.conn()?;
    let student_id: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE student_no = ?",
            [&student_no],
            |r| r.get(0),
        )
        .optional()?;
    let Some(student_id) = student_id else {
        return Err(ServiceError::not_found("student not found"));
    };

    cache::get_or_compute(
        state.cache.as_ref(),
        &keys::special_notes(&student_no),
        state.ttl(),
        || {
            let sql = format!(
                "{NOTE_SELECT} WHERE n.student_id = ? ORDER BY n.grade, n.class_number, n.created_at"
            );
            let mut stmt = conn.prepare(&sql)?;
            let notes = stmt
                .query_map([&student_id], note_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!({ "notes": notes }))
        },
    )
}

fn handle_create(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let student_no = f.required_label("studentNo");
    let grade = f.required_positive_i64("grade");
    let class_number = f.required_positive_i64("classNumber");
    let teacher_id = f.required_label("teacherId");
    let teacher_name = f.required_str("teacherName");
    let special_talent = f.required_str("specialTalent");
    let career = f.required_object("careerAspiration").and_then(|c| {
        let mut cf = f.nested(c, "careerAspiration".to_string());
        let student = cf.required_str("student");
        let parent = cf.required_str("parent");
        f.absorb(cf);
        Some((student?, parent?))
    });
    let note = f.required_str("note");
    f.finish()?;
    let (
        Some(student_no),
        Some(grade),
        Some(class_number),
        Some(teacher_id),
        Some(teacher_name),
        Some(special_talent),
        Some((career_student, career_parent)),
        Some(note),
    ) = (
        student_no,
        grade,
        class_number,
        teacher_id,
        teacher_name,
        special_talent,
        career,
        note,
    )
    else {
        return Err(ServiceError::invalid_field("params", "incomplete request"));
    };

    let conn = state.conn()?;
    let student_id: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE student_no = ?",
            [&student_no],
            |r| r.get(0),
        )
        .optional()?;
    let Some(student_id) = student_id else {
        return Err(ServiceError::not_found("student not found"));
    };
    let registered_name: Option<String> = conn
        .query_row(
            "SELECT u.name FROM teachers t JOIN users u ON u.id = t.user_id WHERE t.id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(registered_name) = registered_name else {
        return Err(ServiceError::not_found("teacher not found"));
    };
    if registered_name != teacher_name {
        return Err(ServiceError::invalid_field(
            "teacherName",
            "does not match the teacher's registered name",
        ));
    }

    let note_id = Uuid::new_v4().to_string();
    let now = db::now_timestamp();
    conn.execute(
        "INSERT INTO special_notes(id, student_id, grade, class_number, teacher_id, teacher_name,
                                   special_talent, career_student, career_parent, note, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &note_id,
            &student_id,
            grade,
            class_number,
            &teacher_id,
            &teacher_name,
            &special_talent,
            &career_student,
            &career_parent,
            &note,
            &now,
            &now,
        ),
    )?;

    state.cache.delete(&keys::special_notes(&student_no));
    load_note(conn, &note_id)
}

fn handle_update(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let note_id = f.required_label("noteId");
    let special_talent = f.optional_str("specialTalent");
    let note = f.optional_str("note");
    let (career_student, career_parent) = match f.optional_object("careerAspiration") {
        Some(c) => {
            let mut cf = f.nested(c, "careerAspiration".to_string());
            let pair = (cf.optional_str("student"), cf.optional_str("parent"));
            f.absorb(cf);
            pair
        }
        None => (None, None),
    };
    f.finish()?;
    let note_id = note_id.unwrap_or_default();

    let conn = state.conn()?;
    let student_no = note_owner_no(conn, &note_id)?;

    let tx = conn.unchecked_transaction()?;
    if let Some(v) = &special_talent {
        tx.execute(
            "UPDATE special_notes SET special_talent = ? WHERE id = ?",
            (v, &note_id),
        )?;
    }
    if let Some(v) = &career_student {
        tx.execute(
            "UPDATE special_notes SET career_student = ? WHERE id = ?",
            (v, &note_id),
        )?;
    }
    if let Some(v) = &career_parent {
        tx.execute(
            "UPDATE special_notes SET career_parent = ? WHERE id = ?",
            (v, &note_id),
        )?;
    }
    if let Some(v) = &note {
        tx.execute("UPDATE special_notes SET note = ? WHERE id = ?", (v, &note_id))?;
    }
    tx.execute(
        "UPDATE special_notes SET updated_at = ? WHERE id = ?",
        (db::now_timestamp(), &note_id),
    )?;
    tx.commit()?;

    state.cache.delete(&keys::special_notes(&student_no));
    load_note(conn, &note_id)
}

fn handle_delete(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let note_id = required_id(params, "noteId")?;
    let conn = state.conn()?;
    let student_no = note_owner_no(conn, &note_id)?;
    conn.execute("DELETE FROM special_notes WHERE id = ?", [&note_id])?;
    state.cache.delete(&keys::special_notes(&student_no));
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "specialNotes.list" => handle_list(state, &req.params),
        "specialNotes.create" => handle_create(state, &req.params),
        "specialNotes.update" => handle_update(state, &req.params),
        "specialNotes.delete" => handle_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
