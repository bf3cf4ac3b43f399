use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::ipc::error::respond;
use crate::ipc::params::{required_id, Fields};
use crate::ipc::types::{AppState, Request};

fn teacher_exists(conn: &Connection, teacher_id: &str) -> Result<bool, ServiceError> {
    Ok(conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

fn handle_classrooms_create(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let grade = f.required_positive_i64("grade");
    let class_number = f.required_positive_i64("classNumber");
    let teacher_id = f.optional_str("teacherId");
    f.finish()?;
    let (Some(grade), Some(class_number)) = (grade, class_number) else {
        return Err(ServiceError::invalid_field("params", "incomplete request"));
    };

    let conn = state.conn()?;
    if let Some(tid) = &teacher_id {
        if !teacher_exists(conn, tid)? {
            return Err(ServiceError::not_found("teacher not found"));
        }
    }
    let taken = conn
        .query_row(
            "SELECT 1 FROM classrooms WHERE grade = ? AND class_number = ?",
            (grade, class_number),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if taken {
        return Err(ServiceError::Conflict(format!(
            "classroom {grade}-{class_number} already exists"
        )));
    }

    let classroom_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classrooms(id, grade, class_number, teacher_id) VALUES(?, ?, ?, ?)",
        (&classroom_id, grade, class_number, &teacher_id),
    )?;
    Ok(json!({ "classroomId": classroom_id }))
}

fn handle_classrooms_list(state: &mut AppState) -> Result<Value, ServiceError> {
    let conn = state.conn()?;
    let mut stmt = conn.prepare(
        "SELECT c.id, c.grade, c.class_number, c.teacher_id, u.name,
                (SELECT COUNT(*) FROM students s WHERE s.classroom_id = c.id)
         FROM classrooms c
         LEFT JOIN teachers t ON t.id = c.teacher_id
         LEFT JOIN users u ON u.id = t.user_id
         ORDER BY c.grade, c.class_number",
    )?;
    let rows = stmt
        .query_map([], |r| {
            let teacher_id: Option<String> = r.get(3)?;
            let teacher_name: Option<String> = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "grade": r.get::<_, i64>(1)?,
                "classNumber": r.get::<_, i64>(2)?,
                "teacher": teacher_id.map(|id| json!({ "id": id, "name": teacher_name })),
                "studentCount": r.get::<_, i64>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classrooms": rows }))
}

fn handle_subjects_create(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let name = f.required_str("name");
    let teacher_id = f.optional_str("teacherId");
    f.finish()?;
    let name = name.unwrap_or_default();

    let conn = state.conn()?;
    if let Some(tid) = &teacher_id {
        if !teacher_exists(conn, tid)? {
            return Err(ServiceError::not_found("teacher not found"));
        }
    }
    let taken = conn
        .query_row("SELECT 1 FROM subjects WHERE name = ?", [&name], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if taken {
        return Err(ServiceError::Conflict(format!(
            "subject already exists: {name}"
        )));
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, teacher_id) VALUES(?, ?, ?)",
        (&subject_id, &name, &teacher_id),
    )?;
    Ok(json!({ "subjectId": subject_id }))
}

fn handle_subjects_list(state: &mut AppState) -> Result<Value, ServiceError> {
    let conn = state.conn()?;
    let mut stmt = conn.prepare("SELECT id, name, teacher_id FROM subjects ORDER BY name")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, Option<String>>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": rows }))
}

fn teacher_classroom(conn: &Connection, teacher_id: &str) -> Result<Value, ServiceError> {
    let classroom = conn
        .query_row(
            "SELECT id, grade, class_number FROM classrooms
             WHERE teacher_id = ?
             ORDER BY grade, class_number
             LIMIT 1",
            [teacher_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "grade": r.get::<_, i64>(1)?,
                    "classNumber": r.get::<_, i64>(2)?,
                }))
            },
        )
        .optional()?;
    Ok(classroom.unwrap_or(Value::Null))
}

fn handle_teachers_list(state: &mut AppState) -> Result<Value, ServiceError> {
    let conn = state.conn()?;
    let mut stmt = conn.prepare(
        "SELECT t.id, u.id, u.name
         FROM teachers t
         JOIN users u ON u.id = t.user_id
         ORDER BY u.name, t.id",
    )?;
    let teachers = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(teachers.len());
    for (teacher_id, user_id, name) in teachers {
        let classroom = teacher_classroom(conn, &teacher_id)?;
        out.push(json!({
            "id": teacher_id,
            "user": { "id": user_id, "name": name },
            "classroom": classroom,
        }));
    }
    Ok(json!({ "teachers": out }))
}

fn handle_teachers_get(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let teacher_id = required_id(params, "teacherId")?;
    let conn = state.conn()?;
    let user = conn
        .query_row(
            "SELECT u.id, u.username, u.name, u.phone, u.email
             FROM teachers t
             JOIN users u ON u.id = t.user_id
             WHERE t.id = ?",
            [&teacher_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "username": r.get::<_, String>(1)?,
                    "name": r.get::<_, String>(2)?,
                    "phone": r.get::<_, String>(3)?,
                    "email": r.get::<_, Option<String>>(4)?,
                }))
            },
        )
        .optional()?;
    let Some(user) = user else {
        return Err(ServiceError::not_found("teacher not found"));
    };

    let mut stmt =
        conn.prepare("SELECT id, name FROM subjects WHERE teacher_id = ? ORDER BY name")?;
    let subjects = stmt
        .query_map([&teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "id": teacher_id,
        "user": user,
        "classroom": teacher_classroom(conn, &teacher_id)?,
        "subjects": subjects,
    }))
}

fn handle_teachers_update(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let teacher_id = f.required_label("teacherId");
    let classroom_id = f.optional_str("classroomId");
    let subject_ids: Option<Vec<String>> = f.optional_array("subjectIds").map(|items| {
        let mut ids = Vec::with_capacity(items.len());
        for (i, v) in items.iter().enumerate() {
            match v.as_str() {
                Some(s) => ids.push(s.to_string()),
                None => f.push(&format!("subjectIds[{i}]"), "must be a string"),
            }
        }
        ids
    });
    f.finish()?;
    let teacher_id = teacher_id.unwrap_or_default();

    let conn = state.conn()?;
    if !teacher_exists(conn, &teacher_id)? {
        return Err(ServiceError::not_found("teacher not found"));
    }

    let tx = conn.unchecked_transaction()?;
    if let Some(cid) = &classroom_id {
        tx.execute(
            "UPDATE classrooms SET teacher_id = NULL WHERE teacher_id = ?",
            [&teacher_id],
        )?;
        let n = tx.execute(
            "UPDATE classrooms SET teacher_id = ? WHERE id = ?",
            (&teacher_id, cid),
        )?;
        if n == 0 {
            return Err(ServiceError::not_found(format!("classroom not found: {cid}")));
        }
    }
    if let Some(ids) = &subject_ids {
        tx.execute(
            "UPDATE subjects SET teacher_id = NULL WHERE teacher_id = ?",
            [&teacher_id],
        )?;
        for sid in ids {
            let n = tx.execute(
                "UPDATE subjects SET teacher_id = ? WHERE id = ?",
                (&teacher_id, sid),
            )?;
            if n == 0 {
                return Err(ServiceError::not_found(format!("subject not found: {sid}")));
            }
        }
    }
    tx.commit()?;

    handle_teachers_get(state, &json!({ "teacherId": teacher_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "classrooms.create" => handle_classrooms_create(state, &req.params),
        "classrooms.list" => handle_classrooms_list(state),
        "subjects.create" => handle_subjects_create(state, &req.params),
        "subjects.list" => handle_subjects_list(state),
        "teachers.list" => handle_teachers_list(state),
        "teachers.get" => handle_teachers_get(state, &req.params),
        "teachers.update" => handle_teachers_update(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
