use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cache::{self, keys, Cache};
use crate::error::ServiceError;
use crate::ipc::error::respond;
use crate::ipc::params::{required_id, Fields};
use crate::ipc::types::{AppState, Request};

fn parse_int_filter(f: &mut Fields<'_>, key: &str) -> (Option<String>, Option<i64>) {
    let Some(raw) = f.optional_label(key) else {
        return (None, None);
    };
    match raw.parse::<i64>() {
        Ok(n) => (Some(raw), Some(n)),
        Err(_) => {
            f.push(key, "must be an integer");
            (Some(raw), None)
        }
    }
}

fn handle_list(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let (grade_raw, grade) = parse_int_filter(&mut f, "grade");
    let (class_raw, class) = parse_int_filter(&mut f, "class");
    let search = f.optional_label("search");
    f.finish()?;

    let conn = state.conn()?;
    let key = keys::students_list(grade_raw.as_deref(), class_raw.as_deref(), search.as_deref());
    cache::get_or_compute(state.cache.as_ref(), &key, state.ttl(), || {
        let pattern = search.as_ref().map(|s| format!("%{s}%"));
        let mut stmt = conn.prepare(
            "SELECT s.id, u.name, s.student_no, c.grade, c.class_number, s.number,
                    (SELECT MAX(k.counseling_date) FROM counselings k WHERE k.student_id = s.id),
                    s.profile_image
             FROM students s
             JOIN users u ON u.id = s.user_id
             LEFT JOIN classrooms c ON c.id = s.classroom_id
             WHERE (?1 IS NULL OR c.grade = ?1)
               AND (?2 IS NULL OR c.class_number = ?2)
               AND (?3 IS NULL OR u.name LIKE ?3)
             ORDER BY c.grade, c.class_number, s.number, s.rowid",
        )?;
        let rows = stmt
            .query_map((grade, class, pattern), |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "studentId": r.get::<_, String>(2)?,
                    "grade": r.get::<_, Option<i64>>(3)?,
                    "classNumber": r.get::<_, Option<i64>>(4)?,
                    "number": r.get::<_, i64>(5)?,
                    "recentCounselingDate": r.get::<_, Option<String>>(6)?,
                    "profileImage": r.get::<_, Option<String>>(7)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "students": rows }))
    })
}

fn parent_name(conn: &Connection, student_id: &str, relation: &str) -> Result<Option<String>, ServiceError> {
    let name = conn
        .query_row(
            "SELECT u.name
             FROM parent_students ps
             JOIN parents p ON p.id = ps.parent_id
             JOIN users u ON u.id = p.user_id
             WHERE ps.student_id = ? AND ps.relation = ?
             ORDER BY u.name
             LIMIT 1",
            (student_id, relation),
            |r| r.get(0),
        )
        .optional()?;
    Ok(name)
}

fn load_detail(conn: &Connection, student_id: &str) -> Result<Value, ServiceError> {
    let base = conn
        .query_row(
            "SELECT s.profile_image, u.name, s.student_no, c.grade, c.class_number, s.number,
                    u.birth_date, u.address
             FROM students s
             JOIN users u ON u.id = s.user_id
             LEFT JOIN classrooms c ON c.id = s.classroom_id
             WHERE s.id = ?",
            [student_id],
            |r| {
                Ok(json!({
                    "id": student_id,
                    "profileImage": r.get::<_, Option<String>>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "studentId": r.get::<_, String>(2)?,
                    "grade": r.get::<_, Option<i64>>(3)?,
                    "classNumber": r.get::<_, Option<i64>>(4)?,
                    "number": r.get::<_, i64>(5)?,
                    "birthDate": r.get::<_, Option<String>>(6)?,
                    "address": r.get::<_, Option<String>>(7)?,
                }))
            },
        )
        .optional()?;
    let Some(mut detail) = base else {
        return Err(ServiceError::not_found("student not found"));
    };

    let mut stmt = conn.prepare(
        "SELECT grade, class_number, number, homeroom_teacher
         FROM student_class_history
         WHERE student_id = ?
         ORDER BY sort_order",
    )?;
    let history = stmt
        .query_map([student_id], |r| {
            Ok(json!({
                "grade": r.get::<_, i64>(0)?,
                "classNumber": r.get::<_, i64>(1)?,
                "number": r.get::<_, i64>(2)?,
                "homeroomTeacher": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT description FROM student_academic_records WHERE student_id = ? ORDER BY sort_order",
    )?;
    let records = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    detail["fatherName"] = json!(parent_name(conn, student_id, "father")?);
    detail["motherName"] = json!(parent_name(conn, student_id, "mother")?);
    detail["history"] = json!(history);
    detail["academicRecords"] = json!(records);
    Ok(detail)
}

fn handle_get(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let student_id = required_id(params, "studentId")?;
    let conn = state.conn()?;
    cache::get_or_compute(
        state.cache.as_ref(),
        &keys::student_detail(&student_id),
        state.ttl(),
        || load_detail(conn, &student_id),
    )
}

struct HistoryRow {
    grade: i64,
    class_number: i64,
    number: i64,
    homeroom_teacher: String,
}

struct StudentUpdate {
    student_id: String,
    student_no: Option<String>,
    number: Option<i64>,
    classroom_id: Option<String>,
    profile_image: Option<String>,
    history: Option<Vec<HistoryRow>>,
    academic_records: Option<Vec<String>>,
}

fn parse_update(params: &Value) -> Result<StudentUpdate, ServiceError> {
    let mut f = Fields::new(params);
    let student_id = f.required_label("studentId");
    let student_no = f.optional_str("studentNo");
    let number = f.optional_positive_i64("number");
    let classroom_id = f.optional_str("classroomId");
    let profile_image = f.optional_str("profileImage");

    let history = f.optional_array("history").map(|items| {
        let mut rows = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let mut h = f.nested(item, format!("history[{i}]"));
            let grade = h.required_positive_i64("grade");
            let class_number = h.required_positive_i64("classNumber");
            let number = h.required_positive_i64("number");
            let homeroom_teacher = h.required_str("homeroomTeacher");
            if let (Some(grade), Some(class_number), Some(number), Some(homeroom_teacher)) =
                (grade, class_number, number, homeroom_teacher)
            {
                rows.push(HistoryRow {
                    grade,
                    class_number,
                    number,
                    homeroom_teacher,
                });
            }
            f.absorb(h);
        }
        rows
    });

    let academic_records = f.optional_array("academicRecords").map(|items| {
        let mut out = Vec::with_capacity(items.len());
        for (i, v) in items.iter().enumerate() {
            match v.as_str() {
                Some(s) => out.push(s.to_string()),
                None => f.push(&format!("academicRecords[{i}]"), "must be a string"),
            }
        }
        out
    });
    f.finish()?;

    Ok(StudentUpdate {
        student_id: student_id.unwrap_or_default(),
        student_no,
        number,
        classroom_id,
        profile_image,
        history,
        academic_records,
    })
}

/// Everything cached about one student, keyed by internal id and by the
/// school-issued number.
fn invalidate_student(cache: &dyn Cache, student_id: &str, student_nos: &[&str]) {
    cache.delete(&keys::student_detail(student_id));
    cache.delete_prefix(keys::STUDENTS_LIST_PREFIX);
    cache.delete_prefix(&keys::grade_overview_prefix(student_id));
    cache.delete_prefix(keys::GRADE_STATUS_PREFIX);
    cache.delete_prefix(&keys::attendance_prefix(student_id));
    for no in student_nos {
        cache.delete(&keys::feedbacks(no));
        cache.delete(&keys::special_notes(no));
    }
}

fn current_student_no(conn: &Connection, student_id: &str) -> Result<String, ServiceError> {
    conn.query_row(
        "SELECT student_no FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| ServiceError::not_found("student not found"))
}

fn handle_update(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let update = parse_update(params)?;
    let conn = state.conn()?;
    let sid = &update.student_id;
    let old_no = current_student_no(conn, sid)?;

    if let Some(no) = &update.student_no {
        let clash = conn
            .query_row(
                "SELECT 1 FROM students WHERE student_no = ? AND id <> ?",
                (no, sid),
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        if clash {
            return Err(ServiceError::Conflict(format!(
                "student number already registered: {no}"
            )));
        }
    }
    if let Some(cid) = &update.classroom_id {
        let found = conn
            .query_row("SELECT 1 FROM classrooms WHERE id = ?", [cid], |r| {
                r.get::<_, i64>(0)
            })
            .optional()?
            .is_some();
        if !found {
            return Err(ServiceError::not_found("classroom not found"));
        }
    }

    let tx = conn.unchecked_transaction()?;
    if let Some(v) = &update.student_no {
        tx.execute("UPDATE students SET student_no = ? WHERE id = ?", (v, sid))?;
    }
    if let Some(v) = update.number {
        tx.execute("UPDATE students SET number = ? WHERE id = ?", (v, sid))?;
    }
    if let Some(v) = &update.classroom_id {
        tx.execute("UPDATE students SET classroom_id = ? WHERE id = ?", (v, sid))?;
    }
    if let Some(v) = &update.profile_image {
        tx.execute("UPDATE students SET profile_image = ? WHERE id = ?", (v, sid))?;
    }
    if let Some(rows) = &update.history {
        tx.execute("DELETE FROM student_class_history WHERE student_id = ?", [sid])?;
        for (i, h) in rows.iter().enumerate() {
            tx.execute(
                "INSERT INTO student_class_history(id, student_id, grade, class_number, number, homeroom_teacher, sort_order)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    sid,
                    h.grade,
                    h.class_number,
                    h.number,
                    &h.homeroom_teacher,
                    i as i64,
                ),
            )?;
        }
    }
    if let Some(records) = &update.academic_records {
        tx.execute(
            "DELETE FROM student_academic_records WHERE student_id = ?",
            [sid],
        )?;
        for (i, desc) in records.iter().enumerate() {
            tx.execute(
                "INSERT INTO student_academic_records(id, student_id, description, sort_order)
                 VALUES(?, ?, ?, ?)",
                (Uuid::new_v4().to_string(), sid, desc, i as i64),
            )?;
        }
    }
    tx.commit()?;

    let new_no = update.student_no.as_deref().unwrap_or(&old_no);
    invalidate_student(state.cache.as_ref(), sid, &[old_no.as_str(), new_no]);
    Ok(json!({ "message": "Student information updated successfully" }))
}

fn handle_delete(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let student_id = required_id(params, "studentId")?;
    let conn = state.conn()?;
    let student_no = current_student_no(conn, &student_id)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM grades
         WHERE grade_group_id IN (SELECT id FROM grade_groups WHERE student_id = ?)",
        [&student_id],
    )?;
    tx.execute(
        "DELETE FROM feedbacks
         WHERE feedback_group_id IN (SELECT id FROM feedback_groups WHERE student_id = ?)",
        [&student_id],
    )?;
    for table in [
        "grade_groups",
        "attendance_records",
        "attendance_summaries",
        "feedback_groups",
        "special_notes",
        "counselings",
        "parent_students",
        "student_class_history",
        "student_academic_records",
    ] {
        tx.execute(
            &format!("DELETE FROM {table} WHERE student_id = ?"),
            [&student_id],
        )?;
    }
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])?;
    tx.commit()?;

    invalidate_student(state.cache.as_ref(), &student_id, &[student_no.as_str()]);
    tracing::info!(student_id = %student_id, "student deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_list(state, &req.params),
        "students.get" => handle_get(state, &req.params),
        "students.update" => handle_update(state, &req.params),
        "students.delete" => handle_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
