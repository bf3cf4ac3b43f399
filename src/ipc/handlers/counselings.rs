use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cache::keys;
use crate::db;
use crate::error::ServiceError;
use crate::ipc::error::respond;
use crate::ipc::params::{required_id, Fields};
use crate::ipc::types::{AppState, Request};

const STATUSES: &[&str] = &["requested", "waiting", "confirmed", "completed", "cancelled"];
const CATEGORIES: &[&str] = &["academic", "career", "psychological"];

const COUNSELING_SELECT: &str = "SELECT k.id, k.student_id, su.name, k.teacher_id, tu.name,
            k.request_date, k.counseling_date, k.counseling_time, k.counseling_type,
            k.counseling_category, k.status, k.location, k.request_content,
            k.result_content, k.contact_number
     FROM counselings k
     JOIN students s ON s.id = k.student_id
     JOIN users su ON su.id = s.user_id
     JOIN teachers t ON t.id = k.teacher_id
     JOIN users tu ON tu.id = t.user_id";

fn counseling_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "student": { "id": r.get::<_, String>(1)?, "name": r.get::<_, String>(2)? },
        "teacher": { "id": r.get::<_, String>(3)?, "name": r.get::<_, String>(4)? },
        "requestDate": r.get::<_, String>(5)?,
        "counselingDate": r.get::<_, String>(6)?,
        "counselingTime": r.get::<_, String>(7)?,
        "counselingType": r.get::<_, String>(8)?,
        "counselingCategory": r.get::<_, String>(9)?,
        "status": r.get::<_, String>(10)?,
        "location": r.get::<_, Option<String>>(11)?,
        "requestContent": r.get::<_, String>(12)?,
        "resultContent": r.get::<_, Option<String>>(13)?,
        "contactNumber": r.get::<_, String>(14)?,
    }))
}

fn load(conn: &Connection, counseling_id: &str) -> Result<Value, ServiceError> {
    let sql = format!("{COUNSELING_SELECT} WHERE k.id = ?");
    conn.query_row(&sql, [counseling_id], counseling_from_row)
        .optional()?
        .ok_or_else(|| ServiceError::not_found("counseling not found"))
}

fn date_field(f: &mut Fields<'_>, key: &str, required: bool) -> Option<String> {
    let raw = if required {
        f.required_str(key)
    } else {
        f.optional_str(key)
    }?;
    if chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d").is_err() {
        f.push(key, "must be a YYYY-MM-DD date");
        return None;
    }
    Some(raw)
}

fn time_field(f: &mut Fields<'_>, key: &str, required: bool) -> Option<String> {
    let raw = if required {
        f.required_str(key)
    } else {
        f.optional_str(key)
    }?;
    let parsed = chrono::NaiveTime::parse_from_str(&raw, "%H:%M")
        .or_else(|_| chrono::NaiveTime::parse_from_str(&raw, "%H:%M:%S"));
    match parsed {
        Ok(t) => Some(t.format("%H:%M").to_string()),
        Err(_) => {
            f.push(key, "must be an HH:MM time");
            None
        }
    }
}

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, ServiceError> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

fn handle_list(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let student_id = f.optional_label("studentId");
    f.finish()?;

    let conn = state.conn()?;
    let sql = format!(
        "{COUNSELING_SELECT}
         WHERE (?1 IS NULL OR k.student_id = ?1)
         ORDER BY k.counseling_date DESC, k.counseling_time DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([&student_id], counseling_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "counselings": rows }))
}

fn handle_get(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let counseling_id = required_id(params, "counselingId")?;
    load(state.conn()?, &counseling_id)
}

fn handle_create(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let student_id = f.required_label("studentId");
    let teacher_id = f.required_label("teacherId");
    let counseling_date = date_field(&mut f, "counselingDate", true);
    let counseling_time = time_field(&mut f, "counselingTime", true);
    let counseling_type = f.required_str("counselingType");
    let category = f.required_choice("counselingCategory", CATEGORIES);
    let location = f.optional_str("location");
    let request_content = f.required_str("requestContent");
    let contact_number = f.required_str("contactNumber");
    f.finish()?;
    let (
        Some(student_id),
        Some(teacher_id),
        Some(counseling_date),
        Some(counseling_time),
        Some(counseling_type),
        Some(category),
        Some(request_content),
        Some(contact_number),
    ) = (
        student_id,
        teacher_id,
        counseling_date,
        counseling_time,
        counseling_type,
        category,
        request_content,
        contact_number,
    )
    else {
        return Err(ServiceError::invalid_field("params", "incomplete request"));
    };

    let conn = state.conn()?;
    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(ServiceError::not_found("student not found"));
    }
    if !exists(conn, "SELECT 1 FROM teachers WHERE id = ?", &teacher_id)? {
        return Err(ServiceError::not_found("teacher not found"));
    }

    let counseling_id = Uuid::new_v4().to_string();
    let request_date = db::now_timestamp();
    conn.execute(
        "INSERT INTO counselings(id, student_id, teacher_id, request_date, counseling_date, counseling_time,
                                 counseling_type, counseling_category, status, location, request_content,
                                 contact_number)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'requested', ?, ?, ?)",
        (
            &counseling_id,
            &student_id,
            &teacher_id,
            &request_date[..10],
            &counseling_date,
            &counseling_time,
            &counseling_type,
            &category,
            &location,
            &request_content,
            &contact_number,
        ),
    )?;

    state.cache.delete_prefix(keys::STUDENTS_LIST_PREFIX);
    load(conn, &counseling_id)
}

fn handle_update(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let counseling_id = f.required_label("counselingId");
    let status = f.optional_choice("status", STATUSES);
    let counseling_date = date_field(&mut f, "counselingDate", false);
    let counseling_time = time_field(&mut f, "counselingTime", false);
    let location = f.optional_str("location");
    let result_content = f.optional_str("resultContent");
    f.finish()?;
    let counseling_id = counseling_id.unwrap_or_default();

    let conn = state.conn()?;
    if !exists(conn, "SELECT 1 FROM counselings WHERE id = ?", &counseling_id)? {
        return Err(ServiceError::not_found("counseling not found"));
    }

    let tx = conn.unchecked_transaction()?;
    if let Some(v) = &status {
        tx.execute(
            "UPDATE counselings SET status = ? WHERE id = ?",
            (v, &counseling_id),
        )?;
    }
    if let Some(v) = &counseling_date {
        tx.execute(
            "UPDATE counselings SET counseling_date = ? WHERE id = ?",
            (v, &counseling_id),
        )?;
    }
    if let Some(v) = &counseling_time {
        tx.execute(
            "UPDATE counselings SET counseling_time = ? WHERE id = ?",
            (v, &counseling_id),
        )?;
    }
    if let Some(v) = &location {
        tx.execute(
            "UPDATE counselings SET location = ? WHERE id = ?",
            (v, &counseling_id),
        )?;
    }
    if let Some(v) = &result_content {
        tx.execute(
            "UPDATE counselings SET result_content = ? WHERE id = ?",
            (v, &counseling_id),
        )?;
    }
    tx.commit()?;

    if counseling_date.is_some() {
        state.cache.delete_prefix(keys::STUDENTS_LIST_PREFIX);
    }
    load(conn, &counseling_id)
}

fn handle_delete(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let counseling_id = required_id(params, "counselingId")?;
    let conn = state.conn()?;
    let n = conn.execute("DELETE FROM counselings WHERE id = ?", [&counseling_id])?;
    if n == 0 {
        return Err(ServiceError::not_found("counseling not found"));
    }
    state.cache.delete_prefix(keys::STUDENTS_LIST_PREFIX);
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "counselings.list" => handle_list(state, &req.params),
        "counselings.get" => handle_get(state, &req.params),
        "counselings.create" => handle_create(state, &req.params),
        "counselings.update" => handle_update(state, &req.params),
        "counselings.delete" => handle_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_are_normalized_to_minutes() {
        let params = json!({ "a": "09:30:00", "b": "9:05", "c": "noon" });
        let mut f = Fields::new(&params);
        assert_eq!(time_field(&mut f, "a", true).as_deref(), Some("09:30"));
        assert_eq!(time_field(&mut f, "b", true).as_deref(), Some("09:05"));
        assert_eq!(time_field(&mut f, "c", true), None);
        assert_eq!(time_field(&mut f, "d", false), None);
        let err = f.finish().unwrap_err();
        assert_eq!(err.details().expect("details")["errors"][0]["field"], "c");
    }
}
