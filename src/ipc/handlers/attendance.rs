use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cache::{self, keys};
use crate::error::ServiceError;
use crate::ipc::error::respond;
use crate::ipc::params::Fields;
use crate::ipc::types::{AppState, Request};

const REASON_TYPES: &[&str] = &["illness", "unauthorized", "etc"];

fn student_name(conn: &Connection, student_id: &str) -> Result<String, ServiceError> {
    conn.query_row(
        "SELECT u.name FROM students s JOIN users u ON u.id = s.user_id WHERE s.id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| ServiceError::not_found("student not found"))
}

fn date_field(f: &mut Fields<'_>, key: &str) -> Option<String> {
    let raw = f.required_str(key)?;
    if chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d").is_err() {
        f.push(key, "must be a YYYY-MM-DD date");
        return None;
    }
    Some(raw)
}

/// Identifies one attendance record: `(grade, year, type, reason, date)`.
struct RecordKey {
    grade: i64,
    year: i64,
    attendance_type: String,
    reason_type: String,
    date: String,
}

fn parse_record_key(f: &mut Fields<'_>) -> Option<RecordKey> {
    let grade = f.required_positive_i64("grade");
    let year = f.required_positive_i64("year");
    let attendance_type = f.required_str("attendanceType");
    let reason_type = f.required_choice("reasonType", REASON_TYPES);
    let date = date_field(f, "date");
    Some(RecordKey {
        grade: grade?,
        year: year?,
        attendance_type: attendance_type?,
        reason_type: reason_type?,
        date: date?,
    })
}

fn summary_block(
    conn: &Connection,
    student_id: &str,
    grade: i64,
    year: i64,
    home_teacher: String,
    total_days: i64,
    remarks: String,
) -> Result<Value, ServiceError> {
    let mut stmt = conn.prepare(
        "SELECT attendance_type, reason_type, date, reason
         FROM attendance_records
         WHERE student_id = ? AND grade = ? AND year = ?
         ORDER BY date, rowid",
    )?;
    let records = stmt
        .query_map((student_id, grade, year), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // type -> reason -> count, with every reason present per type.
    let mut stats: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    let mut details: BTreeMap<String, BTreeMap<String, Vec<Value>>> = BTreeMap::new();
    for (typ, reason_type, date, reason) in records {
        let counts = stats.entry(typ.clone()).or_insert_with(|| {
            REASON_TYPES.iter().map(|r| (r.to_string(), 0)).collect()
        });
        *counts.entry(reason_type.clone()).or_insert(0) += 1;
        details
            .entry(typ)
            .or_default()
            .entry(reason_type)
            .or_default()
            .push(json!({ "date": date, "reason": reason }));
    }

    Ok(json!({
        "grade": grade,
        "year": year,
        "homeTeacher": home_teacher,
        "totalDays": total_days,
        "remarks": remarks,
        "attendance": stats,
        "details": details,
    }))
}

fn handle_get(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let student_id = f.required_label("studentId");
    let grade = f.optional_label("grade");
    let year = f.optional_label("year");
    f.finish()?;
    let student_id = student_id.unwrap_or_default();

    let conn = state.conn()?;
    let key = keys::attendance(&student_id, grade.as_deref(), year.as_deref());
    cache::get_or_compute(state.cache.as_ref(), &key, state.ttl(), || {
        let name = student_name(conn, &student_id)?;
        // The filter only applies when both halves are given.
        let (grade_filter, year_filter) = match (&grade, &year) {
            (Some(g), Some(y)) => {
                let g = g
                    .parse::<i64>()
                    .map_err(|_| ServiceError::invalid_field("grade", "must be an integer"))?;
                let y = y
                    .parse::<i64>()
                    .map_err(|_| ServiceError::invalid_field("year", "must be an integer"))?;
                (Some(g), Some(y))
            }
            _ => (None, None),
        };

        let mut stmt = conn.prepare(
            "SELECT grade, year, home_teacher, total_days, remarks
             FROM attendance_summaries
             WHERE student_id = ?1
               AND (?2 IS NULL OR grade = ?2)
               AND (?3 IS NULL OR year = ?3)
             ORDER BY year, grade",
        )?;
        let summaries = stmt
            .query_map((&student_id, grade_filter, year_filter), |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut blocks = Vec::with_capacity(summaries.len());
        for (g, y, home_teacher, total_days, remarks) in summaries {
            blocks.push(summary_block(
                conn,
                &student_id,
                g,
                y,
                home_teacher,
                total_days,
                remarks,
            )?);
        }
        Ok(json!({
            "studentId": student_id,
            "studentName": name,
            "attendance": blocks,
        }))
    })
}

fn handle_add(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let student_id = f.required_label("studentId");
    let key = parse_record_key(&mut f);
    let reason = f.optional_str("reason").unwrap_or_default();
    let home_teacher = f.optional_str("homeTeacher").unwrap_or_default();
    f.finish()?;
    let (Some(student_id), Some(key)) = (student_id, key) else {
        return Err(ServiceError::invalid_field("params", "incomplete request"));
    };

    let conn = state.conn()?;
    student_name(conn, &student_id)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT OR IGNORE INTO attendance_summaries(id, student_id, grade, year, home_teacher)
         VALUES(?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            key.grade,
            key.year,
            &home_teacher,
        ),
    )?;
    tx.execute(
        "INSERT INTO attendance_records(id, student_id, grade, year, attendance_type, reason_type, date, reason)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            key.grade,
            key.year,
            &key.attendance_type,
            &key.reason_type,
            &key.date,
            &reason,
        ),
    )?;
    tx.commit()?;

    state
        .cache
        .delete_prefix(&keys::attendance_prefix(&student_id));
    Ok(json!({ "message": "Attendance record added successfully" }))
}

fn handle_delete(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let student_id = f.required_label("studentId");
    let key = parse_record_key(&mut f);
    f.finish()?;
    let (Some(student_id), Some(key)) = (student_id, key) else {
        return Err(ServiceError::invalid_field("params", "incomplete request"));
    };

    let conn = state.conn()?;
    student_name(conn, &student_id)?;
    let deleted = conn.execute(
        "DELETE FROM attendance_records
         WHERE student_id = ? AND grade = ? AND year = ?
           AND attendance_type = ? AND reason_type = ? AND date = ?",
        (
            &student_id,
            key.grade,
            key.year,
            &key.attendance_type,
            &key.reason_type,
            &key.date,
        ),
    )?;
    if deleted == 0 {
        return Err(ServiceError::not_found("attendance record not found"));
    }

    state
        .cache
        .delete_prefix(&keys::attendance_prefix(&student_id));
    Ok(json!({ "message": "Attendance record deleted successfully", "deleted": deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "attendance.get" => handle_get(state, &req.params),
        "attendance.add" => handle_add(state, &req.params),
        "attendance.delete" => handle_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
