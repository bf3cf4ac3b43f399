use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cache::{self, keys};
use crate::db;
use crate::error::ServiceError;
use crate::ipc::error::respond;
use crate::ipc::params::{required_id, Fields};
use crate::ipc::types::{AppState, Request};

const CATEGORIES: &[&str] = &["academic", "behavior", "attendance", "attitude"];

struct FeedbackItem {
    category: String,
    content: String,
}

fn parse_items(f: &mut Fields<'_>) -> Vec<FeedbackItem> {
    let Some(items) = f.required_array("feedbacks") else {
        return Vec::new();
    };
    if items.is_empty() {
        f.push("feedbacks", "at least one feedback is required");
    }
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let mut it = f.nested(item, format!("feedbacks[{i}]"));
        let category = it.required_choice("category", CATEGORIES);
        let content = it.required_str("content");
        if let (Some(category), Some(content)) = (category, content) {
            out.push(FeedbackItem { category, content });
        }
        f.absorb(it);
    }
    out
}

fn student_by_no(conn: &Connection, student_no: &str) -> Result<String, ServiceError> {
    conn.query_row(
        "SELECT id FROM students WHERE student_no = ?",
        [student_no],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| ServiceError::not_found("student not found"))
}

fn insert_items(
    conn: &Connection,
    group_id: &str,
    items: &[FeedbackItem],
    now: &str,
) -> Result<(), ServiceError> {
    for item in items {
        conn.execute(
            "INSERT INTO feedbacks(id, feedback_group_id, category, content, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                group_id,
                &item.category,
                &item.content,
                now,
                now,
            ),
        )?;
    }
    Ok(())
}

fn load_group(conn: &Connection, group_id: &str) -> Result<Value, ServiceError> {
    let group = conn
        .query_row(
            "SELECT g.id, g.grade, g.class_number, g.teacher_id, u.name, g.created_at, g.updated_at
             FROM feedback_groups g
             LEFT JOIN teachers t ON t.id = g.teacher_id
             LEFT JOIN users u ON u.id = t.user_id
             WHERE g.id = ?",
            [group_id],
            |r| {
                let teacher_id: Option<String> = r.get(3)?;
                let teacher_name: Option<String> = r.get(4)?;
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "grade": r.get::<_, i64>(1)?,
                    "classNumber": r.get::<_, i64>(2)?,
                    "teacher": teacher_id.map(|id| json!({ "id": id, "name": teacher_name })),
                    "createdAt": r.get::<_, String>(5)?,
                    "updatedAt": r.get::<_, String>(6)?,
                }))
            },
        )
        .optional()?;
    let Some(mut group) = group else {
        return Err(ServiceError::not_found("feedback group not found"));
    };

    let mut stmt = conn.prepare(
        "SELECT id, category, content, created_at, updated_at
         FROM feedbacks
         WHERE feedback_group_id = ?
         ORDER BY created_at, rowid",
    )?;
    let items = stmt
        .query_map([group_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "category": r.get::<_, String>(1)?,
                "content": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?,
                "updatedAt": r.get::<_, String>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    group["feedbacks"] = json!(items);
    Ok(group)
}

fn handle_list(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let student_no = required_id(params, "studentNo")?;
    let conn = state.conn()?;
    let student_id = student_by_no(conn, &student_no)?;
    cache::get_or_compute(
        state.cache.as_ref(),
        &keys::feedbacks(&student_no),
        state.ttl(),
        || {
            let mut stmt = conn.prepare(
                "SELECT id FROM feedback_groups
                 WHERE student_id = ?
                 ORDER BY grade, class_number, created_at",
            )?;
            let ids = stmt
                .query_map([&student_id], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut groups = Vec::with_capacity(ids.len());
            for id in ids {
                groups.push(load_group(conn, &id)?);
            }
            Ok(json!({ "groups": groups }))
        },
    )
}

fn handle_create(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let student_no = f.required_label("studentNo");
    let grade = f.required_positive_i64("grade");
    let class_number = f.required_positive_i64("classNumber");
    let teacher_id = f.optional_str("teacherId");
    let items = parse_items(&mut f);
    f.finish()?;
    let (Some(student_no), Some(grade), Some(class_number)) = (student_no, grade, class_number)
    else {
        return Err(ServiceError::invalid_field("params", "incomplete request"));
    };

    let conn = state.conn()?;
    let student_id = student_by_no(conn, &student_no)?;
    if let Some(tid) = &teacher_id {
        let found = conn
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [tid], |r| {
                r.get::<_, i64>(0)
            })
            .optional()?
            .is_some();
        if !found {
            return Err(ServiceError::not_found("teacher not found"));
        }
    }

    let group_id = Uuid::new_v4().to_string();
    let now = db::now_timestamp();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO feedback_groups(id, student_id, grade, class_number, teacher_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &group_id,
            &student_id,
            grade,
            class_number,
            &teacher_id,
            &now,
            &now,
        ),
    )?;
    insert_items(&tx, &group_id, &items, &now)?;
    tx.commit()?;

    state.cache.delete(&keys::feedbacks(&student_no));
    load_group(conn, &group_id)
}

fn group_owner_no(conn: &Connection, group_id: &str) -> Result<String, ServiceError> {
    conn.query_row(
        "SELECT s.student_no FROM feedback_groups g JOIN students s ON s.id = g.student_id
         WHERE g.id = ?",
        [group_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| ServiceError::not_found("feedback group not found"))
}

fn handle_replace_group(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let group_id = f.required_label("groupId");
    let items = parse_items(&mut f);
    f.finish()?;
    let group_id = group_id.unwrap_or_default();

    let conn = state.conn()?;
    let student_no = group_owner_no(conn, &group_id)?;

    let now = db::now_timestamp();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM feedbacks WHERE feedback_group_id = ?",
        [&group_id],
    )?;
    insert_items(&tx, &group_id, &items, &now)?;
    tx.execute(
        "UPDATE feedback_groups SET updated_at = ? WHERE id = ?",
        (&now, &group_id),
    )?;
    tx.commit()?;

    state.cache.delete(&keys::feedbacks(&student_no));
    load_group(conn, &group_id)
}

fn handle_delete(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let feedback_id = required_id(params, "feedbackId")?;
    let conn = state.conn()?;
    let group_id: Option<String> = conn
        .query_row(
            "SELECT feedback_group_id FROM feedbacks WHERE id = ?",
            [&feedback_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(group_id) = group_id else {
        return Err(ServiceError::not_found("feedback not found"));
    };
    let student_no = group_owner_no(conn, &group_id)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM feedbacks WHERE id = ?", [&feedback_id])?;
    let remaining: i64 = tx.query_row(
        "SELECT COUNT(*) FROM feedbacks WHERE feedback_group_id = ?",
        [&group_id],
        |r| r.get(0),
    )?;
    let group_deleted = remaining == 0;
    if group_deleted {
        tx.execute("DELETE FROM feedback_groups WHERE id = ?", [&group_id])?;
    }
    tx.commit()?;

    state.cache.delete(&keys::feedbacks(&student_no));
    Ok(json!({ "deleted": true, "groupDeleted": group_deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "feedbacks.list" => handle_list(state, &req.params),
        "feedbacks.create" => handle_create(state, &req.params),
        "feedbacks.replaceGroup" => handle_replace_group(state, &req.params),
        "feedbacks.delete" => handle_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_are_validated_individually() {
        let params = json!({
            "feedbacks": [
                { "category": "academic", "content": "Solid progress" },
                { "category": "sports", "content": "" },
            ],
        });
        let mut f = Fields::new(&params);
        let items = parse_items(&mut f);
        assert_eq!(items.len(), 1);
        let err = f.finish().unwrap_err();
        let details = err.details().expect("details");
        assert_eq!(details["errors"][0]["field"], "feedbacks[1].category");
        assert_eq!(details["errors"][1]["field"], "feedbacks[1].content");
    }

    #[test]
    fn empty_item_list_is_rejected() {
        let params = json!({ "feedbacks": [] });
        let mut f = Fields::new(&params);
        parse_items(&mut f);
        assert!(!f.is_clean());
    }
}
