use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cache::keys;
use crate::db;
use crate::error::ServiceError;
use crate::ipc::error::respond;
use crate::ipc::params::{required_id, Fields};
use crate::ipc::types::{AppState, Request};

const ROLES: &[&str] = &["teacher", "student", "parent"];
const RELATIONS: &[&str] = &["father", "mother"];
const APPROVAL_STATUSES: &[&str] = &["pending", "approved", "rejected"];
const MIN_PASSWORD_LEN: usize = 8;

/// Single salted SHA-256, tagged with its scheme so a slower KDF can be
/// introduced under another tag.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("sha256${salt}${}", digest(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("sha256"), Some(salt), Some(hex)) => digest(salt, password) == hex,
        _ => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn password_field(f: &mut Fields<'_>, key: &str) -> Option<String> {
    let password = f.required_str(key)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        f.push(key, format!("must be at least {MIN_PASSWORD_LEN} characters"));
        return None;
    }
    Some(password)
}

fn date_field(f: &mut Fields<'_>, key: &str) -> Option<String> {
    let raw = f.optional_str(key)?;
    if chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d").is_err() {
        f.push(key, "must be a YYYY-MM-DD date");
        return None;
    }
    Some(raw)
}

enum Profile {
    Teacher,
    Student {
        student_no: String,
        number: i64,
        classroom_id: Option<String>,
    },
    Parent {
        children: Vec<(String, String)>,
    },
}

struct Registration {
    username: String,
    password: String,
    role: String,
    name: String,
    phone: String,
    email: Option<String>,
    birth_date: Option<String>,
    address: Option<String>,
    profile: Profile,
}

fn parse_registration(params: &Value) -> Result<Registration, ServiceError> {
    let mut f = Fields::new(params);
    let username = f.required_str("username");
    let password = password_field(&mut f, "password");
    let role = f.required_choice("role", ROLES);
    let name = f.required_str("name");
    let phone = f.required_str("phone");
    let email = f.optional_str("email");
    let birth_date = date_field(&mut f, "birthDate");
    let address = f.optional_str("address");

    let profile = match role.as_deref() {
        Some("student") => f.required_object("profile").and_then(|p| {
            let mut pf = f.nested(p, "profile".to_string());
            let student_no = pf.required_str("studentNo");
            let number = pf.required_positive_i64("number");
            let classroom_id = pf.optional_str("classroomId");
            f.absorb(pf);
            Some(Profile::Student {
                student_no: student_no?,
                number: number?,
                classroom_id,
            })
        }),
        Some("parent") => f.required_object("profile").and_then(|p| {
            let mut pf = f.nested(p, "profile".to_string());
            let mut children = Vec::new();
            if let Some(items) = pf.required_array("children") {
                for (i, item) in items.iter().enumerate() {
                    let mut c = pf.nested(item, format!("profile.children[{i}]"));
                    let student_id = c.required_label("studentId");
                    let relation = c.required_choice("relation", RELATIONS);
                    if let (Some(s), Some(r)) = (student_id, relation) {
                        children.push((s, r));
                    }
                    pf.absorb(c);
                }
            }
            f.absorb(pf);
            Some(Profile::Parent { children })
        }),
        Some(_) => Some(Profile::Teacher),
        None => None,
    };
    f.finish()?;

    match (username, password, role, name, phone, profile) {
        (Some(username), Some(password), Some(role), Some(name), Some(phone), Some(profile)) => {
            Ok(Registration {
                username,
                password,
                role,
                name,
                phone,
                email,
                birth_date,
                address,
                profile,
            })
        }
        _ => Err(ServiceError::invalid_field("params", "incomplete registration")),
    }
}

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, ServiceError> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

fn handle_register(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let reg = parse_registration(params)?;
    let conn = state.conn()?;

    if exists(conn, "SELECT 1 FROM users WHERE username = ?", &reg.username)? {
        return Err(ServiceError::Conflict(format!(
            "username already taken: {}",
            reg.username
        )));
    }
    match &reg.profile {
        Profile::Student {
            student_no,
            classroom_id,
            ..
        } => {
            if exists(conn, "SELECT 1 FROM students WHERE student_no = ?", student_no)? {
                return Err(ServiceError::Conflict(format!(
                    "student number already registered: {student_no}"
                )));
            }
            if let Some(cid) = classroom_id {
                if !exists(conn, "SELECT 1 FROM classrooms WHERE id = ?", cid)? {
                    return Err(ServiceError::not_found("classroom not found"));
                }
            }
        }
        Profile::Parent { children } => {
            for (student_id, _) in children {
                if !exists(conn, "SELECT 1 FROM students WHERE id = ?", student_id)? {
                    return Err(ServiceError::not_found(format!(
                        "student not found: {student_id}"
                    )));
                }
            }
        }
        Profile::Teacher => {}
    }

    let user_id = Uuid::new_v4().to_string();
    let profile_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO users(id, username, password_hash, role, name, phone, email, birth_date, address, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &reg.username,
            hash_password(&reg.password),
            &reg.role,
            &reg.name,
            &reg.phone,
            &reg.email,
            &reg.birth_date,
            &reg.address,
            db::now_timestamp(),
        ),
    )?;
    match &reg.profile {
        Profile::Teacher => {
            tx.execute(
                "INSERT INTO teachers(id, user_id) VALUES(?, ?)",
                (&profile_id, &user_id),
            )?;
        }
        Profile::Student {
            student_no,
            number,
            classroom_id,
        } => {
            tx.execute(
                "INSERT INTO students(id, user_id, classroom_id, student_no, number) VALUES(?, ?, ?, ?, ?)",
                (&profile_id, &user_id, classroom_id, student_no, number),
            )?;
        }
        Profile::Parent { children } => {
            tx.execute(
                "INSERT INTO parents(id, user_id) VALUES(?, ?)",
                (&profile_id, &user_id),
            )?;
            for (student_id, relation) in children {
                tx.execute(
                    "INSERT OR REPLACE INTO parent_students(parent_id, student_id, relation) VALUES(?, ?, ?)",
                    (&profile_id, student_id, relation),
                )?;
                state.cache.delete(&keys::student_detail(student_id));
            }
        }
    }
    tx.commit()?;

    if matches!(reg.profile, Profile::Student { .. }) {
        state.cache.delete_prefix(keys::STUDENTS_LIST_PREFIX);
    }
    tracing::info!(user_id = %user_id, role = %reg.role, "user registered");
    Ok(json!({
        "userId": user_id,
        "role": reg.role,
        "profileId": profile_id,
    }))
}

fn handle_get(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let user_id = required_id(params, "userId")?;
    let conn = state.conn()?;
    let user = conn
        .query_row(
            "SELECT u.id, u.username, u.role, u.name, u.phone, u.email, u.birth_date, u.address,
                    u.is_active, u.approval_status, u.created_at,
                    COALESCE(t.id, s.id, p.id)
             FROM users u
             LEFT JOIN teachers t ON t.user_id = u.id
             LEFT JOIN students s ON s.user_id = u.id
             LEFT JOIN parents p ON p.user_id = u.id
             WHERE u.id = ?",
            [&user_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "username": r.get::<_, String>(1)?,
                    "role": r.get::<_, String>(2)?,
                    "name": r.get::<_, String>(3)?,
                    "phone": r.get::<_, String>(4)?,
                    "email": r.get::<_, Option<String>>(5)?,
                    "birthDate": r.get::<_, Option<String>>(6)?,
                    "address": r.get::<_, Option<String>>(7)?,
                    "isActive": r.get::<_, i64>(8)? != 0,
                    "approvalStatus": r.get::<_, String>(9)?,
                    "createdAt": r.get::<_, String>(10)?,
                    "profileId": r.get::<_, Option<String>>(11)?,
                }))
            },
        )
        .optional()?;
    user.ok_or_else(|| ServiceError::not_found("user not found"))
}

fn handle_update(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let user_id = f.required_label("userId");
    let name = f.optional_str("name");
    let email = f.optional_str("email");
    let phone = f.optional_str("phone");
    let birth_date = date_field(&mut f, "birthDate");
    let address = f.optional_str("address");
    let is_active = f.optional_bool("isActive");
    let approval_status = f.optional_choice("approvalStatus", APPROVAL_STATUSES);
    for read_only in ["username", "role"] {
        if params.get(read_only).is_some() {
            f.push(read_only, "cannot be changed");
        }
    }
    f.finish()?;
    let user_id = user_id.unwrap_or_default();

    let conn = state.conn()?;
    if !exists(conn, "SELECT 1 FROM users WHERE id = ?", &user_id)? {
        return Err(ServiceError::not_found("user not found"));
    }

    let tx = conn.unchecked_transaction()?;
    if let Some(v) = &name {
        tx.execute("UPDATE users SET name = ? WHERE id = ?", (v, &user_id))?;
    }
    if let Some(v) = &email {
        tx.execute("UPDATE users SET email = ? WHERE id = ?", (v, &user_id))?;
    }
    if let Some(v) = &phone {
        tx.execute("UPDATE users SET phone = ? WHERE id = ?", (v, &user_id))?;
    }
    if let Some(v) = &birth_date {
        tx.execute("UPDATE users SET birth_date = ? WHERE id = ?", (v, &user_id))?;
    }
    if let Some(v) = &address {
        tx.execute("UPDATE users SET address = ? WHERE id = ?", (v, &user_id))?;
    }
    if let Some(v) = is_active {
        tx.execute(
            "UPDATE users SET is_active = ? WHERE id = ?",
            (i64::from(v), &user_id),
        )?;
    }
    if let Some(v) = &approval_status {
        tx.execute(
            "UPDATE users SET approval_status = ? WHERE id = ?",
            (v, &user_id),
        )?;
    }
    tx.commit()?;

    // Names and addresses show up in cached student views.
    let student_id: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE user_id = ?",
            [&user_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(sid) = student_id {
        state.cache.delete(&keys::student_detail(&sid));
        state.cache.delete_prefix(keys::STUDENTS_LIST_PREFIX);
        state.cache.delete_prefix(&keys::grade_overview_prefix(&sid));
        state.cache.delete_prefix(keys::GRADE_STATUS_PREFIX);
    }

    handle_get(state, &json!({ "userId": user_id }))
}

fn handle_change_password(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let user_id = f.required_label("userId");
    let current = f.required_str("currentPassword");
    let new_password = password_field(&mut f, "newPassword");
    f.finish()?;
    let (Some(user_id), Some(current), Some(new_password)) = (user_id, current, new_password)
    else {
        return Err(ServiceError::invalid_field("params", "incomplete request"));
    };

    let conn = state.conn()?;
    let stored: Option<String> = conn
        .query_row(
            "SELECT password_hash FROM users WHERE id = ?",
            [&user_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(stored) = stored else {
        return Err(ServiceError::not_found("user not found"));
    };
    if !verify_password(&current, &stored) {
        return Err(ServiceError::Unauthorized(
            "current password is incorrect".to_string(),
        ));
    }
    conn.execute(
        "UPDATE users SET password_hash = ? WHERE id = ?",
        (hash_password(&new_password), &user_id),
    )?;
    Ok(json!({ "message": "Password changed successfully" }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "users.register" => handle_register(state, &req.params),
        "users.get" => handle_get(state, &req.params),
        "users.update" => handle_update(state, &req.params),
        "users.changePassword" => handle_change_password(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hashes_are_salted_and_verifiable() {
        let a = hash_password("pass1234");
        let b = hash_password("pass1234");
        assert_ne!(a, b);
        assert!(a.starts_with("sha256$"));
        assert!(verify_password("pass1234", &a));
        assert!(verify_password("pass1234", &b));
        assert!(!verify_password("pass12345", &a));
        assert!(!verify_password("pass1234", "plaintext"));
    }

    #[test]
    fn stored_hash_is_tagged_salted_digest() {
        let stored = hash_password("pass1234");
        let parts: Vec<&str> = stored.split('$').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "sha256");
        assert_eq!(parts[1].len(), 32);
        assert_eq!(parts[2], digest(parts[1], "pass1234"));
        assert_eq!(parts[2].len(), 64);

        let tampered = format!("sha256${}${}", parts[1], "0".repeat(64));
        assert!(!verify_password("pass1234", &tampered));
        let other_scheme = stored.replacen("sha256", "argon2", 1);
        assert!(!verify_password("pass1234", &other_scheme));
    }

    #[test]
    fn student_registration_requires_profile_fields() {
        let params = json!({
            "username": "kim",
            "password": "short",
            "role": "student",
            "name": "Kim",
            "phone": "010-0000-0000",
            "birthDate": "2009/03/01",
            "profile": { "number": 0 },
        });
        let err = parse_registration(&params).err().expect("invalid");
        let details = err.details().expect("details");
        let fields: Vec<&str> = details["errors"]
            .as_array()
            .expect("errors")
            .iter()
            .filter_map(|e| e["field"].as_str())
            .collect();
        assert_eq!(
            fields,
            vec![
                "password",
                "birthDate",
                "profile.studentNo",
                "profile.number"
            ]
        );
    }

    #[test]
    fn parent_children_relations_are_checked() {
        let params = json!({
            "username": "lee",
            "password": "pass1234",
            "role": "parent",
            "name": "Lee",
            "phone": "010",
            "profile": { "children": [{ "studentId": "s1", "relation": "uncle" }] },
        });
        let err = parse_registration(&params).err().expect("invalid");
        assert_eq!(
            err.details().expect("details")["errors"][0]["field"],
            "profile.children[0].relation"
        );
    }
}
