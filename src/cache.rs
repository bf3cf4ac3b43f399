use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ServiceError;

/// Key-value store with per-entry expiry and prefix deletion.
///
/// Values are the JSON payloads handed back to clients, so a hit can be
/// returned verbatim without touching the store.
pub trait Cache: Send {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration);
    fn delete(&self, key: &str);
    /// Returns the number of entries removed.
    fn delete_prefix(&self, prefix: &str) -> usize;
}

#[derive(Debug)]
struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// In-process cache; expiry is fixed at insertion time (no sliding window).
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match entries.get(key) {
            None => return None,
            Some(e) => e.expires_at <= Instant::now(),
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        // Expired keys may never be read again (free-text search filters).
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }

    fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        before - entries.len()
    }
}

/// Return the cached payload for `key`, or compute, store and return it.
///
/// Only successful payloads are stored; an error is returned to the caller
/// and the next request recomputes.
pub fn get_or_compute<F>(
    cache: &dyn Cache,
    key: &str,
    ttl: Duration,
    compute: F,
) -> Result<serde_json::Value, ServiceError>
where
    F: FnOnce() -> Result<serde_json::Value, ServiceError>,
{
    if let Some(hit) = cache.get(key) {
        tracing::debug!(key, "cache hit");
        return Ok(hit);
    }
    tracing::debug!(key, "cache miss");
    let value = compute()?;
    cache.set(key, value.clone(), ttl);
    Ok(value)
}

/// Cache key layout. Every per-student family ends its prefix with `:` so
/// that invalidating student `1` never touches student `12`.
pub mod keys {
    pub const GRADE_STATUS_PREFIX: &str = "grades:management_status:";
    pub const STUDENTS_LIST_PREFIX: &str = "students:list:";

    fn or_all(v: Option<&str>) -> &str {
        match v {
            Some(s) if !s.trim().is_empty() => s.trim(),
            _ => "all",
        }
    }

    pub fn grade_overview(student_id: &str, grade: Option<&str>, semester: Option<&str>) -> String {
        format!(
            "{}grade:{}:semester:{}",
            grade_overview_prefix(student_id),
            or_all(grade),
            or_all(semester)
        )
    }

    pub fn grade_overview_prefix(student_id: &str) -> String {
        format!("grades:overview:{student_id}:")
    }

    pub fn grade_status(grade: Option<&str>, class: Option<&str>, semester: Option<&str>) -> String {
        format!(
            "{GRADE_STATUS_PREFIX}grade:{}:class:{}:semester:{}",
            or_all(grade),
            or_all(class),
            or_all(semester)
        )
    }

    pub fn students_list(grade: Option<&str>, class: Option<&str>, search: Option<&str>) -> String {
        format!(
            "{STUDENTS_LIST_PREFIX}grade:{}:class:{}:search:{}",
            or_all(grade),
            or_all(class),
            or_all(search)
        )
    }

    pub fn student_detail(student_id: &str) -> String {
        format!("students:detail:{student_id}")
    }

    pub fn attendance(student_id: &str, grade: Option<&str>, year: Option<&str>) -> String {
        format!(
            "{}{}:{}",
            attendance_prefix(student_id),
            or_all(grade),
            or_all(year)
        )
    }

    pub fn attendance_prefix(student_id: &str) -> String {
        format!("attendance:{student_id}:")
    }

    pub fn feedbacks(student_no: &str) -> String {
        format!("feedbacks:student:{student_no}")
    }

    pub fn special_notes(student_no: &str) -> String {
        format!("specialnotes:student:{student_no}")
    }
}
