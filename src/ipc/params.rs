//! Request parameter extraction that collects every field problem before
//! failing, so clients get an itemized list instead of the first error.

use serde_json::Value;

use crate::error::{FieldError, ServiceError};

pub struct Fields<'a> {
    params: &'a Value,
    prefix: String,
    errors: Vec<FieldError>,
}

impl<'a> Fields<'a> {
    pub fn new(params: &'a Value) -> Self {
        Self {
            params,
            prefix: String::new(),
            errors: Vec::new(),
        }
    }

    /// Reader for one element of a nested array, e.g. `subjects[2]`.
    pub fn nested(&self, value: &'a Value, path: String) -> Fields<'a> {
        Fields {
            params: value,
            prefix: path,
            errors: Vec::new(),
        }
    }

    pub fn path(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.prefix, key)
        }
    }

    pub fn push(&mut self, key: &str, message: impl Into<String>) {
        let field = self.path(key);
        self.errors.push(FieldError::new(field, message));
    }

    pub fn absorb(&mut self, other: Fields<'_>) {
        self.errors.extend(other.errors);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(self) -> Result<(), ServiceError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::invalid(self.errors))
        }
    }

    fn raw(&self, key: &str) -> Option<&'a Value> {
        match self.params.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        }
    }

    pub fn required_str(&mut self, key: &str) -> Option<String> {
        match self.raw(key) {
            None => {
                self.push(key, "required");
                None
            }
            Some(v) => self.non_empty_str(key, v),
        }
    }

    pub fn optional_str(&mut self, key: &str) -> Option<String> {
        let v = self.raw(key)?;
        match v.as_str() {
            Some(s) => Some(s.trim().to_string()),
            None => {
                self.push(key, "must be a string");
                None
            }
        }
    }

    fn non_empty_str(&mut self, key: &str, v: &Value) -> Option<String> {
        match v.as_str().map(str::trim) {
            Some("") => {
                self.push(key, "must not be blank");
                None
            }
            Some(s) => Some(s.to_string()),
            None => {
                self.push(key, "must be a string");
                None
            }
        }
    }

    /// A label that clients send either as text (`"1"`, `"1학년"`) or as a
    /// bare number.
    pub fn required_label(&mut self, key: &str) -> Option<String> {
        match self.raw(key) {
            None => {
                self.push(key, "required");
                None
            }
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(v) => self.non_empty_str(key, v),
        }
    }

    pub fn optional_label(&mut self, key: &str) -> Option<String> {
        match self.raw(key)? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.trim().to_string()),
            _ => {
                self.push(key, "must be a string or number");
                None
            }
        }
    }

    pub fn required_i64(&mut self, key: &str) -> Option<i64> {
        if self.raw(key).is_none() {
            self.push(key, "required");
            return None;
        }
        self.optional_i64(key)
    }

    pub fn optional_i64(&mut self, key: &str) -> Option<i64> {
        let v = self.raw(key)?;
        match v.as_i64() {
            Some(n) => Some(n),
            None => {
                self.push(key, "must be an integer");
                None
            }
        }
    }

    pub fn required_positive_i64(&mut self, key: &str) -> Option<i64> {
        let n = self.required_i64(key)?;
        if n < 1 {
            self.push(key, "must be a positive integer");
            return None;
        }
        Some(n)
    }

    pub fn optional_positive_i64(&mut self, key: &str) -> Option<i64> {
        let n = self.optional_i64(key)?;
        if n < 1 {
            self.push(key, "must be a positive integer");
            return None;
        }
        Some(n)
    }

    pub fn required_f64(&mut self, key: &str) -> Option<f64> {
        if self.raw(key).is_none() {
            self.push(key, "required");
            return None;
        }
        self.optional_f64(key)
    }

    pub fn optional_f64(&mut self, key: &str) -> Option<f64> {
        let v = self.raw(key)?;
        match v.as_f64() {
            Some(n) if n.is_finite() => Some(n),
            _ => {
                self.push(key, "must be a number");
                None
            }
        }
    }

    pub fn optional_bool(&mut self, key: &str) -> Option<bool> {
        let v = self.raw(key)?;
        match v.as_bool() {
            Some(b) => Some(b),
            None => {
                self.push(key, "must be a boolean");
                None
            }
        }
    }

    pub fn required_array(&mut self, key: &str) -> Option<&'a Vec<Value>> {
        if self.raw(key).is_none() {
            self.push(key, "required");
            return None;
        }
        self.optional_array(key)
    }

    pub fn optional_array(&mut self, key: &str) -> Option<&'a Vec<Value>> {
        let v = self.raw(key)?;
        match v.as_array() {
            Some(items) => Some(items),
            None => {
                self.push(key, "must be an array");
                None
            }
        }
    }

    pub fn optional_object(&mut self, key: &str) -> Option<&'a Value> {
        let v = self.raw(key)?;
        if v.is_object() {
            Some(v)
        } else {
            self.push(key, "must be an object");
            None
        }
    }

    pub fn required_object(&mut self, key: &str) -> Option<&'a Value> {
        if self.raw(key).is_none() {
            self.push(key, "required");
            return None;
        }
        self.optional_object(key)
    }

    /// Required string restricted to a fixed vocabulary.
    pub fn required_choice(&mut self, key: &str, allowed: &[&str]) -> Option<String> {
        let s = self.required_str(key)?;
        self.check_choice(key, s, allowed)
    }

    pub fn optional_choice(&mut self, key: &str, allowed: &[&str]) -> Option<String> {
        let s = self.optional_str(key)?;
        self.check_choice(key, s, allowed)
    }

    fn check_choice(&mut self, key: &str, s: String, allowed: &[&str]) -> Option<String> {
        if allowed.contains(&s.as_str()) {
            Some(s)
        } else {
            self.push(key, format!("must be one of: {}", allowed.join(", ")));
            None
        }
    }
}

/// Single required id parameter, the common case for get/delete methods.
pub fn required_id(params: &Value, key: &str) -> Result<String, ServiceError> {
    let mut f = Fields::new(params);
    let id = f.required_label(key);
    f.finish()?;
    id.ok_or_else(|| ServiceError::invalid_field(key, "required"))
}
