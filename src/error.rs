use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::calc::CalcError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error returned by every service operation; the router turns it into a
/// structured `{ code, message, status, details }` error response.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    /// Data or algorithm mismatch (e.g. a student's own average is missing
    /// from the cohort it belongs to).
    #[error("{0}")]
    Inconsistent(String),

    #[error("{message}")]
    Validation {
        message: String,
        errors: Vec<FieldError>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("select a workspace first")]
    NoWorkspace,

    #[error("{0:#}")]
    Store(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn invalid(errors: Vec<FieldError>) -> Self {
        Self::Validation {
            message: "required fields are missing or invalid".to_string(),
            errors,
        }
    }

    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::invalid(vec![FieldError::new(field, message)])
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Inconsistent(_) => "inconsistent_state",
            Self::Validation { .. } => "bad_params",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::NoWorkspace => "no_workspace",
            Self::Store(_) => "db_query_failed",
        }
    }

    /// HTTP-equivalent status for clients that map errors onto REST semantics.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Validation { .. } => 400,
            Self::Unauthorized(_) => 401,
            Self::Conflict(_) | Self::NoWorkspace => 409,
            Self::Inconsistent(_) | Self::Store(_) => 500,
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation { errors, .. } => Some(json!({ "errors": errors })),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.into())
    }
}

impl From<CalcError> for ServiceError {
    fn from(e: CalcError) -> Self {
        match e {
            CalcError::NoGradeData => Self::NotFound(e.to_string()),
            CalcError::EmptyCohort { .. } | CalcError::RankNotComputable => {
                Self::Inconsistent(e.to_string())
            }
        }
    }
}
