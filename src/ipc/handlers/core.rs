use std::path::PathBuf;

use serde_json::{json, Value};

use crate::db;
use crate::error::ServiceError;
use crate::ipc::error::{err, ok, respond};
use crate::ipc::params::Fields;
use crate::ipc::types::{AppState, Request};

fn health(state: &AppState) -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "cacheTtlSecs": state.config.cache.ttl_secs,
    })
}

/// Open (or create) the workspace database and make it current.
///
/// Cached payloads belong to the previous workspace, so the whole cache is
/// dropped on a successful switch.
pub fn open_workspace(state: &mut AppState, path: PathBuf) -> anyhow::Result<()> {
    let conn = db::open_db(&path)?;
    let dropped = state.cache.delete_prefix("");
    tracing::info!(workspace = %path.display(), dropped, "workspace opened");
    state.workspace = Some(path);
    state.db = Some(conn);
    Ok(())
}

fn workspace_path(params: &Value) -> Result<PathBuf, ServiceError> {
    let mut f = Fields::new(params);
    let path = f.required_str("path");
    f.finish()?;
    path.map(PathBuf::from)
        .ok_or_else(|| ServiceError::invalid_field("path", "required"))
}

fn select_workspace(state: &mut AppState, req: &Request) -> Value {
    let path = match workspace_path(&req.params) {
        Ok(p) => p,
        Err(e) => return respond(&req.id, Err(e)),
    };

    match open_workspace(state, path.clone()) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "health" => Some(ok(&req.id, health(state))),
        "workspace.select" => Some(select_workspace(state, req)),
        _ => None,
    }
}
