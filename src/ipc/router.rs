use std::time::Instant;

use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let span = tracing::info_span!("request", id = %req.id, method = %req.method);
    let _guard = span.enter();
    let started = Instant::now();

    let resp = dispatch(state, &req);
    log_outcome(&resp, started.elapsed().as_millis() as u64);
    resp
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::grades::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::accounts::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::catalog::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::attendance::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::feedbacks::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::specialnotes::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::counselings::try_handle(state, req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

fn log_outcome(resp: &serde_json::Value, elapsed_ms: u64) {
    if resp.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        tracing::info!(elapsed_ms, "request succeeded");
        return;
    }
    let error = resp.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match code {
        "inconsistent_state" | "db_query_failed" | "db_open_failed" => {
            tracing::error!(code, message, elapsed_ms, "request failed")
        }
        _ => tracing::warn!(code, message, elapsed_ms, "request rejected"),
    }
}
