mod cache;
mod calc;
mod config;
mod db;
mod error;
mod grades;
mod ipc;
mod store;

use std::io::{self, BufRead, Write};

use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "SCHOOLD_LOG_FILTER";

/// Stdout carries the protocol, so logs go to stderr.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}

fn main() {
    let config = match config::Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("schoold: {e}");
            std::process::exit(2);
        }
    };
    init_tracing(&config.log.level);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        cache_ttl_secs = config.cache.ttl_secs,
        "schoold starting"
    );

    let startup_workspace = config.workspace.clone();
    let mut state = ipc::AppState::new(config);
    if let Some(path) = startup_workspace {
        if let Err(e) = ipc::open_workspace(&mut state, path.clone()) {
            tracing::error!(workspace = %path.display(), error = %format!("{e:#}"), "failed to open configured workspace");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                ipc::err("", "bad_json", e.to_string(), None)
            }
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed, shutting down");
}
