use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use serde::Deserialize;

use crate::cache::{Cache, MemoryCache};
use crate::config::Config;
use crate::error::ServiceError;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub cache: Box<dyn Cache>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            workspace: None,
            db: None,
            cache: Box::new(MemoryCache::new()),
            config,
        }
    }

    pub fn conn(&self) -> Result<&Connection, ServiceError> {
        self.db.as_ref().ok_or(ServiceError::NoWorkspace)
    }

    pub fn ttl(&self) -> Duration {
        self.config.cache.ttl()
    }
}
