//! Service and plugin subsystem errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Service names become file names and meta-event keys; path
    /// separators and dots are rejected.
    #[error("invalid service name: {0:?}")]
    InvalidName(String),

    #[error("service {0:?} already exists")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0:?} already loaded")]
    AlreadyLoaded(String),

    #[error("plugin {0:?} not loaded")]
    NotLoaded(String),

    #[error("invalid plugin manifest: {0}")]
    Manifest(String),

    #[error("plugin initialization failed: {0}")]
    Init(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest parse error: {0}")]
    Json(#[from] serde_json::Error),
}
