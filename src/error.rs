//! Error handling module
//!
//! Typed errors for the maintenance tool. Per-statement remote rejections are
//! not errors here: they are captured as [`RemoteFailure`] data and reported,
//! so a single rejected statement never aborts a batch.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;
use crate::migration::DescriptorError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote call rejected: {0}")]
    Remote(RemoteFailure),

    #[error("Generic execute function unavailable: {0}")]
    Bootstrap(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A rejection reported by the remote store for one call.
///
/// Mirrors the PostgREST error body (`code`, `message`, `details`, `hint`);
/// transport-level failures are folded into the same shape with a
/// synthetic code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl RemoteFailure {
    pub fn new(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    /// Failure that never reached the database (connect, timeout, decode)
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(Some("TRANSPORT".to_string()), message)
    }

    /// SQLSTATE for "relation does not exist" or PostgREST's schema-cache miss
    pub fn is_missing_relation(&self) -> bool {
        matches!(self.code.as_deref(), Some("42P01") | Some("PGRST205") | Some("404"))
    }

    /// PostgREST's "function not found in schema cache"
    pub fn is_missing_function(&self) -> bool {
        matches!(self.code.as_deref(), Some("PGRST202") | Some("42883"))
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " hint: {}", hint)?;
        }
        Ok(())
    }
}

impl From<&tokio_postgres::Error> for RemoteFailure {
    fn from(e: &tokio_postgres::Error) -> Self {
        match e.as_db_error() {
            Some(db) => Self {
                code: Some(db.code().code().to_string()),
                message: db.message().to_string(),
                details: db.detail().map(str::to_string),
                hint: db.hint().map(str::to_string),
            },
            None => Self::transport(e.to_string()),
        }
    }
}
