//! Error types for wgpanel

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PanelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// External command exited unsuccessfully
    #[error("Command '{cmd}' failed{}: {stderr}", exit_code_suffix(.code))]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    /// External command did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed input
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Request conflicts with an existing server, port or forward
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No free subnet, port, address or interface name left
    #[error("Allocation exhausted: {0}")]
    Exhausted(String),

    /// Desired-state store could not be read or written
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {}", code),
        None => String::new(),
    }
}

impl PanelError {
    /// Whether retrying the same sub-step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PanelError::Timeout(_))
    }

    /// Errors the caller of a mutating operation must see synchronously.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PanelError::Validation(_) | PanelError::InvalidParameter(_) | PanelError::Exhausted(_)
        )
    }
}

impl From<serde_json::Error> for PanelError {
    fn from(error: serde_json::Error) -> Self {
        PanelError::ParseError(error.to_string())
    }
}

impl From<toml::de::Error> for PanelError {
    fn from(error: toml::de::Error) -> Self {
        PanelError::ConfigError(error.to_string())
    }
}

impl From<toml::ser::Error> for PanelError {
    fn from(error: toml::ser::Error) -> Self {
        PanelError::ConfigError(error.to_string())
    }
}

pub type PanelResult<T> = Result<T, PanelError>;
