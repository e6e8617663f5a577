use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{tool} is not available: {detail}")]
    ToolUnavailable { tool: String, detail: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("background download thread panicked")]
    BackgroundPanicked,
}

pub type Result<T> = std::result::Result<T, EngineError>;
