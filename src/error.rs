//! Crate-wide error type
//!
//! Only plumbing paths (store I/O, engine open, training internals) surface
//! `EngineError`. The advisory read paths (`predict`, `detect`,
//! `check_health`) never do: they degrade to neutral payloads instead.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("training failed: {0}")]
    Training(String),

    #[error("persistence unavailable: {0}")]
    Persistence(String),
}
