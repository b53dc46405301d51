//! Error taxonomy for the cycle engine
//!
//! None of these may escape the engine loop: each is logged and isolated to
//! the cycle in which it occurred.

use mindcycle_llm::LlmError;
use thiserror::Error;

/// Persistence or read failure. Callers degrade to empty/null and continue.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("moment not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sigil generation or rasterization failure. The moment stays text-only.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("renderer unavailable: {0}")]
    Unavailable(String),

    #[error("sigil generation failed: {0}")]
    Generation(String),

    #[error("rasterization failed: {0}")]
    Rasterize(String),
}

/// A cognition run that produced no moment.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("unparseable response: {0}")]
    Unparseable(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("engine is shut down")]
    Closed,
}
