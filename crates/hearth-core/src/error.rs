//! Unified error handling for hearth.
//!
//! One error type shared by every crate in the workspace, with a variant per
//! concern. Nothing except startup wiring is treated as fatal; rule-script
//! mistakes are reported through these variants and logged, never panicked on.

/// Unified error type for hearth.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cell model errors (unknown cells, read-only writes).
    #[error("model error: {0}")]
    Model(String),

    /// Invalid rule definitions.
    #[error("invalid rule: {0}")]
    Rule(String),

    /// Timer subsystem errors.
    #[error("timer error: {0}")]
    Timer(String),

    /// Subprocess errors.
    #[error("process error: {0}")]
    Process(String),

    /// Bus publish/subscribe errors.
    #[error("bus error: {0}")]
    Bus(String),

    /// Engine lifecycle errors (calls into a stopped engine).
    #[error("engine error: {0}")]
    Engine(String),

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;
