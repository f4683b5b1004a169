// src/error.rs
//
// Pipeline error taxonomy. Stage-local recoverable errors are absorbed by
// the stage that sees them (reconnect, fallback percentage, neutral
// inference response); only ConfigError is fatal, and only at startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Transient capture failure; the source reconnects with backoff
    #[error("capture failed: {0}")]
    Capture(String),

    /// A single frame failed to decode; analysis continues on the fallback
    /// percentage policy
    #[error("frame {sequence} failed to decode: {reason}")]
    Decode { sequence: u64, reason: String },

    /// An inference request exceeded its deadline; the caller receives a
    /// neutral fallback response instead
    #[error("inference request for frame {frame_ref} timed out after {deadline_ms}ms")]
    InferenceTimeout { frame_ref: u64, deadline_ms: u64 },

    /// The inference backend is unreachable; the pipeline continues Tier-1-only
    #[error("inference backend unavailable: {0}")]
    InferenceUnavailable(String),

    /// Invalid configuration. Fatal at startup, never raised afterwards
    #[error("invalid configuration: {0}")]
    Config(String),
}
