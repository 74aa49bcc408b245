//! Error types for the voice pipeline.

use crate::pipeline::state::SessionState;
use crate::stage::Stage;
use std::time::Duration;

/// Top-level error type for voice sessions and their stages.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A stage component failed to load. Fatal for the session; aborts `connect`.
    #[error("{stage} failed to initialize: {message}")]
    ComponentInitialization { stage: Stage, message: String },

    /// A command was issued in a state that forbids it. Nothing changed.
    #[error("cannot {command} while session is {state}")]
    InvalidState {
        command: &'static str,
        state: SessionState,
    },

    /// An audio frame did not match the negotiated format and was dropped.
    #[error("invalid audio format: {0}")]
    InvalidAudioFormat(String),

    /// A stage exceeded its per-invocation timeout and was cancelled.
    #[error("{stage} timed out after {}ms", .timeout.as_millis())]
    StageTimeout { stage: Stage, timeout: Duration },

    /// The inference runtime behind a stage failed mid-operation.
    #[error("{stage} runtime error: {message}")]
    StageRuntime { stage: Stage, message: String },

    /// The session outlived `max_session_duration_ms` and was disconnected.
    #[error("session exceeded its {}ms duration budget", .limit.as_millis())]
    SessionExpired { limit: Duration },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::StageRuntime`] error.
    pub fn runtime(stage: Stage, message: impl Into<String>) -> Self {
        Self::StageRuntime {
            stage,
            message: message.into(),
        }
    }

    /// Shorthand for a [`PipelineError::ComponentInitialization`] error.
    pub fn initialization(stage: Stage, message: impl Into<String>) -> Self {
        Self::ComponentInitialization {
            stage,
            message: message.into(),
        }
    }

    /// Whether this error ends the session (moves it to `error` or tears it down).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ComponentInitialization { .. }
                | Self::StageRuntime { .. }
                | Self::SessionExpired { .. }
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PipelineError>;
