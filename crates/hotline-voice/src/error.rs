//! Error types for the hotline voice engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while driving a call.
///
/// Everything except `Config` is session-scoped: the turn controller degrades
/// to "stay listening" or "apologize and continue" and other calls are never
/// affected.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Transcript empty or too short")]
    EmptyTranscript,

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation timed out")]
    GenerationTimeout,

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Queue store unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Queue store corrupt: {0}")]
    QueueCorrupt(String),

    #[error("Playback rejected: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No active session for call {0}")]
    SessionNotFound(String),

    #[error("Session {0} has ended")]
    SessionEnded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    /// False only for errors that should stop the process (bad startup config).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, VoiceError::Config(_))
    }
}
