use thiserror::Error;

/// Errors returned by queue, storage, resolver and playback operations.
///
/// Every variant is an expected outcome that ends up in front of a user;
/// truly unexpected failures stay in `anyhow` at the command boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MusicError {
    /// Bad user input (name too long, index out of range, empty query...).
    #[error("{0}")]
    Validation(String),

    /// The external lookup failed or returned nothing.
    #[error("Could not resolve track: {0}")]
    Resolution(String),

    /// ffmpeg failed to start or the stream is dead.
    #[error("Stream failure: {0}")]
    StreamFailure(String),

    /// Reading or writing a guild document failed.
    #[error("Storage error: {0}")]
    Persistence(String),

    /// Another operation holds the playback, queue or playlist lock.
    #[error("{0} is locked, please wait")]
    LockContention(String),

    /// Voice or file operations are frozen (shutdown in progress).
    #[error("{0} operations are frozen")]
    Frozen(&'static str),

    /// No voice session for this guild.
    #[error("Not connected to a voice channel")]
    NotConnected,
}

pub type MusicResult<T> = Result<T, MusicError>;

impl MusicError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::StreamFailure(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn locked(what: impl Into<String>) -> Self {
        Self::LockContention(what.into())
    }

    /// Text shown to the user in reply to a failed command.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("❌ {msg}"),
            Self::Resolution(msg) => format!("❌ Could not find that track: {msg}"),
            Self::StreamFailure(_) => "❌ The stream could not be played, try again later".to_string(),
            // Details stay in the logs
            Self::Persistence(_) => "❌ An error occurred while accessing saved data".to_string(),
            Self::LockContention(what) => format!("⏳ {what} is locked, please wait"),
            Self::Frozen(_) => "⏳ The bot is shutting down, please try again later".to_string(),
            Self::NotConnected => "❌ I'm not connected to a voice channel".to_string(),
        }
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockContention(_) | Self::Frozen(_))
    }
}
