use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlError(String),
    #[error("Value out of range: {0}")]
    NotInRange(String),
    #[error("Invalid URL pattern: {0}")]
    BadUrlPattern(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage write failed: {0}")]
    WriteFailed(String),
    #[error("Storage read failed: {0}")]
    ReadFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("Compression worker failed to initialize: {0}")]
    InitFailed(String),
    #[error("Compression worker channel closed")]
    ChannelClosed,
    #[error("Compression worker rejected `{method}`: {message}")]
    Rejected { method: String, message: String },
}

#[derive(Debug, Error)]
pub enum EventBufferError {
    #[error("Event buffer exceeded its size limit: {size} > {limit} bytes")]
    SizeExceeded { size: usize, limit: usize },
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("Event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Compression error: {0}")]
    Compression(std::io::Error),
    #[error("Event buffer has been destroyed")]
    Destroyed,
}

impl EventBufferError {
    pub fn is_size_exceeded(&self) -> bool {
        matches!(self, EventBufferError::SizeExceeded { .. })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Transport IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Transport returned non-2xx status code: {0}")]
    TransportStatus(u16),
    #[error("Rate limit hit, replay disabled until {disabled_until}")]
    RateLimited { disabled_until: i64 },
    #[error("Unable to send Replay - max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("Unable to send Replay: {0}")]
    Transport(#[from] TransportError),
    #[error("Unable to build replay envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

impl SendError {
    /// Status and rate-limit failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Transport(_))
    }

    pub fn drop_reason(&self) -> &'static str {
        match self {
            SendError::RateLimited { .. } => "ratelimit_backoff",
            _ => "send_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Recorder failed to start: {0}")]
    StartFailed(String),
    #[error("Invalid recording trace line {line}: {message}")]
    InvalidTrace { line: usize, message: String },
    #[error("Recorder IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Event buffer error: {0}")]
    Buffer(#[from] EventBufferError),
    #[error("Send error: {0}")]
    Send(#[from] SendError),
    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),
    #[error("Session is too long, not sending replay ({duration_ms} ms)")]
    SessionTooLong { duration_ms: i64 },
}
