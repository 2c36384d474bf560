/// Result alias that carries the custom [`BeatReelError`] type.
pub type Result<T> = std::result::Result<T, BeatReelError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatReelError {
    /// The host cannot produce frequency-domain snapshots.
    #[error("spectral analysis is not supported by the audio host")]
    AudioUnsupported,
    /// The audio graph refused to wire a node. No partial wiring is left behind.
    #[error("audio graph wiring failed: {0}")]
    GraphWiring(String),
    #[error("failed to decode image `{id}`: {reason}")]
    ImageDecode { id: String, reason: String },
    /// No capture container could be negotiated with the backend.
    #[error("no supported recording container is available")]
    RecorderUnavailable,
    #[error("recorder is not currently recording")]
    RecorderNotStarted,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("encoder error: {0}")]
    Encode(String),
    /// Free-form failure, used for poisoned locks and similar plumbing faults.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl BeatReelError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn graph<T: Into<String>>(msg: T) -> Self {
        Self::GraphWiring(msg.into())
    }

    pub fn encode<T: Into<String>>(msg: T) -> Self {
        Self::Encode(msg.into())
    }
}

impl From<&str> for BeatReelError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatReelError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<realfft::FftError> for BeatReelError {
    fn from(value: realfft::FftError) -> Self {
        Self::Message(format!("fft failed: {value}"))
    }
}
