use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Terminal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by a chat turn.
///
/// Every variant is rendered into the transcript by the orchestrator, so the
/// `Display` text is what the user sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// No credential configured. Raised before any network attempt.
    #[error("{0}")]
    Configuration(String),

    /// The remote service rejected the credential. Never retried.
    #[error("The provided API key is invalid. Please check your configuration.")]
    InvalidCredential,

    #[error("Failed to communicate with the AI model: {0}")]
    Communication(String),

    /// Downloading a video from a URL failed
    #[error("Error fetching video from URL: {0}")]
    Fetch(String),

    #[error("Failed to read video data: {0}")]
    Encoding(String),

    #[error("{0}")]
    Validation(String),

    #[error("A response is still being generated. Please wait for it to finish.")]
    Busy,
}

impl ChatError {
    /// Rejections that happen before a turn is started and leave the
    /// transcript untouched.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ChatError::Validation(_) | ChatError::Busy)
    }
}

/// Credential lookup errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("API key not found. Set GEMINI_API_KEY (or API_KEY) in the environment or a .env file.")]
    Missing,

    #[error("API key is empty. Set GEMINI_API_KEY (or API_KEY) to a valid key.")]
    Empty,

    #[error("Access token not found. Set GOOGLE_ACCESS_TOKEN, e.g. from `gcloud auth print-access-token`.")]
    MissingAccessToken,
}

impl From<CredentialError> for ChatError {
    fn from(err: CredentialError) -> Self {
        ChatError::Configuration(err.to_string())
    }
}

/// Speech transcription errors
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("{0}")]
    Configuration(String),

    /// The video was rejected before any request was made
    #[error(transparent)]
    Input(#[from] ChatError),

    #[error("Video Intelligence request failed: {0}")]
    Request(String),

    #[error("Transcription failed: {0}")]
    Operation(String),

    #[error("No speech was detected in the video")]
    NoSpeech,

    #[error("Transcription did not finish within {0} seconds")]
    Timeout(u64),

    #[error("Failed to write transcript: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CredentialError> for TranscriptionError {
    fn from(err: CredentialError) -> Self {
        TranscriptionError::Configuration(err.to_string())
    }
}

/// Contract violations of the conversation store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("A turn is already in progress")]
    TurnInProgress,

    #[error("No turn is in progress")]
    NoTurnInProgress,

    #[error("Turn {0} is no longer active")]
    StaleTurn(u64),
}

impl From<ConversationError> for ChatError {
    fn from(err: ConversationError) -> Self {
        match err {
            ConversationError::TurnInProgress => ChatError::Busy,
            other => ChatError::Validation(other.to_string()),
        }
    }
}
