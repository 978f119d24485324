/// Shared error type used across all VoiceLine crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("websocket: {0}")]
    Ws(String),

    #[error("media handshake: {0}")]
    Handshake(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("speech recognition unavailable")]
    AsrUnavailable,

    #[error("speech synthesis unavailable")]
    TtsUnavailable,

    #[error("no tenant registered for {0}")]
    UnknownNumber(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
