//! Crate-level error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoomError>;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room '{code}' not found")]
    RoomNotFound { code: String },

    #[error("participant '{id}' not found")]
    ParticipantNotFound { id: String },

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("not authorized to {action}")]
    NotAuthorized { action: &'static str },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("{0} not set. Export it or pass via environment.")]
    MissingApiKey(&'static str),

    #[error("coach error: {0}")]
    Coach(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl RoomError {
    pub fn room_not_found(code: impl Into<String>) -> Self {
        Self::RoomNotFound { code: code.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }

    /// HTTP status the web layer answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RoomNotFound { .. } | Self::ParticipantNotFound { .. } | Self::NotFound(_) => 404,
            Self::NotAuthorized { .. } => 403,
            Self::InvalidMessage(_) | Self::UnsupportedMedia(_) | Self::Json(_) => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::Coach(_) | Self::Http(_) => 502,
            Self::MissingApiKey(_) => 503,
            Self::Storage(_) | Self::Io(_) | Self::Config(_) | Self::WebSocket(_) => 500,
        }
    }
}
