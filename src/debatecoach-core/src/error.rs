//! Error types for the debate session core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DebateError {
    #[error("Microphone unavailable: {0}")]
    MediaAccess(String),

    #[error("Failed to get ephemeral token: {0}")]
    CredentialFetch(String),

    #[error("Session description exchange failed: {0}")]
    SignalingError(String),

    #[error("Error executing function {name}: {message}")]
    ToolInvocation { name: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Control channel is not open")]
    ChannelNotOpen,

    #[error("Refusing to send an empty message")]
    EmptyMessage,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Analysis error: {0}")]
    AnalysisError(String),

    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] async_openai::error::OpenAIError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
