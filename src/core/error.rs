//! Error taxonomy for the chat client.
//!
//! Configuration and authentication errors are reported to the user
//! synchronously. Stream errors never show up here, they are recorded
//! on the affected message instead (see `MessageStatus::Failed`).
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing OpenAI API key, run `gptchat settings --api-key <KEY>`")]
    MissingApiKey,

    #[error("missing OpenAI organization, run `gptchat settings --org <ORG>`")]
    MissingOrganization,

    #[error("unknown model tier `{0}`, expected `3.5` or `4`")]
    UnknownModelTier(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The provider refused the request. Holds the provider's own
    /// message so it can be shown verbatim.
    #[error("{0}")]
    Rejected(String),

    #[error("identity provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected identity provider response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("still waiting for the previous response")]
    AwaitingResponse,

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}
