//! Error types for the Spaceport core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration resolution, submission, and client settings.

/// Top-level error type for the Spaceport libraries.
#[derive(Debug, thiserror::Error)]
pub enum SpaceportError {
    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while resolving an app before any submission exists.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Could not get config: {message}")]
    ConfigUnavailable { message: String },

    #[error("Could not get API info: {message}")]
    SchemaUnavailable { message: String },

    #[error("Space is unavailable (stage {stage})")]
    SpaceUnavailable { stage: String },

    #[error("Space metadata could not be loaded: {message}")]
    SpaceMetadata { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String },
}

/// Errors surfaced to callers of `submit` / `predict`.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("There is no endpoint matching '{endpoint}'")]
    UnknownEndpoint { endpoint: String },

    #[error("Connection errored out: {message}")]
    Connection { message: String },

    #[error("Server error: {message}")]
    Server { message: String },

    #[error("Queue is full: {message}")]
    QueueFull { message: String },

    #[error("Submission ended without producing output")]
    Incomplete,

    #[error("Transport error: {message}")]
    Transport { message: String },
}

/// Errors from the client configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `SpaceportError`.
pub type Result<T> = std::result::Result<T, SpaceportError>;
