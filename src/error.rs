//! Error types and result aliases for the Avido SDK.
//!
//! This module defines the core error type [`AvidoError`] and the [`Result`] type alias
//! used throughout the library. Note that instrumentation itself never surfaces errors
//! into traced application code; these types cover the explicit API surface
//! (configuration, webhook validation, transport internals).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AvidoError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AvidoError>;
