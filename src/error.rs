//! Typed errors at the remote-fetch boundary.

use thiserror::Error;

/// Why a remote fetch was abandoned. Any of these leaves the cache untouched.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The API answered but reported an error in its envelope.
    #[error("remote error (code {code}): {message}")]
    Remote { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body was not the expected JSON shape.
    #[error("undecodable response: {0}")]
    Decode(String),

    /// The client cannot issue the request (missing credentials and the like).
    #[error("configuration error: {0}")]
    Config(String),
}
