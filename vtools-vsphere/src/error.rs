//! vSphere client errors and their mapping onto transport errors.

use thiserror::Error;
use vtools_esxi::TransportError;

#[derive(Debug, Error)]
pub enum VsphereError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, VsphereError>;

impl From<VsphereError> for TransportError {
    fn from(err: VsphereError) -> Self {
        let message = err.to_string();
        match err {
            VsphereError::Client(_) => TransportError::connection(message),
            VsphereError::Http(e) if e.is_timeout() => TransportError::timeout(message),
            VsphereError::Http(e) if e.is_decode() => TransportError::protocol(message),
            VsphereError::Http(_) => TransportError::connection(message),
            VsphereError::Unauthorized(_) => TransportError::auth(message),
            VsphereError::Forbidden(_) => TransportError::rejected(403, message),
            VsphereError::NotFound(_) => TransportError::not_found(message),
            VsphereError::Api { status, .. } => TransportError::rejected(status, message),
            VsphereError::Parse(_) => TransportError::protocol(message),
        }
    }
}
