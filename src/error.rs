use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PackError {
    #[error("invalid server base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("invalid pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("capability request failed: {0}")]
    DiscoveryHttp(String),

    #[error("capability endpoint returned status {status}: {message}")]
    DiscoveryStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to write manifest: {0}")]
    ManifestWrite(String),
}
