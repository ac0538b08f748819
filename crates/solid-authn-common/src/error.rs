//! Transport-level errors

/// Transport-level errors that occur during HTTP communication
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum TransportError {
    /// Failed to establish connection to server
    #[error("Connection error: {0}")]
    #[diagnostic(code(solid_authn::transport::connect))]
    Connect(String),

    /// Request timed out
    #[error("Request timeout")]
    #[diagnostic(code(solid_authn::transport::timeout))]
    Timeout,

    /// Request construction failed (malformed URI, headers, etc.)
    #[error("Invalid request: {0}")]
    #[diagnostic(
        code(solid_authn::transport::invalid_request),
        help("verify request URIs and headers are valid")
    )]
    InvalidRequest(String),

    /// Other transport error
    #[error("Transport error: {0}")]
    #[diagnostic(code(solid_authn::transport::other))]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Wrap any client error as a transport failure.
    pub fn other(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(e))
    }
}

#[cfg(feature = "reqwest-client")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_builder() || e.is_request() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Other(Box::new(e))
        }
    }
}

impl From<http::Error> for TransportError {
    fn from(e: http::Error) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}
