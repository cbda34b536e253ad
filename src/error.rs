use std::time::Duration;
use thiserror::Error;

/// Raised when a proxy string matches none of the accepted shapes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid proxy format: {raw}")]
pub struct ProxyFormatError {
    pub raw: String,
}

impl ProxyFormatError {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SolverError {
    /// Missing or invalid request parameter; the message is shown to the caller
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    ProxyFormat(#[from] ProxyFormatError),

    /// Page load, widget interaction or token extraction failed
    #[error("Solve failed: {0}")]
    Solve(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Browser pool initialization failed: {0}")]
    PoolInit(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SolverError {
    /// Only a failed pool start stops the process; everything else is
    /// recovered at the request, proxy, task or store level.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SolverError::PoolInit(_))
    }

}

impl From<std::io::Error> for SolverError {
    fn from(err: std::io::Error) -> Self {
        SolverError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for SolverError {
    fn from(err: serde_json::Error) -> Self {
        SolverError::Persistence(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for SolverError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        SolverError::Browser(err.to_string())
    }
}
