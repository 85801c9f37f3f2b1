//! Client error types

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// The service answered with a non-2xx status (redirects included)
    #[error("HTTP {} {status_text}", status.as_u16())]
    Transport {
        status: StatusCode,
        status_text: String,
        body: Option<String>,
    },

    /// The request could not be sent or the response could not be read
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response was well-formed HTTP but lacked something we need
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// XML parsing error
    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The cancellation token fired
    #[error("Operation aborted")]
    Aborted,

    /// A spawned part upload panicked or was torn down
    #[error("Part upload task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A multipart upload failed and so did the cleanup that followed
    #[error("Upload failed ({source}) and abort failed ({abort})")]
    AggregateUpload {
        source: Box<ClientError>,
        abort: Box<ClientError>,
    },

    /// A key, ETag or content type that cannot be put on the wire
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl ClientError {
    /// Build a transport error from a status and the raw response body
    pub(crate) fn transport(status: StatusCode, body: String) -> Self {
        Self::Transport {
            status,
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            body: (!body.is_empty()).then_some(body),
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Transport { status, .. } => Some(*status),
            Self::Http(err) => err.status(),
            _ => None,
        }
    }

    /// The `<Code>` element of an S3 XML error body
    pub fn error_code(&self) -> Option<String> {
        self.error_body().and_then(|b| b.code)
    }

    /// The `<Message>` element of an S3 XML error body
    pub fn error_message(&self) -> Option<String> {
        self.error_body().and_then(|b| b.message)
    }

    fn error_body(&self) -> Option<ErrorBody> {
        match self {
            Self::Transport { body: Some(body), .. } => quick_xml::de::from_str(body).ok(),
            _ => None,
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// Check if a conditional write was rejected
    pub fn is_precondition_failed(&self) -> bool {
        self.status() == Some(StatusCode::PRECONDITION_FAILED)
    }

    /// Check if a conditional read found the object unchanged
    pub fn is_not_modified(&self) -> bool {
        self.status() == Some(StatusCode::NOT_MODIFIED)
    }

    /// Check if this error came from cancellation
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
