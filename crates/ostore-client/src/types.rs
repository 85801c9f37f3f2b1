//! Common types for the client

use crate::{ClientError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// A lazy, single-pass sequence of byte chunks
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Content accepted by `put`
pub enum Body {
    /// Raw bytes, `application/octet-stream` unless told otherwise
    Bytes(Bytes),
    /// UTF-8 text, `text/plain` unless told otherwise
    Text(String),
    /// A JSON document, `application/json` unless told otherwise
    Json(serde_json::Value),
    /// Bytes of unknown total length, uploaded through the multipart engine
    Stream(ByteStream),
}

impl Body {
    /// Encode any serializable value as a JSON body
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Wrap a stream of chunks
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// Content type used when the caller does not set one
    pub(crate) fn default_content_type(&self) -> &'static str {
        match self {
            Self::Bytes(_) | Self::Stream(_) => crate::signing::DEFAULT_CONTENT_TYPE,
            Self::Text(_) => "text/plain",
            Self::Json(_) => "application/json",
        }
    }

    /// Materialize a non-streaming body
    pub(crate) fn into_bytes(self) -> Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Text(text) => Ok(Bytes::from(text)),
            Self::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
            Self::Stream(_) => Err(ClientError::Protocol(
                "a streamed body cannot be sent in a single request".to_string(),
            )),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            Self::Json(_) => f.write_str("Json"),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<ByteStream> for Body {
    fn from(stream: ByteStream) -> Self {
        Self::Stream(stream)
    }
}

/// Options for `put`
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Overrides the body's default content type
    pub content_type: Option<String>,
    /// Only overwrite when the current object has this ETag; when unset the
    /// write only succeeds if the object does not exist yet
    pub expected_etag: Option<String>,
}

impl PutOptions {
    /// Create empty options (create-only, default content type)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set content type
    pub fn with_content_type(mut self, ct: impl Into<String>) -> Self {
        self.content_type = Some(ct.into());
        self
    }

    /// Require the current object to carry this ETag
    pub fn with_expected_etag(mut self, etag: impl Into<String>) -> Self {
        self.expected_etag = Some(etag.into());
        self
    }
}

/// Object metadata returned by `head`
#[derive(Clone, Debug)]
pub struct ObjectMetadata {
    /// Object key
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Content type
    pub content_type: Option<String>,
    /// Last modified
    pub last_modified: Option<DateTime<Utc>>,
    /// ETag, without quotes
    pub etag: String,
    /// User-defined metadata (`x-amz-meta-*`)
    pub user_metadata: HashMap<String, String>,
}

/// An object in a listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Object key
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// ETag, without quotes
    pub etag: Option<String>,
    /// Last modified
    pub last_modified: Option<DateTime<Utc>>,
}

/// One item yielded by `list`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListEntry {
    /// An object directly under the listed prefix
    Object(ObjectSummary),
    /// A "directory" folded by the `/` delimiter
    Prefix(String),
}

impl ListEntry {
    /// Key or prefix of this entry
    pub fn name(&self) -> &str {
        match self {
            Self::Object(object) => &object.name,
            Self::Prefix(prefix) => prefix,
        }
    }

    /// The object summary, if this entry is an object
    pub fn as_object(&self) -> Option<&ObjectSummary> {
        match self {
            Self::Object(object) => Some(object),
            Self::Prefix(_) => None,
        }
    }
}

/// Options for listing objects
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Maximum keys per page
    pub max_keys: Option<usize>,
    /// Start listing after this key
    pub start_after: Option<String>,
}

/// Strip the surrounding quotes of a wire ETag
pub(crate) fn unquote_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

/// Quote an ETag for a precondition header
pub(crate) fn quote_etag(etag: &str) -> String {
    format!("\"{}\"", etag.trim_matches('"'))
}

/// Collapse repeated slashes and end a non-empty prefix with exactly one
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let segments: Vec<&str> = prefix.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        String::new()
    } else {
        format!("{}/", segments.join("/"))
    }
}
