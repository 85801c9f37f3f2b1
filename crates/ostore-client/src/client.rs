//! Main client implementation

use crate::{
    config::{Config, PreconditionPolicy},
    multipart::MultipartUpload,
    transport::{ObjectStream, Request, Response, Transport},
    types::*,
    xml, ClientError, Result,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderName};
use reqwest::Method;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, instrument, Instrument};

const COPY_SOURCE: HeaderName = HeaderName::from_static("x-amz-copy-source");
const LIST_DELIMITER: &str = "/";

/// Client for one bucket of an S3-compatible service
#[derive(Debug)]
pub struct OstoreClient {
    config: Config,
    transport: Transport,
}

enum ListCursor {
    Start,
    Next(String),
    Done,
}

impl OstoreClient {
    /// Create a new client with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        let transport = Transport::new(&config)?;
        Ok(Self { config, transport })
    }

    /// Create a client from `OSTORE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(Config::from_env()?)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    fn cancellation(&self) -> &CancellationToken {
        self.transport.cancellation()
    }

    // ==================== Object Operations ====================

    /// Fetch an object's metadata without its content
    #[instrument(skip(self))]
    pub async fn head(&self, key: &str) -> Result<ObjectMetadata> {
        let request = Request::new(Method::HEAD, self.transport.object_url(key)?);
        let response = self.transport.fetch(request, self.cancellation()).await?;

        let content_type = response.header_str("Content-Type").map(str::to_string);
        let size = response
            .header_str("Content-Length")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let last_modified = response
            .header_str("Last-Modified")
            .and_then(parse_http_date);

        let mut user_metadata = HashMap::new();
        for (name, value) in response.headers.iter() {
            if let Some(key) = name.as_str().strip_prefix("x-amz-meta-") {
                if let Ok(v) = value.to_str() {
                    user_metadata.insert(key.to_string(), v.to_string());
                }
            }
        }

        Ok(ObjectMetadata {
            name: key.to_string(),
            size,
            content_type,
            last_modified,
            etag: etag_of(&response).unwrap_or_default(),
            user_metadata,
        })
    }

    /// Download an object
    ///
    /// With `if_none_match` set to the ETag of a copy the caller already
    /// holds, an unchanged object yields `Ok(None)` and no content.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str, if_none_match: Option<&str>) -> Result<Option<Bytes>> {
        let request = self.get_request(key, if_none_match)?;
        match self.transport.fetch(request, self.cancellation()).await {
            Ok(response) => Ok(Some(response.content.unwrap_or_default())),
            Err(err) if err.is_not_modified() => {
                debug!("{} not modified", key);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Open an object as a stream of chunks
    ///
    /// The stream can be consumed once; drop it to release the connection
    /// early. Returns `Ok(None)` when `if_none_match` matches.
    #[instrument(skip(self))]
    pub async fn stream(&self, key: &str, if_none_match: Option<&str>) -> Result<Option<ObjectStream>> {
        let request = self.get_request(key, if_none_match)?;
        match self.transport.open(request, self.cancellation()).await {
            Ok(stream) => Ok(Some(stream)),
            Err(err) if err.is_not_modified() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Upload an object and return its new ETag
    ///
    /// Without [`PutOptions::expected_etag`] the write is create-only and
    /// fails if the key already exists; with it, the write only replaces an
    /// object carrying that ETag. Streamed bodies go through multipart
    /// upload once they outgrow [`Config::part_size`].
    #[instrument(skip(self, body, options))]
    pub async fn put(&self, key: &str, body: impl Into<Body>, options: PutOptions) -> Result<String> {
        let body = body.into();
        let content_type = options
            .content_type
            .unwrap_or_else(|| body.default_content_type().to_string());

        match body {
            Body::Stream(stream) => {
                MultipartUpload::new(self, key, content_type, options.expected_etag)?
                    .run(stream)
                    .await
            }
            body => {
                self.put_bytes(
                    key,
                    body.into_bytes()?,
                    &content_type,
                    options.expected_etag.as_deref(),
                    self.cancellation(),
                )
                .await
            }
        }
    }

    /// Delete an object, under the same preconditions as [`put`](Self::put)
    #[instrument(skip(self))]
    pub async fn del(&self, key: &str, expected_etag: Option<&str>) -> Result<()> {
        let request = precondition(
            Request::new(Method::DELETE, self.transport.object_url(key)?),
            expected_etag,
        )?;
        match self.transport.fetch(request, self.cancellation()).await {
            Ok(_) => Ok(()),
            Err(err) => self.resolve_conflict(err, expected_etag).map(|_| ()),
        }
    }

    /// Copy `source` to `target` inside the bucket and return the new ETag
    #[instrument(skip(self))]
    pub async fn copy(&self, target: &str, source: &str, expected_etag: Option<&str>) -> Result<String> {
        let copy_source = format!(
            "/{}/{}",
            self.transport.bucket(),
            self.transport.encode_key(source)?
        );
        let request = Request::new(Method::PUT, self.transport.object_url(target)?)
            .header(COPY_SOURCE, &copy_source)?;
        let request = precondition(request, expected_etag)?;

        let response = match self.transport.fetch(request, self.cancellation()).await {
            Ok(response) => response,
            Err(err) => return self.resolve_conflict(err, expected_etag),
        };
        let text = response.text()?;
        // the service may report a failed copy inside a 200 response
        if xml::is_error_document(&text) {
            return Err(ClientError::transport(response.status, text));
        }
        xml::parse_etag(&text, "CopyObjectResult")
    }

    /// List objects and folded "directories" under a prefix
    ///
    /// Pages are fetched lazily, one request per page, and every entry of a
    /// page is yielded before the next page is requested. The stream is not
    /// restartable; call `list` again to start over.
    pub fn list(&self, prefix: Option<&str>, options: ListOptions) -> BoxStream<'_, Result<ListEntry>> {
        let prefix = normalize_prefix(prefix.unwrap_or_default());
        let span = debug_span!("list", prefix = %prefix);

        stream::try_unfold(ListCursor::Start, move |cursor| {
            let prefix = prefix.clone();
            let options = options.clone();
            let span = span.clone();
            async move {
                let token = match cursor {
                    ListCursor::Done => return Ok(None),
                    ListCursor::Start => None,
                    ListCursor::Next(token) => Some(token),
                };
                let page = self.list_page(&prefix, &options, token.as_deref()).await?;
                let next = page.next_token.map_or(ListCursor::Done, ListCursor::Next);
                Ok::<_, ClientError>(Some((page.entries, next)))
            }
            .instrument(span)
        })
        .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, ClientError>)))
        .try_flatten()
        .boxed()
    }

    // ==================== Helper Methods ====================

    /// Single-request upload shared by `put` and the multipart engine
    pub(crate) async fn put_bytes(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        expected_etag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = Request::new(Method::PUT, self.transport.object_url(key)?)
            .header(header::CONTENT_TYPE, content_type)?
            .body(data);
        let request = precondition(request, expected_etag)?;

        match self.transport.fetch(request, cancel).await {
            Ok(response) => etag_of(&response)
                .ok_or_else(|| ClientError::Protocol("PUT response has no ETag".to_string())),
            Err(err) => self.resolve_conflict(err, expected_etag),
        }
    }

    /// Apply the configured policy to a failed conditional write
    pub(crate) fn resolve_conflict(&self, err: ClientError, expected_etag: Option<&str>) -> Result<String> {
        match (self.config.precondition_policy, expected_etag) {
            (PreconditionPolicy::AssumeExpected, Some(etag)) if err.is_precondition_failed() => {
                debug!("precondition failed, assuming expected ETag {}", etag);
                Ok(unquote_etag(etag))
            }
            _ => Err(err),
        }
    }

    fn get_request(&self, key: &str, if_none_match: Option<&str>) -> Result<Request> {
        let request = Request::new(Method::GET, self.transport.object_url(key)?);
        match if_none_match {
            Some(etag) => request.header(header::IF_NONE_MATCH, &quote_etag(etag)),
            None => Ok(request),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        options: &ListOptions,
        continuation_token: Option<&str>,
    ) -> Result<xml::ListPage> {
        let mut url = self.transport.bucket_url();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("list-type", "2");
            if !prefix.is_empty() {
                query.append_pair("prefix", prefix);
            }
            query.append_pair("delimiter", LIST_DELIMITER);
            if let Some(token) = continuation_token {
                query.append_pair("continuation-token", token);
            }
            if let Some(max_keys) = options.max_keys {
                query.append_pair("max-keys", &max_keys.to_string());
            }
            if let Some(start_after) = &options.start_after {
                query.append_pair("start-after", start_after);
            }
        }

        let response = self
            .transport
            .fetch(Request::new(Method::GET, url), self.cancellation())
            .await?;
        let page = xml::parse_list(&response.text()?)?;
        debug!(
            "listed {} entries under {:?}, more: {}",
            page.entries.len(),
            prefix,
            page.next_token.is_some()
        );
        Ok(page)
    }
}

/// `If-Match` for an expected ETag, otherwise create-only `If-None-Match: *`
pub(crate) fn precondition(request: Request, expected_etag: Option<&str>) -> Result<Request> {
    match expected_etag {
        Some(etag) => request.header(header::IF_MATCH, &quote_etag(etag)),
        None => request.header(header::IF_NONE_MATCH, "*"),
    }
}

pub(crate) fn etag_of(response: &Response) -> Option<String> {
    response
        .header_str("ETag")
        .map(unquote_etag)
        .filter(|e| !e.is_empty())
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
