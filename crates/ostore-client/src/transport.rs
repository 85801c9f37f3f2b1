//! One signed HTTP exchange with the service

use crate::config::{AddressingMode, Config};
use crate::signing::{apply_body_headers, canonical_resource, Signer};
use crate::{ClientError, Result};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, Method, StatusCode};
use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// A request under construction; built fresh for every call
#[derive(Debug)]
pub(crate) struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Request {
    pub(crate) fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub(crate) fn header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|_| ClientError::InvalidInput(format!("invalid {} header: {:?}", name, value)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub(crate) fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// A successful, fully buffered response
#[derive(Debug)]
pub(crate) struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// `None` for HEAD and for empty bodies
    pub content: Option<Bytes>,
}

impl Response {
    pub(crate) fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body as UTF-8 text, empty when there was no body
    pub(crate) fn text(&self) -> Result<String> {
        match &self.content {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|_| ClientError::Protocol("response body is not UTF-8".to_string())),
            None => Ok(String::new()),
        }
    }
}

/// A live response body: sequential, single-pass and not restartable
///
/// Dropping the stream before it is drained closes the connection. When the
/// client's cancellation token fires, the next poll yields
/// [`ClientError::Aborted`] and the stream ends.
pub struct ObjectStream {
    headers: HeaderMap,
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    cancel: CancellationToken,
    done: bool,
}

impl ObjectStream {
    /// Response headers of the GET that opened this stream
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// ETag of the streamed object, without quotes
    pub fn etag(&self) -> Option<String> {
        self.headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(crate::types::unquote_etag)
    }
}

impl Stream for ObjectStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Poll::Ready(Some(Err(ClientError::Aborted)));
        }

        match ready!(self.inner.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(err)) => {
                self.done = true;
                Poll::Ready(Some(Err(err.into())))
            }
            None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStream")
            .field("headers", &self.headers)
            .field("done", &self.done)
            .finish()
    }
}

/// Signs and sends requests for one bucket
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    http: Client,
    signer: Signer,
    base_url: Url,
    bucket: String,
    addressing: AddressingMode,
    cancellation: CancellationToken,
}

impl Transport {
    pub(crate) fn new(config: &Config) -> Result<Self> {
        let base_url = config.base_url()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|_| ClientError::Config(format!("invalid user agent: {}", config.user_agent)))?,
        );

        // a redirect is never valid for these operations, so it must surface as an error
        let http = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            http,
            signer: Signer::new(config.credentials.clone()),
            base_url,
            bucket: config.bucket.clone(),
            addressing: config.addressing,
            cancellation: config.cancellation.clone().unwrap_or_default(),
        })
    }

    /// The client-wide cancellation token
    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub(crate) fn bucket(&self) -> &str {
        &self.bucket
    }

    /// URL of the bucket itself
    pub(crate) fn bucket_url(&self) -> Url {
        self.base_url.clone()
    }

    /// Percent-encode each segment of a key, keeping the slashes
    ///
    /// `.` and `..` segments are rejected: URL normalization would resolve
    /// them and address a different key, or a different bucket.
    pub(crate) fn encode_key(&self, key: &str) -> Result<String> {
        let mut encoded = Vec::new();
        for segment in key.split('/') {
            if segment == "." || segment == ".." {
                return Err(ClientError::InvalidInput(format!(
                    "key {:?} contains a relative path segment",
                    key
                )));
            }
            encoded.push(urlencoding::encode(segment).into_owned());
        }
        Ok(encoded.join("/"))
    }

    /// URL of an object
    pub(crate) fn object_url(&self, key: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.set_path(&format!("{}{}", self.base_url.path(), self.encode_key(key)?));
        Ok(url)
    }

    /// Send one request and buffer the body
    pub(crate) async fn fetch(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        let is_head = request.method == Method::HEAD;
        let response = self.send(request, cancel).await?;
        let status = response.status();
        let headers = response.headers().clone();

        let content = if is_head {
            None
        } else {
            let bytes = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Aborted),
                bytes = response.bytes() => bytes?,
            };
            (!bytes.is_empty()).then_some(bytes)
        };

        Ok(Response {
            status,
            headers,
            content,
        })
    }

    /// Send one request and hand back the body as a live stream
    pub(crate) async fn open(&self, request: Request, cancel: &CancellationToken) -> Result<ObjectStream> {
        let response = self.send(request, cancel).await?;
        Ok(ObjectStream {
            headers: response.headers().clone(),
            inner: response.bytes_stream().boxed(),
            cancel: cancel.clone(),
            done: false,
        })
    }

    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<reqwest::Response> {
        if cancel.is_cancelled() {
            return Err(ClientError::Aborted);
        }

        let Request {
            method,
            url,
            mut headers,
            body,
        } = request;

        if let Some(body) = &body {
            apply_body_headers(&mut headers, body);
        }
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(date) = HeaderValue::from_str(&date) {
            headers.insert(header::DATE, date);
        }
        let resource = canonical_resource(&url, &self.bucket, self.addressing);
        self.signer.sign(&method, &mut headers, &resource);

        debug!("Sending {} request to {}", method, url);
        let mut builder = self.http.request(method.clone(), url.clone()).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Aborted),
            response = builder.send() => response?,
        };

        let status = response.status();
        debug!("{} {} returned {}", method, url, status);
        if !status.is_success() {
            let text = tokio::select! {
                biased;
                _ = cancel.cancelled() => String::new(),
                text = response.text() => text.unwrap_or_default(),
            };
            return Err(ClientError::transport(status, text));
        }

        Ok(response)
    }
}
