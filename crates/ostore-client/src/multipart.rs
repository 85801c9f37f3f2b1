//! Multipart upload of streams with unknown length
//!
//! Chunks are buffered until they outgrow the configured part size. A
//! stream that never does is sent as one ordinary PUT. Otherwise a
//! multipart session is started and every `part_size` bytes become the next
//! numbered part, uploaded concurrently with the ones before it. The session
//! ends in exactly one of two ways: a commit listing parts `1..=N`, or an
//! abort that releases the uploaded parts on the server.

use crate::client::{etag_of, precondition, OstoreClient};
use crate::transport::{Request, Transport};
use crate::types::ByteStream;
use crate::{xml, ClientError, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header;
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

/// A part the service has acknowledged
#[derive(Clone, Debug)]
struct CompletedPart {
    number: u32,
    etag: String,
}

/// Server-side multipart upload owned by one engine run
///
/// Consumed by value by either commit or abort, so it cannot be finished twice.
#[derive(Debug)]
struct UploadSession {
    upload_id: String,
    key: String,
    parts: Vec<CompletedPart>,
}

impl UploadSession {
    fn new(upload_id: String, key: String) -> Self {
        Self {
            upload_id,
            key,
            parts: Vec::new(),
        }
    }

    /// Manifest for the commit call; refuses anything but parts `1..=expected`
    fn manifest(&mut self, expected: u32) -> Result<String> {
        self.parts.sort_by_key(|p| p.number);
        let complete = self.parts.len() == expected as usize
            && self
                .parts
                .iter()
                .zip(1u32..)
                .all(|(part, number)| part.number == number);
        if expected == 0 || !complete {
            return Err(ClientError::Protocol(format!(
                "upload {} has {} of {} parts",
                self.upload_id,
                self.parts.len(),
                expected
            )));
        }
        Ok(xml::complete_manifest(
            self.parts.iter().map(|p| (p.number, p.etag.as_str())),
        ))
    }
}

/// Part uploads in flight for an active session
struct ActiveUpload {
    session: UploadSession,
    next_part: u32,
    in_flight: JoinSet<Result<CompletedPart>>,
    permits: Arc<Semaphore>,
    transport: Transport,
    url: Url,
    cancel: CancellationToken,
}

impl ActiveUpload {
    /// Number of parts handed out so far
    fn dispatched(&self) -> u32 {
        self.next_part - 1
    }

    /// Upload `data` as the next part without waiting for it to finish
    async fn dispatch(&mut self, data: Bytes) -> Result<()> {
        self.reap()?;
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ClientError::Aborted),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ClientError::Aborted)?
            }
        };
        self.reap()?;

        let number = self.next_part;
        self.next_part += 1;
        debug!("dispatching part {} ({} bytes)", number, data.len());

        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("partNumber", &number.to_string())
            .append_pair("uploadId", &self.session.upload_id);
        let transport = self.transport.clone();
        let cancel = self.cancel.clone();

        self.in_flight.spawn(async move {
            let _permit = permit;
            let result = upload_part(&transport, url, number, data, &cancel).await;
            if result.is_err() {
                // stop sibling parts and further dispatches
                cancel.cancel();
            }
            result
        });
        Ok(())
    }

    /// Collect parts that already finished, surfacing the first failure
    fn reap(&mut self) -> Result<()> {
        while let Some(joined) = self.in_flight.try_join_next() {
            let part = joined??;
            self.session.parts.push(part);
        }
        if self.cancel.is_cancelled() {
            return Err(ClientError::Aborted);
        }
        Ok(())
    }

    /// Wait for every part still in flight
    ///
    /// A real failure takes precedence over the cancellations it caused.
    async fn drain(&mut self, mut error: Option<ClientError>) -> Option<ClientError> {
        while let Some(joined) = self.in_flight.join_next().await {
            let failure = match joined {
                Ok(Ok(part)) => {
                    self.session.parts.push(part);
                    continue;
                }
                Ok(Err(err)) => err,
                Err(err) => err.into(),
            };
            error = Some(match error {
                Some(current) if !current.is_aborted() || failure.is_aborted() => current,
                _ => failure,
            });
        }
        error
    }
}

async fn upload_part(
    transport: &Transport,
    url: Url,
    number: u32,
    data: Bytes,
    cancel: &CancellationToken,
) -> Result<CompletedPart> {
    let response = transport
        .fetch(Request::new(Method::PUT, url).body(data), cancel)
        .await?;
    let etag = etag_of(&response)
        .ok_or_else(|| ClientError::Protocol(format!("part {} response has no ETag", number)))?;
    Ok(CompletedPart { number, etag })
}

/// One streamed upload; single use
pub(crate) struct MultipartUpload<'a> {
    client: &'a OstoreClient,
    key: String,
    content_type: String,
    expected_etag: Option<String>,
    url: Url,
    cancel: CancellationToken,
}

impl<'a> MultipartUpload<'a> {
    pub(crate) fn new(
        client: &'a OstoreClient,
        key: &str,
        content_type: String,
        expected_etag: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            key: key.to_string(),
            content_type,
            expected_etag,
            url: client.transport().object_url(key)?,
            cancel: client.transport().cancellation().child_token(),
        })
    }

    /// Consume the stream and return the ETag of the stored object
    #[instrument(skip(self, input), fields(key = %self.key))]
    pub(crate) async fn run(self, mut input: ByteStream) -> Result<String> {
        let part_size = self.client.config().part_size;
        let mut buffer = BytesMut::new();
        let mut active: Option<ActiveUpload> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Some(Err(ClientError::Aborted)),
                chunk = input.next() => chunk,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return self.fail(active, err).await,
            };
            buffer.extend_from_slice(&chunk);

            while buffer.len() > part_size {
                if active.is_none() {
                    let session = self.start().await?;
                    active = Some(self.activate(session));
                }
                let part = buffer.split_to(part_size).freeze();
                let dispatched = match active.as_mut() {
                    Some(upload) => upload.dispatch(part).await,
                    None => Ok(()),
                };
                if let Err(err) = dispatched {
                    return self.fail(active, err).await;
                }
            }
        }

        let Some(mut upload) = active else {
            debug!("stream fit in a single request ({} bytes)", buffer.len());
            return self
                .client
                .put_bytes(
                    &self.key,
                    buffer.freeze(),
                    &self.content_type,
                    self.expected_etag.as_deref(),
                    &self.cancel,
                )
                .await;
        };

        if !buffer.is_empty() {
            if let Err(err) = upload.dispatch(buffer.freeze()).await {
                return self.fail(Some(upload), err).await;
            }
        }
        if let Some(err) = upload.drain(None).await {
            return self.abort(upload.session, err).await;
        }

        let expected = upload.dispatched();
        self.complete(upload.session, expected).await
    }

    fn activate(&self, session: UploadSession) -> ActiveUpload {
        let config = self.client.config();
        ActiveUpload {
            session,
            next_part: 1,
            in_flight: JoinSet::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_parts)),
            transport: self.client.transport().clone(),
            url: self.url.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn upload_url(&self, upload_id: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("uploadId", upload_id);
        url
    }

    async fn start(&self) -> Result<UploadSession> {
        let mut url = self.url.clone();
        url.set_query(Some("uploads"));
        let request =
            Request::new(Method::POST, url).header(header::CONTENT_TYPE, &self.content_type)?;

        let response = self.client.transport().fetch(request, &self.cancel).await?;
        let upload_id = xml::parse_upload_id(&response.text()?)?;
        debug!("started multipart upload {} for {}", upload_id, self.key);
        Ok(UploadSession::new(upload_id, self.key.clone()))
    }

    async fn complete(&self, mut session: UploadSession, expected: u32) -> Result<String> {
        let committed = match session.manifest(expected) {
            Ok(manifest) => self.commit(&session, manifest).await,
            Err(err) => Err(err),
        };

        match committed {
            Ok(etag) => {
                debug!(
                    "committed upload {} with {} parts",
                    session.upload_id,
                    session.parts.len()
                );
                Ok(etag)
            }
            Err(err) => self
                .abort(session, err)
                .await
                .or_else(|err| self.client.resolve_conflict(err, self.expected_etag.as_deref())),
        }
    }

    async fn commit(&self, session: &UploadSession, manifest: String) -> Result<String> {
        let request = Request::new(Method::POST, self.upload_url(&session.upload_id))
            .header(header::CONTENT_TYPE, "application/xml")?
            .body(Bytes::from(manifest));
        let request = precondition(request, self.expected_etag.as_deref())?;

        let response = self.client.transport().fetch(request, &self.cancel).await?;
        let text = response.text()?;
        // a commit can fail after the service has already answered 200
        if xml::is_error_document(&text) {
            return Err(ClientError::transport(response.status, text));
        }
        xml::parse_etag(&text, "CompleteMultipartUploadResult")
    }

    /// Stop in-flight parts, then abort the session if one was started
    async fn fail(&self, active: Option<ActiveUpload>, err: ClientError) -> Result<String> {
        let Some(mut upload) = active else {
            return Err(err);
        };
        self.cancel.cancel();
        let err = upload.drain(Some(err)).await.unwrap_or(ClientError::Aborted);
        self.abort(upload.session, err).await
    }

    /// Release the session's parts and return the error that caused it
    async fn abort(&self, session: UploadSession, err: ClientError) -> Result<String> {
        warn!(
            "aborting multipart upload {} for {}: {}",
            session.upload_id, session.key, err
        );
        let request = Request::new(Method::DELETE, self.upload_url(&session.upload_id));

        // cleanup runs with its own token so it still happens after cancellation
        match self
            .client
            .transport()
            .fetch(request, &CancellationToken::new())
            .await
        {
            Ok(_) => Err(err),
            Err(abort) => {
                warn!("abort of upload {} failed: {}", session.upload_id, abort);
                Err(ClientError::AggregateUpload {
                    source: Box::new(err),
                    abort: Box::new(abort),
                })
            }
        }
    }
}
