//! In-memory bucket served through wiremock
//!
//! Every request must carry a valid signature. Objects, pending multipart
//! uploads, and a log of multipart calls live behind one mutex so tests can
//! inspect what the client actually did.

#![allow(dead_code)]

use bytes::Bytes;
use futures::stream;
use md5::{Digest, Md5};
use ostore_client::signing::{canonical_resource, string_to_sign};
use ostore_client::{AddressingMode, Body, ClientError, Config, Credentials, OstoreClient, Signer};
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const BUCKET: &str = "media";
pub const ACCESS_KEY: &str = "AKIDEXAMPLE";
pub const SECRET_KEY: &str = "fake-secret-key";

const LAST_MODIFIED_HTTP: &str = "Wed, 01 Jan 2025 00:00:00 GMT";
const LAST_MODIFIED_ISO: &str = "2025-01-01T00:00:00.000Z";

pub const SLOW_PART_DELAY: Duration = Duration::from_millis(300);

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
    pub etag: String,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    content_type: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

/// Everything the fake knows, plus knobs for injecting failures
#[derive(Debug, Default)]
pub struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u32,
    /// Upload ids handed out by `POST ?uploads`
    pub started: Vec<String>,
    /// Upload ids named by `DELETE ?uploadId`
    pub aborted: Vec<String>,
    /// Part numbers listed by every `POST ?uploadId` manifest
    pub commits: Vec<(String, Vec<u32>)>,
    /// Size of every part received, in arrival order
    pub part_sizes: Vec<(u32, usize)>,
    /// Answer this part number with a 500
    pub fail_part: Option<u32>,
    /// Answer aborts with a 500
    pub fail_abort: bool,
    /// Answer commits with a 200 carrying an `<Error>` document
    pub commit_error: bool,
    /// Delay every part response
    pub part_delay: Option<Duration>,
    /// Delay only this part number, by `SLOW_PART_DELAY`
    pub delay_part: Option<u32>,
    /// Requests received, signed or not
    pub requests: usize,
}

#[derive(Clone)]
pub struct FakeBucket {
    state: Arc<Mutex<State>>,
    signer: Signer,
}

impl FakeBucket {
    /// Start a server whose every request is answered by a fresh fake bucket
    pub async fn start() -> (MockServer, FakeBucket) {
        let server = MockServer::start().await;
        let fake = FakeBucket {
            state: Arc::new(Mutex::new(State::default())),
            signer: Signer::new(Credentials::new(ACCESS_KEY, SECRET_KEY)),
        };
        Mock::given(any())
            .respond_with(fake.clone())
            .mount(&server)
            .await;
        (server, fake)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.with_state(|s| s.objects.get(key).cloned())
    }

    /// Store an object directly, bypassing the client
    pub fn seed(&self, key: &str, data: &[u8], metadata: &[(&str, &str)]) -> String {
        let etag = etag_for(data);
        let object = StoredObject {
            data: data.to_vec(),
            content_type: "application/octet-stream".to_string(),
            etag: etag.clone(),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.with_state(|s| s.objects.insert(key.to_string(), object));
        etag
    }

    fn signature_matches(&self, request: &Request) -> bool {
        let resource = canonical_resource(&request.url, BUCKET, AddressingMode::Path);
        let expected = self
            .signer
            .authorization(&string_to_sign(&request.method, &request.headers, &resource));
        header(&request.headers, "authorization") == Some(expected.as_str())
    }
}

pub fn config(server: &MockServer) -> Config {
    Config::new(server.uri(), BUCKET, Credentials::new(ACCESS_KEY, SECRET_KEY))
}

pub fn client(server: &MockServer) -> OstoreClient {
    OstoreClient::new(config(server)).unwrap()
}

/// Deterministic test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A streamed body delivering `data` in chunks of `chunk` bytes
pub fn chunked(data: &[u8], chunk: usize) -> Body {
    let chunks: Vec<ostore_client::Result<Bytes>> = data
        .chunks(chunk)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Body::stream(stream::iter(chunks))
}

/// A streamed body that fails after delivering `data`
pub fn failing_after(data: &[u8], chunk: usize) -> Body {
    let mut chunks: Vec<ostore_client::Result<Bytes>> = data
        .chunks(chunk)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    chunks.push(Err(ClientError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "source went away",
    ))));
    Body::stream(stream::iter(chunks))
}

pub fn etag_for(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn unquote(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

fn error(status: u16, code: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_raw(
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Error><Code>{}</Code><Message>{} from fake bucket</Message></Error>",
            code, code
        ),
        "application/xml",
    )
}

fn xml(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "application/xml")
}

fn escape(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

/// Key addressed by a path-style URL; `None` for the bucket itself
fn object_key(url: &Url) -> Option<String> {
    let rest = url.path().strip_prefix(&format!("/{}/", BUCKET))?;
    if rest.is_empty() {
        return None;
    }
    urlencoding::decode(rest).ok().map(|k| k.into_owned())
}

/// `If-Match` must name the current ETag; `If-None-Match: *` requires absence
fn precondition_holds(headers: &HeaderMap, current: Option<&str>) -> bool {
    if let Some(expected) = header(headers, "if-match") {
        return current == Some(unquote(expected));
    }
    if header(headers, "if-none-match") == Some("*") {
        return current.is_none();
    }
    true
}

fn manifest_numbers(body: &str) -> Vec<u32> {
    body.split("<PartNumber>")
        .skip(1)
        .filter_map(|s| s.split("</PartNumber>").next())
        .filter_map(|n| n.trim().parse().ok())
        .collect()
}

impl Respond for FakeBucket {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.with_state(|s| s.requests += 1);
        if !self.signature_matches(request) {
            return error(403, "SignatureDoesNotMatch");
        }
        if let Some(md5) = header(&request.headers, "content-md5") {
            let actual = base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                Md5::digest(&request.body),
            );
            if md5 != actual {
                return error(400, "BadDigest");
            }
        }

        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let mut state = self.state.lock().unwrap();

        let Some(key) = object_key(&request.url) else {
            return match request.method {
                Method::GET if query.get("list-type").map(String::as_str) == Some("2") => {
                    list(&state, &query)
                }
                _ => error(400, "InvalidRequest"),
            };
        };

        match request.method {
            Method::HEAD => head(&state, &key),
            Method::GET => get(&state, &key, &request.headers),
            Method::PUT if query.contains_key("partNumber") => {
                upload_part(&mut state, &query, &request.body)
            }
            Method::PUT if request.headers.contains_key("x-amz-copy-source") => {
                copy(&mut state, &key, &request.headers)
            }
            Method::PUT => put(&mut state, &key, request),
            Method::DELETE if query.contains_key("uploadId") => abort(&mut state, &query),
            Method::DELETE => delete(&mut state, &key, &request.headers),
            Method::POST if query.contains_key("uploads") => initiate(&mut state, &key, request),
            Method::POST if query.contains_key("uploadId") => complete(&mut state, &key, &query, request),
            _ => error(405, "MethodNotAllowed"),
        }
    }
}

// ==================== Object handlers ====================

fn head(state: &State, key: &str) -> ResponseTemplate {
    let Some(object) = state.objects.get(key) else {
        return ResponseTemplate::new(404);
    };
    let mut response = ResponseTemplate::new(200)
        .insert_header("content-type", object.content_type.as_str())
        .insert_header("etag", format!("\"{}\"", object.etag).as_str())
        .insert_header("last-modified", LAST_MODIFIED_HTTP);
    for (name, value) in &object.metadata {
        response = response.insert_header(format!("x-amz-meta-{}", name).as_str(), value.as_str());
    }
    response
}

fn get(state: &State, key: &str, headers: &HeaderMap) -> ResponseTemplate {
    let Some(object) = state.objects.get(key) else {
        return error(404, "NoSuchKey");
    };
    if header(headers, "if-none-match").map(unquote) == Some(object.etag.as_str()) {
        return ResponseTemplate::new(304);
    }
    ResponseTemplate::new(200)
        .set_body_raw(object.data.clone(), &object.content_type)
        .insert_header("etag", format!("\"{}\"", object.etag).as_str())
}

fn put(state: &mut State, key: &str, request: &Request) -> ResponseTemplate {
    let current = state.objects.get(key).map(|o| o.etag.clone());
    if !precondition_holds(&request.headers, current.as_deref()) {
        return error(412, "PreconditionFailed");
    }
    let etag = etag_for(&request.body);
    let content_type = header(&request.headers, "content-type")
        .unwrap_or("binary/octet-stream")
        .to_string();
    state.objects.insert(
        key.to_string(),
        StoredObject {
            data: request.body.clone(),
            content_type,
            etag: etag.clone(),
            metadata: Vec::new(),
        },
    );
    ResponseTemplate::new(200).insert_header("etag", format!("\"{}\"", etag).as_str())
}

fn copy(state: &mut State, key: &str, headers: &HeaderMap) -> ResponseTemplate {
    let source = header(headers, "x-amz-copy-source")
        .and_then(|s| s.strip_prefix(&format!("/{}/", BUCKET)))
        .and_then(|s| urlencoding::decode(s).ok())
        .map(|s| s.into_owned());
    let Some(source) = source.and_then(|s| state.objects.get(&s).cloned()) else {
        return error(404, "NoSuchKey");
    };
    let current = state.objects.get(key).map(|o| o.etag.clone());
    if !precondition_holds(headers, current.as_deref()) {
        return error(412, "PreconditionFailed");
    }
    let etag = source.etag.clone();
    state.objects.insert(key.to_string(), source);
    xml(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <CopyObjectResult><LastModified>{}</LastModified><ETag>&quot;{}&quot;</ETag></CopyObjectResult>",
        LAST_MODIFIED_ISO, etag
    ))
}

fn delete(state: &mut State, key: &str, headers: &HeaderMap) -> ResponseTemplate {
    // If-None-Match has no meaning for DELETE and is ignored
    if let Some(expected) = header(headers, "if-match") {
        let current = state.objects.get(key).map(|o| o.etag.as_str());
        if current != Some(unquote(expected)) {
            return error(412, "PreconditionFailed");
        }
    }
    state.objects.remove(key);
    ResponseTemplate::new(204)
}

fn list(state: &State, query: &HashMap<String, String>) -> ResponseTemplate {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let delimiter = query.get("delimiter").cloned();
    let after = query
        .get("continuation-token")
        .or_else(|| query.get("start-after"))
        .cloned()
        .unwrap_or_default();
    let max_keys: usize = query
        .get("max-keys")
        .and_then(|m| m.parse().ok())
        .unwrap_or(1000);

    // (name, object) with `None` marking a folded prefix; sorted by name
    let mut entries: Vec<(String, Option<&StoredObject>)> = Vec::new();
    for (key, object) in state.objects.range(prefix.clone()..) {
        let Some(rest) = key.strip_prefix(&prefix) else {
            break;
        };
        let folded = delimiter
            .as_deref()
            .and_then(|d| rest.find(d).map(|i| format!("{}{}", prefix, &rest[..i + d.len()])));
        match folded {
            Some(common) => {
                if entries.last().map(|(name, _)| name != &common).unwrap_or(true) {
                    entries.push((common, None));
                }
            }
            None => entries.push((key.clone(), Some(object))),
        }
    }
    entries.retain(|(name, _)| name.as_str() > after.as_str());

    let truncated = entries.len() > max_keys;
    entries.truncate(max_keys);

    let mut body = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><ListBucketResult>");
    body.push_str(&format!(
        "<Name>{}</Name><Prefix>{}</Prefix><KeyCount>{}</KeyCount><IsTruncated>{}</IsTruncated>",
        BUCKET,
        escape(&prefix),
        entries.len(),
        truncated
    ));
    if truncated {
        if let Some((last, _)) = entries.last() {
            body.push_str(&format!(
                "<NextContinuationToken>{}</NextContinuationToken>",
                escape(last)
            ));
        }
    }
    for (name, object) in &entries {
        if let Some(object) = object {
            body.push_str(&format!(
                "<Contents><Key>{}</Key><LastModified>{}</LastModified>\
                 <ETag>&quot;{}&quot;</ETag><Size>{}</Size><StorageClass>STANDARD</StorageClass></Contents>",
                escape(name),
                LAST_MODIFIED_ISO,
                object.etag,
                object.data.len()
            ));
        }
    }
    for (name, object) in &entries {
        if object.is_none() {
            body.push_str(&format!(
                "<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>",
                escape(name)
            ));
        }
    }
    body.push_str("</ListBucketResult>");
    xml(body)
}

// ==================== Multipart handlers ====================

fn initiate(state: &mut State, key: &str, request: &Request) -> ResponseTemplate {
    state.next_upload += 1;
    let upload_id = format!("upload-{}", state.next_upload);
    let content_type = header(&request.headers, "content-type")
        .unwrap_or("binary/octet-stream")
        .to_string();
    state.uploads.insert(
        upload_id.clone(),
        PendingUpload {
            key: key.to_string(),
            content_type,
            parts: BTreeMap::new(),
        },
    );
    state.started.push(upload_id.clone());
    xml(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
        BUCKET,
        escape(key),
        upload_id
    ))
}

fn upload_part(state: &mut State, query: &HashMap<String, String>, body: &[u8]) -> ResponseTemplate {
    let number: u32 = match query.get("partNumber").and_then(|n| n.parse().ok()) {
        Some(number) => number,
        None => return error(400, "InvalidArgument"),
    };
    let delay = if state.delay_part == Some(number) {
        Some(SLOW_PART_DELAY)
    } else {
        state.part_delay
    };
    state.part_sizes.push((number, body.len()));
    if state.fail_part == Some(number) {
        return error(500, "InternalError");
    }
    let Some(upload) = query.get("uploadId").and_then(|id| state.uploads.get_mut(id)) else {
        return error(404, "NoSuchUpload");
    };
    upload.parts.insert(number, body.to_vec());

    let response =
        ResponseTemplate::new(200).insert_header("etag", format!("\"{}\"", etag_for(body)).as_str());
    match delay {
        Some(delay) => response.set_delay(delay),
        None => response,
    }
}

fn abort(state: &mut State, query: &HashMap<String, String>) -> ResponseTemplate {
    let upload_id = query.get("uploadId").cloned().unwrap_or_default();
    state.aborted.push(upload_id.clone());
    if state.fail_abort {
        return error(500, "InternalError");
    }
    match state.uploads.remove(&upload_id) {
        Some(_) => ResponseTemplate::new(204),
        None => error(404, "NoSuchUpload"),
    }
}

fn complete(
    state: &mut State,
    key: &str,
    query: &HashMap<String, String>,
    request: &Request,
) -> ResponseTemplate {
    let upload_id = query.get("uploadId").cloned().unwrap_or_default();
    let numbers = manifest_numbers(&String::from_utf8_lossy(&request.body));
    state.commits.push((upload_id.clone(), numbers.clone()));

    if state.commit_error {
        return xml(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Error><Code>InternalError</Code><Message>commit failed</Message></Error>"
                .to_string(),
        );
    }
    let current = state.objects.get(key).map(|o| o.etag.clone());
    if !precondition_holds(&request.headers, current.as_deref()) {
        return error(412, "PreconditionFailed");
    }
    let Some(upload) = state.uploads.get(&upload_id) else {
        return error(404, "NoSuchUpload");
    };
    let stored: Vec<u32> = upload.parts.keys().copied().collect();
    if numbers != stored || upload.key != key {
        return error(400, "InvalidPart");
    }

    let Some(upload) = state.uploads.remove(&upload_id) else {
        return error(404, "NoSuchUpload");
    };
    let mut data = Vec::new();
    let mut digests = Vec::new();
    for part in upload.parts.values() {
        data.extend_from_slice(part);
        digests.extend_from_slice(&Md5::digest(part));
    }
    let etag = format!("{}-{}", hex::encode(Md5::digest(&digests)), upload.parts.len());
    state.objects.insert(
        key.to_string(),
        StoredObject {
            data,
            content_type: upload.content_type,
            etag: etag.clone(),
            metadata: Vec::new(),
        },
    );
    xml(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <CompleteMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><ETag>&quot;{}&quot;</ETag></CompleteMultipartUploadResult>",
        BUCKET,
        escape(key),
        etag
    ))
}
