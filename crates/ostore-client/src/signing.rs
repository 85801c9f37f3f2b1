//! Request signing
//!
//! Builds the string-to-sign for the service's `AWS {key}:{signature}`
//! scheme and signs it with HMAC-SHA1. Everything here is a pure function
//! of its inputs: the same method, headers and URL always produce the same
//! canonical string and signature.

use crate::config::{AddressingMode, Credentials};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, DATE,
};
use reqwest::Method;
use sha1::Sha1;
use std::collections::BTreeMap;
use url::Url;

type HmacSha1 = Hmac<Sha1>;

/// Query parameters that are part of the signed resource
pub const SUB_RESOURCES: &[&str] = &[
    "acl",
    "cors",
    "delete",
    "lifecycle",
    "location",
    "logging",
    "notification",
    "partNumber",
    "policy",
    "requestPayment",
    "response-cache-control",
    "response-content-disposition",
    "response-content-encoding",
    "response-content-language",
    "response-content-type",
    "response-expires",
    "restore",
    "tagging",
    "torrent",
    "uploadId",
    "uploads",
    "versionId",
    "versioning",
    "versions",
    "website",
];

/// Content type used for bodies that do not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const AMZ_PREFIX: &str = "x-amz-";
const AMZ_DATE: &str = "x-amz-date";
const CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

/// Add `Content-Length`, `Content-MD5` and a default `Content-Type` for a body
pub fn apply_body_headers(headers: &mut HeaderMap, body: &[u8]) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    // base64 output is always a valid header value
    if let Ok(md5) = HeaderValue::from_str(&BASE64.encode(Md5::digest(body))) {
        headers.insert(CONTENT_MD5, md5);
    }
    headers
        .entry(CONTENT_TYPE)
        .or_insert(HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
}

/// The signed resource: bucket, path and whitelisted sub-resources
pub fn canonical_resource(url: &Url, bucket: &str, addressing: AddressingMode) -> String {
    let mut resource = match addressing {
        // the bucket lives in the host name, so it is not part of the path
        AddressingMode::VirtualHost => format!("/{}{}", bucket, url.path()),
        AddressingMode::Path => url.path().to_string(),
    };

    let mut sub_resources: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| SUB_RESOURCES.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if !sub_resources.is_empty() {
        sub_resources.sort_by(|a, b| a.0.cmp(&b.0));
        let query: Vec<String> = sub_resources
            .into_iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key
                } else {
                    format!("{}={}", key, value)
                }
            })
            .collect();
        resource.push('?');
        resource.push_str(&query.join("&"));
    }

    resource
}

/// Sorted `name:value` lines for every `x-amz-*` header except `x-amz-date`
pub fn canonical_amz_headers(headers: &HeaderMap) -> Vec<String> {
    let mut amz_headers: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if !name.starts_with(AMZ_PREFIX) || name == AMZ_DATE {
            continue;
        }
        if let Ok(value) = value.to_str() {
            amz_headers
                .entry(name)
                .or_default()
                .push(value.trim().to_string());
        }
    }

    amz_headers
        .into_iter()
        .map(|(name, values)| format!("{}:{}", name, values.join(",")))
        .collect()
}

/// Build the exact string the service hashes to check a request
pub fn string_to_sign(method: &Method, headers: &HeaderMap, resource: &str) -> String {
    let header = |name: &HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    let mut lines = vec![
        method.as_str().to_string(),
        header(&CONTENT_MD5),
        header(&CONTENT_TYPE),
        header(&DATE),
    ];
    lines.extend(canonical_amz_headers(headers));
    lines.push(resource.to_string());
    lines.join("\n")
}

/// Signs canonical strings with a credential pair
#[derive(Clone, Debug)]
pub struct Signer {
    credentials: Credentials,
}

impl Signer {
    /// Create a signer for the given credentials
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Base64 HMAC-SHA1 of the string to sign
    pub fn signature(&self, string_to_sign: &str) -> String {
        let mut mac = HmacSha1::new_from_slice(self.credentials.secret_key().as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(string_to_sign.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// The `Authorization` header value for a string to sign
    pub fn authorization(&self, string_to_sign: &str) -> String {
        format!(
            "AWS {}:{}",
            self.credentials.access_key(),
            self.signature(string_to_sign)
        )
    }

    /// Sign a prepared request in place
    pub fn sign(&self, method: &Method, headers: &mut HeaderMap, resource: &str) {
        let string_to_sign = string_to_sign(method, headers, resource);
        if let Ok(value) = HeaderValue::from_str(&self.authorization(&string_to_sign)) {
            headers.insert(AUTHORIZATION, value);
        }
    }
}
