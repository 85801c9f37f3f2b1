//! XML response and request documents

use crate::types::{unquote_etag, ListEntry, ObjectSummary};
use crate::{ClientError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt::Write;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListContents>,
    #[serde(default)]
    common_prefixes: Vec<CommonPrefix>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListContents {
    key: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "ETag")]
    etag: Option<String>,
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommonPrefix {
    prefix: String,
}

/// One decoded listing page
#[derive(Debug)]
pub(crate) struct ListPage {
    pub entries: Vec<ListEntry>,
    pub next_token: Option<String>,
}

impl ListBucketResult {
    pub(crate) fn into_page(self) -> ListPage {
        let mut entries: Vec<ListEntry> = self
            .contents
            .into_iter()
            .map(|c| {
                ListEntry::Object(ObjectSummary {
                    name: c.key,
                    size: c.size,
                    etag: c.etag.as_deref().map(unquote_etag),
                    last_modified: c.last_modified.as_deref().and_then(parse_timestamp),
                })
            })
            .collect();
        entries.extend(
            self.common_prefixes
                .into_iter()
                .map(|p| ListEntry::Prefix(p.prefix)),
        );

        // a truncated page without a token cannot be continued
        let next_token = if self.is_truncated {
            self.next_continuation_token.filter(|t| !t.is_empty())
        } else {
            None
        };

        ListPage { entries, next_token }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EtagResult {
    #[serde(rename = "ETag")]
    etag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: Option<String>,
}

pub(crate) fn parse_list(xml: &str) -> Result<ListPage> {
    let result: ListBucketResult = quick_xml::de::from_str(xml)?;
    Ok(result.into_page())
}

/// ETag of a `CopyObjectResult` or `CompleteMultipartUploadResult`
pub(crate) fn parse_etag(xml: &str, document: &str) -> Result<String> {
    let result: EtagResult = quick_xml::de::from_str(xml)?;
    result
        .etag
        .map(|e| unquote_etag(&e))
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ClientError::Protocol(format!("{} has no ETag", document)))
}

pub(crate) fn parse_upload_id(xml: &str) -> Result<String> {
    let result: InitiateMultipartUploadResult = quick_xml::de::from_str(xml)?;
    result
        .upload_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ClientError::Protocol("InitiateMultipartUploadResult has no UploadId".to_string()))
}

/// Whether a 200 response body is actually an S3 `<Error>` document
pub(crate) fn is_error_document(xml: &str) -> bool {
    let body = xml.trim_start();
    let body = match body.strip_prefix("<?xml") {
        Some(rest) => rest.split_once("?>").map(|(_, r)| r.trim_start()).unwrap_or(""),
        None => body,
    };
    body.starts_with("<Error>") || body.starts_with("<Error ")
}

/// `CompleteMultipartUpload` manifest for parts already in ascending order
pub(crate) fn complete_manifest<'a>(parts: impl IntoIterator<Item = (u32, &'a str)>) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for (number, etag) in parts {
        let _ = write!(
            xml,
            "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
            number,
            quick_xml::escape::escape(etag)
        );
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
