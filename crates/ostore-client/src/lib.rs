//! # Ostore Client
//!
//! An async client for one bucket of an S3-compatible object store.
//!
//! ## Features
//!
//! - **Signed requests**: every request carries an `AWS` HMAC-SHA1 signature
//! - **Conditional writes**: `put`, `copy` and `del` are create-only or
//!   guarded by the expected ETag
//! - **Streaming**: downloads as chunk streams, uploads of unknown length
//!   through concurrent multipart upload
//! - **Lazy listing**: paged listings surfaced as one stream of entries
//!
//! ## Example
//!
//! ```rust,ignore
//! use ostore_client::{Config, Credentials, OstoreClient, PutOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OstoreClient::new(Config::new(
//!         "http://localhost:9000",
//!         "my-bucket",
//!         Credentials::new("access-key", "secret-key"),
//!     ))?;
//!
//!     // Create-only upload
//!     let etag = client.put("hello.txt", "Hello, World!", PutOptions::new()).await?;
//!
//!     // Replace it, but only if nobody else did first
//!     client
//!         .put("hello.txt", "Hello again", PutOptions::new().with_expected_etag(&etag))
//!         .await?;
//!
//!     if let Some(data) = client.get("hello.txt", None).await? {
//!         println!("Content: {}", String::from_utf8_lossy(&data));
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod multipart;
pub mod signing;
mod transport;
mod types;
mod xml;

pub use client::OstoreClient;
pub use config::{AddressingMode, Config, Credentials, PreconditionPolicy, MIN_PART_SIZE};
pub use error::{ClientError, Result};
pub use signing::Signer;
pub use transport::ObjectStream;
pub use types::*;
