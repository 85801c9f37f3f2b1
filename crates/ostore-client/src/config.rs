//! Client configuration

use crate::{ClientError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Smallest part the service accepts for any part but the last
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Access key pair used to sign every request
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
}

impl Credentials {
    /// Create credentials from an access key and secret key
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// The public access key
    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub(crate) fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Where the bucket name goes in request URLs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressingMode {
    /// `https://host/bucket/key`
    #[default]
    Path,
    /// `https://bucket.host/key`
    VirtualHost,
}

impl FromStr for AddressingMode {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "path" => Ok(Self::Path),
            "virtual-host" | "virtual_host" | "virtualhost" => Ok(Self::VirtualHost),
            other => Err(ClientError::Config(format!(
                "unknown addressing mode: {}",
                other
            ))),
        }
    }
}

/// What a conditional write does when the service answers 412
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PreconditionPolicy {
    /// Surface the 412 to the caller
    #[default]
    Fail,
    /// Treat the 412 as success when the caller supplied the expected ETag
    AssumeExpected,
}

/// Client configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Service endpoint; `https://` is assumed when no scheme is given
    pub endpoint: String,
    /// Bucket every operation targets
    pub bucket: String,
    /// Signing credentials
    pub credentials: Credentials,
    /// URL layout
    pub addressing: AddressingMode,
    /// External cancellation for every call made by this client
    pub cancellation: Option<CancellationToken>,
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Streamed uploads larger than this switch to multipart, in parts of this size
    pub part_size: usize,
    /// Part uploads allowed in flight at once
    pub max_concurrent_parts: usize,
    /// Handling of 412 on conditional writes
    pub precondition_policy: PreconditionPolicy,
}

impl Config {
    /// Create a new config for a bucket on the given endpoint
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            credentials,
            addressing: AddressingMode::default(),
            cancellation: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("ostore-client/{}", env!("CARGO_PKG_VERSION")),
            part_size: MIN_PART_SIZE,
            max_concurrent_parts: 4,
            precondition_policy: PreconditionPolicy::default(),
        }
    }

    /// Build a config from `OSTORE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| ClientError::Config(format!("{} is not set", name)))
        };

        let credentials = Credentials::new(var("OSTORE_ACCESS_KEY")?, var("OSTORE_SECRET_KEY")?);
        let mut config = Self::new(var("OSTORE_ENDPOINT")?, var("OSTORE_BUCKET")?, credentials);
        if let Ok(mode) = std::env::var("OSTORE_ADDRESSING") {
            config.addressing = mode.parse()?;
        }
        Ok(config)
    }

    /// Set the addressing mode
    pub fn with_addressing(mut self, addressing: AddressingMode) -> Self {
        self.addressing = addressing;
        self
    }

    /// Attach a cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the multipart threshold and part size
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    /// Set how many parts may upload concurrently
    pub fn with_max_concurrent_parts(mut self, parts: usize) -> Self {
        self.max_concurrent_parts = parts;
        self
    }

    /// Set the 412 policy for conditional writes
    pub fn with_precondition_policy(mut self, policy: PreconditionPolicy) -> Self {
        self.precondition_policy = policy;
        self
    }

    /// Check the settings and resolve the bucket's base URL
    pub(crate) fn base_url(&self) -> Result<Url> {
        if self.bucket.is_empty() {
            return Err(ClientError::Config("bucket name is empty".to_string()));
        }
        if self.part_size == 0 {
            return Err(ClientError::Config("part size must be positive".to_string()));
        }
        if self.max_concurrent_parts == 0 {
            return Err(ClientError::Config(
                "at least one concurrent part is required".to_string(),
            ));
        }

        let endpoint = if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else {
            format!("https://{}", self.endpoint)
        };
        let mut url = Url::parse(&endpoint)
            .map_err(|e| ClientError::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::Config(format!("endpoint has no host: {}", endpoint)))?
            .to_string();

        match self.addressing {
            AddressingMode::Path => url.set_path(&format!("/{}/", self.bucket)),
            AddressingMode::VirtualHost => {
                url.set_host(Some(&format!("{}.{}", self.bucket, host)))
                    .map_err(|e| ClientError::Config(format!("invalid bucket host: {}", e)))?;
                url.set_path("/");
            }
        }
        url.set_query(None);
        Ok(url)
    }
}
