use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Hard ceiling on the configured request body size (64 KiB).
pub const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Rejection reason for a malformed endpoint definition.
///
/// These surface at the control-call boundary; the engine never accepts an
/// endpoint that fails validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The endpoint identifier is empty.
    #[error("endpoint id must not be empty")]
    MissingId,
    /// The display name is empty.
    #[error("endpoint name must not be empty")]
    MissingName,
    /// Only `http` and `https` URLs can be probed.
    #[error("unsupported URL scheme {0:?} (expected http or https)")]
    UnsupportedScheme(String),
    /// Expected status must be a valid HTTP status code.
    #[error("expected status {0} out of range (100-599)")]
    StatusOutOfRange(u16),
    /// Request timeout must be within 1-300 seconds.
    #[error("timeout {0}s out of range (1-300s)")]
    TimeoutOutOfRange(u64),
    /// Check interval must not be reduced below the configured floor.
    #[error("interval {got}s below the {floor}s floor")]
    IntervalTooShort {
        /// Requested interval in seconds.
        got: u64,
        /// Configured floor in seconds.
        floor: u64,
    },
    /// Request body exceeds [`MAX_REQUEST_BODY_BYTES`].
    #[error("request body of {0} bytes exceeds the {MAX_REQUEST_BODY_BYTES} byte cap")]
    BodyTooLarge(usize),
    /// Header name contains characters outside the HTTP token charset.
    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),
    /// Header value contains control characters.
    #[error("invalid value for header {0:?}")]
    InvalidHeaderValue(String),
}

/// HTTP method used for a probe request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET (default).
    #[default]
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// DELETE.
    Delete,
    /// PATCH.
    Patch,
    /// HEAD.
    Head,
    /// OPTIONS.
    Options,
}

impl HttpMethod {
    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_expected_status() -> u16 {
    200
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_interval_secs() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

/// A user-configured monitoring target.
///
/// The identifier is opaque to the engine and stable for the endpoint's
/// lifetime. Scheduler and workers operate on cloned snapshots; the control
/// plane is the only writer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    /// Opaque, stable identifier.
    pub id: String,
    /// Display name, used in incident titles.
    pub name: String,
    /// Probe target; `http` or `https` only.
    pub url: Url,
    /// Request method.
    #[serde(default)]
    pub method: HttpMethod,
    /// Extra request headers. Keys are case-insensitive and normalized to
    /// lowercase.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Optional request body, capped at [`MAX_REQUEST_BODY_BYTES`].
    #[serde(default)]
    pub body: Option<String>,
    /// Status code that counts as success.
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    /// Per-probe timeout in seconds (1-300).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Probe cadence in seconds; floored by the engine configuration.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Disabled endpoints stay registered but are never scheduled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
        })
}

fn valid_header_value(value: &str) -> bool {
    value.bytes().all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}

impl Endpoint {
    /// Per-probe timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Lowercase header keys and trim name/id whitespace.
    pub fn normalize(&mut self) {
        self.id = self.id.trim().to_string();
        self.name = self.name.trim().to_string();
        if self.headers.keys().any(|k| k.chars().any(|c| c.is_ascii_uppercase())) {
            self.headers = self
                .headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect();
        }
    }

    /// Check every invariant the engine relies on. `min_interval` is the
    /// engine's configured interval floor.
    pub fn validate(&self, min_interval: Duration) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingId);
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        match self.url.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
        if !(100..=599).contains(&self.expected_status) {
            return Err(ConfigError::StatusOutOfRange(self.expected_status));
        }
        if !(1..=300).contains(&self.timeout_secs) {
            return Err(ConfigError::TimeoutOutOfRange(self.timeout_secs));
        }
        let floor = min_interval.as_secs();
        if self.interval_secs < floor {
            return Err(ConfigError::IntervalTooShort {
                got: self.interval_secs,
                floor,
            });
        }
        if let Some(body) = &self.body {
            if body.len() > MAX_REQUEST_BODY_BYTES {
                return Err(ConfigError::BodyTooLarge(body.len()));
            }
        }
        for (name, value) in &self.headers {
            if !valid_header_name(name) {
                return Err(ConfigError::InvalidHeaderName(name.clone()));
            }
            if !valid_header_value(value) {
                return Err(ConfigError::InvalidHeaderValue(name.clone()));
            }
        }
        Ok(())
    }
}

/// Partial update applied to a registered endpoint.
///
/// Absent fields keep their current value. Applying a patch that changes
/// nothing is a no-op from the scheduler's perspective.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointPatch {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New probe target.
    #[serde(default)]
    pub url: Option<Url>,
    /// New request method.
    #[serde(default)]
    pub method: Option<HttpMethod>,
    /// Replacement header map.
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    /// Replacement request body.
    #[serde(default)]
    pub body: Option<String>,
    /// New expected status.
    #[serde(default)]
    pub expected_status: Option<u16>,
    /// New timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// New interval in seconds.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Enable or disable the endpoint.
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl EndpointPatch {
    /// Produce the patched endpoint. The identifier never changes.
    pub fn apply(&self, endpoint: &Endpoint) -> Endpoint {
        let mut out = endpoint.clone();
        if let Some(name) = &self.name {
            out.name = name.clone();
        }
        if let Some(url) = &self.url {
            out.url = url.clone();
        }
        if let Some(method) = self.method {
            out.method = method;
        }
        if let Some(headers) = &self.headers {
            out.headers = headers.clone();
        }
        if let Some(body) = &self.body {
            out.body = Some(body.clone());
        }
        if let Some(status) = self.expected_status {
            out.expected_status = status;
        }
        if let Some(timeout) = self.timeout_secs {
            out.timeout_secs = timeout;
        }
        if let Some(interval) = self.interval_secs {
            out.interval_secs = interval;
        }
        if let Some(enabled) = self.enabled {
            out.enabled = enabled;
        }
        out.normalize();
        out
    }
}
