use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bound on the stored error message, in bytes.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 1024;

/// Bound on the sanitized response body sample, in bytes.
pub const MAX_BODY_SAMPLE_BYTES: usize = 1024;

/// Probe failure taxonomy.
///
/// `None` is the only kind a successful result may carry; everything else
/// is data, never an exception.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// No error; the probe completed and matched expectations.
    #[default]
    None,
    /// Name resolution failed.
    Dns,
    /// TCP connect failed, or the transport failed in an unclassified way.
    Connect,
    /// TLS handshake or certificate failure.
    Tls,
    /// The endpoint's deadline elapsed before the response completed.
    Timeout,
    /// The response body could not be read.
    Read,
    /// The observed status differed from the expected one, or the redirect
    /// bound was exceeded.
    StatusMismatch,
    /// The response body exceeded the configured read cap.
    BodyLimit,
    /// The probe was canceled by engine shutdown.
    Canceled,
}

impl ErrorKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::Dns => "dns",
            ErrorKind::Connect => "connect",
            ErrorKind::Tls => "tls",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Read => "read",
            ErrorKind::StatusMismatch => "status-mismatch",
            ErrorKind::BodyLimit => "body-limit",
            ErrorKind::Canceled => "canceled",
        }
    }

    /// Whether this kind represents the absence of an error.
    pub fn is_none(&self) -> bool {
        matches!(self, ErrorKind::None)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single probe.
///
/// Persisted and forwarded exactly once. Invariant: `success` holds iff
/// `error_kind` is [`ErrorKind::None`] and the observed status matched the
/// endpoint's expectation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeResult {
    /// Endpoint the probe targeted.
    pub endpoint_id: String,
    /// Correlates the result with the scheduler's job emission.
    pub correlation_id: Uuid,
    /// Wall-clock observation time.
    pub checked_at: DateTime<Utc>,
    /// Observed HTTP status, absent on transport failure.
    pub status: Option<u16>,
    /// Dial-to-final-header latency, milliseconds.
    pub response_time_ms: u64,
    /// Verdict from the validator.
    pub success: bool,
    /// Failure classification.
    pub error_kind: ErrorKind,
    /// Bounded human-readable failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Sanitized UTF-8 prefix of the response body, at most
    /// [`MAX_BODY_SAMPLE_BYTES`] bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_sample: Option<String>,
}

/// Truncate `message` to [`MAX_ERROR_MESSAGE_BYTES`] on a char boundary.
pub fn bound_error_message(message: String) -> String {
    truncate_utf8(message, MAX_ERROR_MESSAGE_BYTES)
}

/// Truncate `s` to at most `max` bytes without splitting a character.
pub fn truncate_utf8(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s
}
