use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use watchtower_core::endpoint::{Endpoint, HttpMethod};
use watchtower_core::result::{
    ErrorKind, MAX_BODY_SAMPLE_BYTES, bound_error_message, truncate_utf8,
};

use crate::api::EngineConfig;

/// Raw outcome of one probe, before the validator's verdict.
#[derive(Debug)]
pub(crate) struct ProbeOutcome {
    pub(crate) checked_at: DateTime<Utc>,
    pub(crate) status: Option<u16>,
    pub(crate) response_time_ms: u64,
    pub(crate) error_kind: ErrorKind,
    pub(crate) error_message: Option<String>,
    pub(crate) body_sample: Option<String>,
}

pub(crate) struct ProbeClient {
    http: reqwest::Client,
    max_body_bytes: usize,
}

impl ProbeClient {
    pub(crate) fn build(cfg: &EngineConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(cfg.max_redirects))
            .build()?;
        Ok(ProbeClient {
            http,
            max_body_bytes: cfg.max_body_bytes,
        })
    }

    /// Execute one probe against `endpoint`.
    ///
    /// The endpoint's timeout is a hard deadline over DNS, connect, TLS,
    /// write, and read. Response time covers dial to end of the final
    /// header read. Every failure comes back as a classified outcome.
    pub(crate) async fn run(&self, endpoint: &Endpoint) -> ProbeOutcome {
        let checked_at = Utc::now();
        let deadline = endpoint.timeout();
        let started = Instant::now();

        let mut request = self
            .http
            .request(request_method(endpoint.method), endpoint.url.clone())
            .timeout(deadline);
        for (name, value) in &endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &endpoint.body {
            request = request.body(body.clone());
        }

        let response = match tokio::time::timeout(deadline, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let kind = classify(&err);
                debug!(endpoint = %endpoint.id, error = %err, kind = %kind, "probe transport failure");
                return ProbeOutcome {
                    checked_at,
                    status: None,
                    response_time_ms: elapsed_ms(started),
                    error_kind: kind,
                    error_message: Some(bound_error_message(err.to_string())),
                    body_sample: None,
                };
            }
            Err(_) => {
                return ProbeOutcome {
                    checked_at,
                    status: None,
                    response_time_ms: elapsed_ms(started),
                    error_kind: ErrorKind::Timeout,
                    error_message: Some(format!("no response within {}s", endpoint.timeout_secs)),
                    body_sample: None,
                };
            }
        };

        let response_time_ms = elapsed_ms(started);
        let status = response.status().as_u16();

        let remaining = deadline.saturating_sub(started.elapsed());
        let body_sample = match tokio::time::timeout(
            remaining,
            read_capped(response, self.max_body_bytes),
        )
        .await
        {
            Ok(Ok(sample)) => sanitize_sample(&sample),
            Ok(Err(ReadFailure::TooLarge)) => {
                return ProbeOutcome {
                    checked_at,
                    status: Some(status),
                    response_time_ms,
                    error_kind: ErrorKind::BodyLimit,
                    error_message: Some(format!(
                        "response body exceeded the {} byte cap",
                        self.max_body_bytes
                    )),
                    body_sample: None,
                };
            }
            Ok(Err(ReadFailure::Transport(err))) => {
                let kind = if err.is_timeout() { ErrorKind::Timeout } else { ErrorKind::Read };
                debug!(endpoint = %endpoint.id, error = %err, "probe body read failure");
                return ProbeOutcome {
                    checked_at,
                    status: Some(status),
                    response_time_ms,
                    error_kind: kind,
                    error_message: Some(bound_error_message(err.to_string())),
                    body_sample: None,
                };
            }
            Err(_) => {
                return ProbeOutcome {
                    checked_at,
                    status: Some(status),
                    response_time_ms,
                    error_kind: ErrorKind::Timeout,
                    error_message: Some(format!("body not read within {}s", endpoint.timeout_secs)),
                    body_sample: None,
                };
            }
        };

        if status != endpoint.expected_status {
            return ProbeOutcome {
                checked_at,
                status: Some(status),
                response_time_ms,
                error_kind: ErrorKind::StatusMismatch,
                error_message: Some(format!(
                    "expected status {}, got {status}",
                    endpoint.expected_status
                )),
                body_sample,
            };
        }

        ProbeOutcome {
            checked_at,
            status: Some(status),
            response_time_ms,
            error_kind: ErrorKind::None,
            error_message: None,
            body_sample,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn request_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

enum ReadFailure {
    TooLarge,
    Transport(reqwest::Error),
}

/// Read the body up to `cap` bytes total, keeping at most
/// [`MAX_BODY_SAMPLE_BYTES`] as the sample prefix.
async fn read_capped(mut response: reqwest::Response, cap: usize) -> Result<Vec<u8>, ReadFailure> {
    let mut sample = Vec::with_capacity(MAX_BODY_SAMPLE_BYTES.min(cap));
    let mut total = 0usize;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                total = total.saturating_add(chunk.len());
                if total > cap {
                    return Err(ReadFailure::TooLarge);
                }
                if sample.len() < MAX_BODY_SAMPLE_BYTES {
                    let take = (MAX_BODY_SAMPLE_BYTES - sample.len()).min(chunk.len());
                    sample.extend_from_slice(&chunk[..take]);
                }
            }
            Ok(None) => return Ok(sample),
            Err(err) => return Err(ReadFailure::Transport(err)),
        }
    }
}

/// UTF-8 sanitize the sample prefix: lossy decode, strip control
/// characters except newline and tab, re-bound the byte length.
fn sanitize_sample(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let text: String = String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect();
    let text = truncate_utf8(text, MAX_BODY_SAMPLE_BYTES);
    if text.is_empty() { None } else { Some(text) }
}

/// Map a transport error onto the probe taxonomy. Anything unrecognized
/// counts as a connect failure.
fn classify(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    if err.is_redirect() {
        return ErrorKind::StatusMismatch;
    }
    if err.is_body() || err.is_decode() {
        return ErrorKind::Read;
    }
    let chain = source_chain(err);
    if chain.contains("dns") || chain.contains("resolve") || chain.contains("lookup") {
        return ErrorKind::Dns;
    }
    if chain.contains("certificate")
        || chain.contains("handshake")
        || chain.contains("tls")
        || chain.contains("ssl")
    {
        return ErrorKind::Tls;
    }
    ErrorKind::Connect
}

fn source_chain(err: &dyn std::error::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut cursor = err.source();
    while let Some(source) = cursor {
        parts.push(source.to_string());
        cursor = source.source();
    }
    parts.join(": ").to_ascii_lowercase()
}
