//! Remote source error types.
//!
//! Errors are categorized so that two separate retry layers can act on them:
//!
//! - **In-request retry** ([`super::retry`]) repeats only `Transient` errors
//!   (HTTP 429, 5xx, connection failures) a few times with short backoff.
//! - **Queue retry** decides between retrying the item later and dead-lettering
//!   it. Only `NotFound` is permanent there; everything else is retried up to
//!   the queue's retry ceiling.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The kind of remote error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// Safe to retry right away with backoff.
    ///
    /// Examples:
    /// - HTTP 5xx (server errors)
    /// - HTTP 429 (rate limited)
    /// - Connection resets, DNS failures, timeouts
    Transient,

    /// The resource is gone and will not come back (HTTP status in the
    /// configured permanent allowlist, 404 and 410 by default).
    NotFound,

    /// The signed download URL was rejected (HTTP 403). A fresh URL may work.
    Expired,

    /// Any other rejected request (e.g. 400, 401). Not retried in-request,
    /// but may succeed on a later attempt.
    Rejected,
}

impl SourceErrorKind {
    /// Returns true if the request should be repeated immediately.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SourceErrorKind::Transient)
    }

    /// Returns true if no later attempt can succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SourceErrorKind::NotFound)
    }
}

/// An error talking to the remote source.
#[derive(Debug, Error)]
pub struct SourceError {
    pub kind: SourceErrorKind,

    /// The HTTP status code, if the server answered.
    pub status_code: Option<u16>,

    pub message: String,

    /// Server-requested delay before retrying (`Retry-After` on 429).
    pub retry_after: Option<Duration>,

    #[source]
    pub source: Option<reqwest::Error>,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "remote error (HTTP {}): {}", code, self.message),
            None => write!(f, "remote error: {}", self.message),
        }
    }
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            retry_after: None,
            source: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::NotFound, message)
    }

    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Expired, message)
    }

    /// Creates an error from a non-success HTTP status.
    pub fn from_status(status: u16, policy: &StatusPolicy, message: impl Into<String>) -> Self {
        Self {
            kind: policy.classify(status),
            status_code: Some(status),
            message: message.into(),
            retry_after: None,
            source: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Categorizes a transport-level reqwest error.
    ///
    /// Errors carrying a status are classified by it; connection and timeout
    /// errors are transient; anything else (e.g. a malformed body) is
    /// rejected.
    pub fn from_reqwest(err: reqwest::Error, policy: &StatusPolicy) -> Self {
        let status_code = err.status().map(|s| s.as_u16());
        let kind = match status_code {
            Some(code) => policy.classify(code),
            None if err.is_timeout() || err.is_connect() || err.is_request() => {
                SourceErrorKind::Transient
            }
            None if is_network_error(&err.to_string()) => SourceErrorKind::Transient,
            None => SourceErrorKind::Rejected,
        };
        Self {
            kind,
            status_code,
            message: err.to_string(),
            retry_after: None,
            source: Some(err),
        }
    }
}

/// Maps HTTP status codes to error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPolicy {
    /// Statuses meaning the resource is permanently gone.
    permanent: Vec<u16>,
}

impl StatusPolicy {
    pub const DEFAULT_PERMANENT: [u16; 2] = [404, 410];

    pub fn new(permanent: impl IntoIterator<Item = u16>) -> Self {
        Self {
            permanent: permanent.into_iter().collect(),
        }
    }

    pub fn permanent_codes(&self) -> &[u16] {
        &self.permanent
    }

    pub fn classify(&self, status: u16) -> SourceErrorKind {
        if self.permanent.contains(&status) {
            return SourceErrorKind::NotFound;
        }
        match status {
            429 => SourceErrorKind::Transient,
            403 => SourceErrorKind::Expired,
            code if (500..600).contains(&code) => SourceErrorKind::Transient,
            _ => SourceErrorKind::Rejected,
        }
    }
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PERMANENT)
    }
}

/// Checks if an error message indicates a network-level error.
fn is_network_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("timeout")
        || message_lower.contains("connection")
        || message_lower.contains("network")
        || message_lower.contains("dns")
        || message_lower.contains("timed out")
}

/// Parses a `Retry-After` header given in seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
