//! Request-side error taxonomy shared by every front-end and subsystem.
//!
//! Errors are a sum of kinds with a human-readable message and optional
//! retry metadata. Callers match on [`ErrorKind`], never on the concrete
//! source of the failure, so the taxonomy stays independent of transport.

use std::time::Duration;

use thiserror::Error;

/// Business error kind, independent of HTTP or streaming transport.
///
/// Variants map to wire status codes returned to callers:
/// - [`ErrorKind::InvalidArgument`] → 400 / invalid-argument
/// - [`ErrorKind::RetryLater`] → 429 / resource-exhausted
/// - [`ErrorKind::UnlockRequired`] → 503 / unavailable
/// - [`ErrorKind::InvalidKey`] → 404 / not-found
/// - [`ErrorKind::Internal`] → 500 / internal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request was malformed; never retried by the service.
    InvalidArgument,
    /// Upstream overload; the client may retry after the hint.
    RetryLater,
    /// The key is temporarily unusable locally; a background unlock has been
    /// (or will be) scheduled and the client should retry after the hint.
    UnlockRequired,
    /// The target enclave reports the key is unknown; no retry.
    InvalidKey,
    /// Unmapped failure; logged and reported as opaque.
    Internal,
}

impl ErrorKind {
    /// Machine-readable code string carried in error response bodies.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::RetryLater => "RETRY_LATER",
            ErrorKind::UnlockRequired => "UNLOCK_REQUIRED",
            ErrorKind::InvalidKey => "INVALID_KEY",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::RetryLater => 429,
            ErrorKind::UnlockRequired => 503,
            ErrorKind::InvalidKey => 404,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether responses for this kind must carry a `Retry-After` header.
    pub fn requires_retry_after(self) -> bool {
        matches!(self, ErrorKind::RetryLater | ErrorKind::UnlockRequired)
    }
}

/// Business error with a unified kind and optional retry metadata.
///
/// Cloneable so a single refresh outcome can be fanned out to every
/// coalesced waiter.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    retry_after: Option<Duration>,
    refresh_budget: Option<Duration>,
}

impl ApiError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            refresh_budget: None,
        }
    }

    /// Shorthand for an [`ErrorKind::UnlockRequired`] error carrying the
    /// refresh budget that was in force when the failure occurred, so the
    /// unlock responder can size the retry hint.
    pub fn unlock_required(reason: impl Into<String>, refresh_budget: Duration) -> Self {
        Self {
            kind: ErrorKind::UnlockRequired,
            message: reason.into(),
            retry_after: None,
            refresh_budget: Some(refresh_budget),
        }
    }

    /// Attach a `Retry-After` hint; returns `self` for chaining.
    pub fn with_retry_after(mut self, d: Duration) -> Self {
        self.retry_after = Some(d);
        self
    }

    /// The error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message (safe to expose to callers).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The refresh budget in force when the failure occurred, if any.
    pub fn refresh_budget(&self) -> Option<Duration> {
        self.refresh_budget
    }

    /// The raw retry hint, if one was attached.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// The `Retry-After` header value in whole seconds: the ceiling of the
    /// internal hint, never less than 1. `None` when no hint was attached.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let hint = self.retry_after?;
        if hint.is_zero() {
            return None;
        }
        Some((hint.as_millis() as u64).div_ceil(1000).max(1))
    }
}

/// Convenience alias used throughout the gateway.
pub type ApiResult<T> = Result<T, ApiError>;
