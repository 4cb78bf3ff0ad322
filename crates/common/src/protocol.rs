//! Request and response types for the HTTP/JSON front-end.
//!
//! Field names are camelCase on the wire, matching the public API contract.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Audit context
// ---------------------------------------------------------------------------

/// Optional audit metadata forwarded to the enclave with each request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditHeaders {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub tenant_id: String,
}

impl AuditHeaders {
    /// Returns `true` when neither field is populated.
    pub fn is_empty(&self) -> bool {
        self.request_id.is_empty() && self.tenant_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Create endpoint
// ---------------------------------------------------------------------------

/// Request body for `POST /create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestBody {
    /// Signature curve to create the key for (e.g. `"secp256k1"`).
    #[serde(default)]
    pub curve: String,
    #[serde(default)]
    pub audit_headers: Option<AuditHeaders>,
}

/// Successful response body for `POST /create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponseBody {
    pub key_id: String,
    /// Hex-encoded public key bytes.
    pub public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
}

// ---------------------------------------------------------------------------
// Sign endpoint
// ---------------------------------------------------------------------------

/// Request body for `POST /sign`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequestBody {
    #[serde(default)]
    pub key_id: String,
    /// Digest of the message to sign; must decode to exactly 32 bytes.
    #[serde(default)]
    pub digest: String,
    /// `"hex"` (default) or `"base64"`.
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub audit_headers: Option<AuditHeaders>,
}

/// Successful response body for `POST /sign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponseBody {
    /// Hex-encoded signature bytes.
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rec_id: Option<u32>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponseBody {
    /// Machine-readable error code (e.g. `"UNLOCK_REQUIRED"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
    /// Retry hint in whole seconds, present for retryable kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_hint: Option<u64>,
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /healthz`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponseBody {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Number of enclave targets currently registered with the pool.
    pub targets: usize,
}
