//! Target selection: round-robin for key creation, hash-sticky for signing.

use std::sync::atomic::{AtomicU64, Ordering};

use signer_common::{ApiError, ApiResult, ErrorKind};

use crate::util::hash::fnv1a_32;

/// Decides which enclave target serves a request.
pub trait TargetSelector: Send + Sync {
    fn select_for_create(&self) -> ApiResult<String>;
    fn select_for_sign(&self, key_id: &str) -> ApiResult<String>;
}

/// Always returns the same target; the single-enclave baseline.
#[derive(Debug, Clone)]
pub struct StaticSelector {
    target_id: String,
}

impl StaticSelector {
    pub fn new(target_id: impl Into<String>) -> ApiResult<Self> {
        let target_id = target_id.into();
        if target_id.is_empty() {
            return Err(ApiError::new(
                ErrorKind::Internal,
                "static selector requires a target id",
            ));
        }
        Ok(Self { target_id })
    }
}

impl TargetSelector for StaticSelector {
    fn select_for_create(&self) -> ApiResult<String> {
        Ok(self.target_id.clone())
    }

    fn select_for_sign(&self, _key_id: &str) -> ApiResult<String> {
        Ok(self.target_id.clone())
    }
}

/// Consistent routing over a fixed target list.
///
/// Create requests rotate round-robin so new keys spread evenly; sign
/// requests hash the key id so each key always lands on the same target,
/// maximizing enclave cache locality. The target list is captured at
/// construction; adding or removing targets means building a new selector.
pub struct StickySelector {
    target_ids: Vec<String>,
    rr: AtomicU64,
}

impl StickySelector {
    pub fn new(target_ids: Vec<String>) -> ApiResult<Self> {
        if target_ids.is_empty() {
            return Err(ApiError::new(
                ErrorKind::Internal,
                "at least one enclave target is required",
            ));
        }
        Ok(Self {
            target_ids,
            rr: AtomicU64::new(0),
        })
    }
}

impl TargetSelector for StickySelector {
    fn select_for_create(&self) -> ApiResult<String> {
        let idx = self.rr.fetch_add(1, Ordering::Relaxed) as usize % self.target_ids.len();
        Ok(self.target_ids[idx].clone())
    }

    fn select_for_sign(&self, key_id: &str) -> ApiResult<String> {
        if key_id.is_empty() {
            return Ok(self.target_ids[0].clone());
        }
        let idx = fnv1a_32(key_id.as_bytes()) as usize % self.target_ids.len();
        Ok(self.target_ids[idx].clone())
    }
}
