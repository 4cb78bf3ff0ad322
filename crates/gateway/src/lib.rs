//! `signer-gateway` — parent-host gateway of the enclave signing service.
//!
//! Clients submit 32-byte message digests and receive signatures; private key
//! material never leaves the enclaves. The hot signing path is kept off the
//! remote KMS by three subsystems:
//!
//! - [`keycache`] — per-key state machine with soft/hard TTLs, use-count
//!   budgets, local DEK rehydration, single-flight refresh coalescing, and
//!   background prefetch.
//! - [`pool`] — per-target bounded pools of long-lived streaming sessions to
//!   the enclaves, with health probing, circuit breaking, and backed-off
//!   reconnect.
//! - [`unlock`] — a bounded queue + worker pool that runs KMS-bound recovery
//!   out of band while the hot request returns a short retry hint.

pub mod api;
pub mod config;
pub mod keycache;
pub mod kms;
pub mod pool;
pub mod rpc;
pub mod telemetry;
pub mod unlock;
pub mod util;
