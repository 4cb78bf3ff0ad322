//! Common types shared across `signer-gateway` crates: the request-side error
//! taxonomy, the HTTP/JSON wire types, and the digest codec.

pub mod digest;
pub mod error;
pub mod protocol;

pub use error::{ApiError, ApiResult, ErrorKind};
