//! Backend abstraction between the front-ends and the enclave fleet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use signer_common::{ApiError, ApiResult, ErrorKind};
use tonic::{Code, Status};

use crate::pool::{Pool, PoolError};
use crate::rpc::{CreateRequest, CreateResponse, SignRequest, SignResponse};

use super::selector::TargetSelector;

/// Default per-RPC deadline, applied on top of the channel policy.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Business surface the HTTP front-end talks to.
#[async_trait]
pub trait SignerBackend: Send + Sync {
    async fn create(&self, req: CreateRequest) -> ApiResult<CreateResponse>;
    async fn sign(&self, req: SignRequest) -> ApiResult<SignResponse>;
}

/// Placeholder backend used until a real enclave fleet is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubBackend;

#[async_trait]
impl SignerBackend for StubBackend {
    async fn create(&self, _req: CreateRequest) -> ApiResult<CreateResponse> {
        Err(ApiError::new(
            ErrorKind::RetryLater,
            "stub backend: implement create",
        ))
    }

    async fn sign(&self, _req: SignRequest) -> ApiResult<SignResponse> {
        Err(ApiError::new(
            ErrorKind::RetryLater,
            "stub backend: implement sign",
        ))
    }
}

/// Backend that leases pooled streaming sessions to the enclaves.
pub struct EnclaveBackend {
    pool: Pool,
    selector: Arc<dyn TargetSelector>,
    call_timeout: Duration,
}

impl EnclaveBackend {
    pub fn new(pool: Pool, selector: Arc<dyn TargetSelector>) -> Self {
        Self::with_call_timeout(pool, selector, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_call_timeout(
        pool: Pool,
        selector: Arc<dyn TargetSelector>,
        call_timeout: Duration,
    ) -> Self {
        let call_timeout = if call_timeout.is_zero() {
            DEFAULT_CALL_TIMEOUT
        } else {
            call_timeout
        };
        Self {
            pool,
            selector,
            call_timeout,
        }
    }
}

#[async_trait]
impl SignerBackend for EnclaveBackend {
    async fn create(&self, req: CreateRequest) -> ApiResult<CreateResponse> {
        let target = self.selector.select_for_create()?;
        let lease = self
            .pool
            .acquire(&target)
            .await
            .map_err(pool_error_to_api)?;
        let mut client = lease.client();
        let result = match tokio::time::timeout(self.call_timeout, client.create(req)).await {
            Ok(result) => result,
            Err(_) => Err(Status::deadline_exceeded("create rpc timed out")),
        };
        lease.release(&result);
        result.map_err(|status| status_to_api(&status))
    }

    async fn sign(&self, req: SignRequest) -> ApiResult<SignResponse> {
        let target = self.selector.select_for_sign(&req.key_id)?;
        let lease = self
            .pool
            .acquire(&target)
            .await
            .map_err(pool_error_to_api)?;
        let mut client = lease.client();
        // One request, one response over the bidi signing stream.
        let exchange = async {
            let mut responses = client.sign_stream(stream::iter([req])).await?;
            match responses.message().await? {
                Some(resp) => Ok(resp),
                None => Err(Status::internal("sign stream closed without a response")),
            }
        };
        let result = match tokio::time::timeout(self.call_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Status::deadline_exceeded("sign rpc timed out")),
        };
        lease.release(&result);
        result.map_err(|status| status_to_api(&status))
    }
}

/// Pool failures surface as `RetryLater` when the pool (not the caller) is
/// the bottleneck, `Internal` otherwise.
pub(crate) fn pool_error_to_api(err: PoolError) -> ApiError {
    match err {
        PoolError::PoolDraining | PoolError::AcquireTimeout => {
            ApiError::new(ErrorKind::RetryLater, err.to_string())
        }
        other => ApiError::new(ErrorKind::Internal, other.to_string()),
    }
}

/// Streaming-status code for each error kind; the inverse of
/// [`status_to_api`], used by RPC-facing shims.
pub fn kind_to_status_code(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::InvalidArgument => Code::InvalidArgument,
        ErrorKind::RetryLater => Code::ResourceExhausted,
        ErrorKind::UnlockRequired => Code::Unavailable,
        ErrorKind::InvalidKey => Code::NotFound,
        ErrorKind::Internal => Code::Internal,
    }
}

/// Map a streaming status from the enclave back onto the error taxonomy.
pub(crate) fn status_to_api(status: &Status) -> ApiError {
    let kind = match status.code() {
        Code::InvalidArgument => ErrorKind::InvalidArgument,
        Code::NotFound => ErrorKind::InvalidKey,
        Code::ResourceExhausted => ErrorKind::RetryLater,
        Code::Unavailable => ErrorKind::UnlockRequired,
        _ => ErrorKind::Internal,
    };
    ApiError::new(kind, status.message().to_owned())
}
