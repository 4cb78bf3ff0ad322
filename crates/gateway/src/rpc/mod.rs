//! Wire types and client for the `signer.v1.SignerService` streaming RPC
//! spoken by the enclave signers.
//!
//! The message and client definitions are maintained by hand in the shape
//! `tonic`/`prost` code generation emits, so the crate builds without a
//! protoc toolchain. Health probing uses the standard
//! `grpc.health.v1.Health` service via `tonic-health`.

use http::uri::PathAndQuery;
use tonic::codec::{ProstCodec, Streaming};
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

/// Default fully-qualified service name, also used for health checks.
pub const SERVICE_NAME: &str = "signer.v1.SignerService";

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Audit metadata attached to create/sign calls.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuditContext {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub tenant_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateRequest {
    /// Signature curve, e.g. `"secp256k1"`.
    #[prost(string, tag = "1")]
    pub curve: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub audit_context: ::core::option::Option<AuditContext>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateResponse {
    #[prost(string, tag = "1")]
    pub key_id: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "3")]
    pub address: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignRequest {
    #[prost(string, tag = "1")]
    pub key_id: ::prost::alloc::string::String,
    /// 32-byte message digest; validated at the front-end boundary.
    #[prost(bytes = "vec", tag = "2")]
    pub digest: ::prost::alloc::vec::Vec<u8>,
    #[prost(enumeration = "DigestEncoding", tag = "3")]
    pub encoding: i32,
    #[prost(message, optional, tag = "4")]
    pub audit_context: ::core::option::Option<AuditContext>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub rec_id: u32,
}

/// Encoding the digest was submitted in, recorded for audit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DigestEncoding {
    Unspecified = 0,
    Hex = 1,
    Base64 = 2,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client for `signer.v1.SignerService` over a pooled [`Channel`].
#[derive(Debug, Clone)]
pub struct SignerClient {
    inner: tonic::client::Grpc<Channel>,
}

impl SignerClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Create a new key inside the enclave.
    pub async fn create(&mut self, request: CreateRequest) -> Result<CreateResponse, Status> {
        self.inner.ready().await.map_err(|e| {
            Status::unavailable(format!("signer service was not ready: {e}"))
        })?;
        let codec: ProstCodec<CreateRequest, CreateResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/signer.v1.SignerService/Create");
        self.inner
            .unary(Request::new(request), path, codec)
            .await
            .map(Response::into_inner)
    }

    /// One-shot sign over a unary call.
    pub async fn sign(&mut self, request: SignRequest) -> Result<SignResponse, Status> {
        self.inner.ready().await.map_err(|e| {
            Status::unavailable(format!("signer service was not ready: {e}"))
        })?;
        let codec: ProstCodec<SignRequest, SignResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/signer.v1.SignerService/Sign");
        self.inner
            .unary(Request::new(request), path, codec)
            .await
            .map(Response::into_inner)
    }

    /// Bidirectional signing stream used by the hot path.
    pub async fn sign_stream<S>(&mut self, requests: S) -> Result<Streaming<SignResponse>, Status>
    where
        S: futures::Stream<Item = SignRequest> + Send + 'static,
    {
        self.inner.ready().await.map_err(|e| {
            Status::unavailable(format!("signer service was not ready: {e}"))
        })?;
        let codec: ProstCodec<SignRequest, SignResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/signer.v1.SignerService/SignStream");
        self.inner
            .streaming(Request::new(requests), path, codec)
            .await
            .map(Response::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn sign_request_round_trips_through_prost() {
        let req = SignRequest {
            key_id: "k1".into(),
            digest: vec![0xAB; 32],
            encoding: DigestEncoding::Hex as i32,
            audit_context: Some(AuditContext {
                request_id: "r1".into(),
                tenant_id: "t1".into(),
            }),
        };
        let bytes = req.encode_to_vec();
        let decoded = SignRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(
            DigestEncoding::try_from(decoded.encoding).unwrap(),
            DigestEncoding::Hex
        );
    }

    #[test]
    fn create_response_defaults_are_empty() {
        let resp = CreateResponse::default();
        assert!(resp.key_id.is_empty());
        assert!(resp.public_key.is_empty());
        assert!(resp.address.is_empty());
    }
}
