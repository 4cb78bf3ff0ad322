//! Axum HTTP/JSON front-end: digest validation, error-taxonomy mapping, and
//! the unlock response surface.

use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use prometheus::{Encoder, TextEncoder};
use signer_common::digest::{decode_digest, DigestEncoding};
use signer_common::protocol::{
    CreateRequestBody, CreateResponseBody, ErrorResponseBody, HealthResponseBody, SignRequestBody,
    SignResponseBody,
};
use signer_common::{ApiError, ErrorKind};
use tracing::warn;

use crate::rpc;

use super::responder::is_unlock_error;
use super::state::AppState;

/// Correlation header attached to unlock responses.
pub const UNLOCK_REQUEST_ID_HEADER: &str = "x-unlock-request-id";

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the application router with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/create", post(create))
        .route("/sign", post(sign))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .with_state(state)
}

/// `POST /create` — create a key inside an enclave.
async fn create(State(state): State<AppState>, Json(body): Json<CreateRequestBody>) -> Response {
    let req = rpc::CreateRequest {
        curve: body.curve,
        audit_context: convert_audit(body.audit_headers),
    };
    match state.backend.create(req).await {
        Ok(resp) => {
            let payload = CreateResponseBody {
                key_id: resp.key_id,
                public_key: hex::encode(resp.public_key),
                address: resp.address,
            };
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(err) => error_response(&state, "", err).await,
    }
}

/// `POST /sign` — sign a 32-byte digest with the keyed enclave.
async fn sign(State(state): State<AppState>, Json(body): Json<SignRequestBody>) -> Response {
    if body.key_id.is_empty() {
        let err = ApiError::new(ErrorKind::InvalidArgument, "keyId is required");
        return error_response(&state, "", err).await;
    }
    if body.digest.is_empty() {
        let err = ApiError::new(ErrorKind::InvalidArgument, "digest is required");
        return error_response(&state, &body.key_id, err).await;
    }
    let encoding = match DigestEncoding::parse(&body.encoding) {
        Ok(enc) => enc,
        Err(err) => return error_response(&state, &body.key_id, err).await,
    };
    let digest = match decode_digest(&body.digest, encoding) {
        Ok(digest) => digest,
        Err(err) => return error_response(&state, &body.key_id, err).await,
    };

    let req = rpc::SignRequest {
        key_id: body.key_id.clone(),
        digest: digest.to_vec(),
        encoding: match encoding {
            DigestEncoding::Hex => rpc::DigestEncoding::Hex as i32,
            DigestEncoding::Base64 => rpc::DigestEncoding::Base64 as i32,
        },
        audit_context: convert_audit(body.audit_headers),
    };
    match state.backend.sign(req).await {
        Ok(resp) => {
            let payload = SignResponseBody {
                signature: hex::encode(resp.signature),
                rec_id: (resp.rec_id != 0).then_some(resp.rec_id),
            };
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(err) => error_response(&state, &body.key_id, err).await,
    }
}

/// `GET /healthz` — liveness and readiness.
async fn healthz(State(state): State<AppState>) -> Response {
    let targets = state.pool.as_ref().map(|p| p.target_count()).unwrap_or(0);
    let (status, label) = if targets > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let body = HealthResponseBody {
        status: label.into(),
        targets,
    };
    (status, Json(body)).into_response()
}

/// `GET /metrics` — Prometheus exposition.
async fn metrics(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&state.registry.gather(), &mut buf) {
        warn!(error = %err, "metrics encoding failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
        buf,
    )
        .into_response()
}

/// Catch-all 404 handler.
async fn not_found() -> impl IntoResponse {
    let body = ErrorResponseBody {
        code: "NOT_FOUND".into(),
        message: "the requested resource does not exist".into(),
        retry_after_hint: None,
    };
    (StatusCode::NOT_FOUND, Json(body))
}

/// Render an [`ApiError`] with the taxonomy's status code and headers.
/// Unlock failures additionally go through the responder for a correlation
/// id, a sampled retry hint, and the background unlock enqueue.
async fn error_response(state: &AppState, key_id: &str, err: ApiError) -> Response {
    let mut headers = HeaderMap::new();
    let mut retry_after_hint = None;

    if is_unlock_error(&err) {
        let advice = state.responder.handle(key_id, &err).await;
        let secs = (advice.retry_after.as_millis() as u64).div_ceil(1000).max(1);
        retry_after_hint = Some(secs);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            headers.insert(header::RETRY_AFTER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&advice.request_id) {
            headers.insert(UNLOCK_REQUEST_ID_HEADER, value);
        }
    } else if err.kind().requires_retry_after() {
        let secs = err.retry_after_secs().unwrap_or(1);
        retry_after_hint = Some(secs);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            headers.insert(header::RETRY_AFTER, value);
        }
    }

    let status = StatusCode::from_u16(err.kind().http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorResponseBody {
        code: err.kind().code().into(),
        message: err.message().to_owned(),
        retry_after_hint,
    };
    (status, headers, Json(body)).into_response()
}

fn convert_audit(
    headers: Option<signer_common::protocol::AuditHeaders>,
) -> Option<rpc::AuditContext> {
    let headers = headers?;
    if headers.is_empty() {
        return None;
    }
    Some(rpc::AuditContext {
        request_id: headers.request_id,
        tenant_id: headers.tenant_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::backend::SignerBackend;
    use crate::api::responder::{UnlockResponder, UnlockResponderConfig};
    use crate::keycache::unlock::testing::RecordingNotifier;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use prometheus::Registry;
    use signer_common::ApiResult;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct FnBackend<F>(F);

    #[async_trait]
    impl<F> SignerBackend for FnBackend<F>
    where
        F: Fn(&rpc::SignRequest) -> ApiResult<rpc::SignResponse> + Send + Sync,
    {
        async fn create(&self, _req: rpc::CreateRequest) -> ApiResult<rpc::CreateResponse> {
            Ok(rpc::CreateResponse {
                key_id: "plainkey-01".into(),
                public_key: vec![0x01; 33],
                address: "0x1234".into(),
            })
        }

        async fn sign(&self, req: rpc::SignRequest) -> ApiResult<rpc::SignResponse> {
            (self.0)(&req)
        }
    }

    fn state_with<F>(backend: F, responder: UnlockResponder) -> AppState
    where
        F: Fn(&rpc::SignRequest) -> ApiResult<rpc::SignResponse> + Send + Sync + 'static,
    {
        AppState::new(
            Arc::new(FnBackend(backend)),
            Arc::new(responder),
            None,
            Arc::new(Registry::new()),
        )
    }

    fn sign_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/sign")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn sign_success_returns_hex_signature() {
        let digest = "a".repeat(64);
        let app = build(state_with(
            |req| {
                assert_eq!(req.digest.len(), 32);
                Ok(rpc::SignResponse {
                    signature: vec![0x01, 0x02],
                    rec_id: 7,
                })
            },
            UnlockResponder::new(UnlockResponderConfig::default()),
        ));
        let resp = app
            .oneshot(sign_request(&format!(
                r#"{{"keyId":"k1","digest":"{digest}","encoding":"hex"}}"#
            )))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["signature"], "0102");
        assert_eq!(body["recId"], 7);
    }

    #[tokio::test]
    async fn sign_rejects_bad_digest() {
        let app = build(state_with(
            |_| unreachable!("backend must not be called"),
            UnlockResponder::new(UnlockResponderConfig::default()),
        ));
        let resp = app
            .oneshot(sign_request(r#"{"keyId":"k1","digest":"zzz"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn sign_rejects_wrong_length_digest() {
        let app = build(state_with(
            |_| unreachable!("backend must not be called"),
            UnlockResponder::new(UnlockResponderConfig::default()),
        ));
        let digest = "ab".repeat(16); // 16 bytes, not 32
        let resp = app
            .oneshot(sign_request(&format!(
                r#"{{"keyId":"k1","digest":"{digest}"}}"#
            )))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_key_maps_to_404() {
        let digest = "a".repeat(64);
        let app = build(state_with(
            |_| Err(ApiError::new(ErrorKind::InvalidKey, "unknown key")),
            UnlockResponder::new(UnlockResponderConfig::default()),
        ));
        let resp = app
            .oneshot(sign_request(&format!(
                r#"{{"keyId":"k1","digest":"{digest}"}}"#
            )))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "INVALID_KEY");
    }

    #[tokio::test]
    async fn retry_later_carries_retry_after_header() {
        let digest = "a".repeat(64);
        let app = build(state_with(
            |_| {
                Err(ApiError::new(ErrorKind::RetryLater, "pool draining")
                    .with_retry_after(Duration::from_millis(1500)))
            },
            UnlockResponder::new(UnlockResponderConfig::default()),
        ));
        let resp = app
            .oneshot(sign_request(&format!(
                r#"{{"keyId":"k1","digest":"{digest}"}}"#
            )))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }

    #[tokio::test]
    async fn unlock_required_surfaces_headers_and_event() {
        let digest = "a".repeat(64);
        let queue = RecordingNotifier::default();
        let responder = UnlockResponder::new(UnlockResponderConfig {
            queue: Some(Arc::new(queue.clone())),
            keyspace: "prod".into(),
            min_retry: Duration::from_millis(50),
            max_retry: Duration::from_millis(200),
        });
        let app = build(state_with(
            |_| {
                Err(ApiError::unlock_required(
                    "dek expired",
                    Duration::from_millis(3),
                ))
            },
            responder,
        ));
        let resp = app
            .oneshot(sign_request(&format!(
                r#"{{"keyId":"hot-key","digest":"{digest}"}}"#
            )))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "1");
        let request_id = resp
            .headers()
            .get(UNLOCK_REQUEST_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        assert!(!request_id.is_empty());

        let body = body_json(resp).await;
        assert_eq!(body["code"], "UNLOCK_REQUIRED");

        let events = queue.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key_id, "hot-key");
        assert_eq!(events[0].request_id, request_id);
    }

    #[tokio::test]
    async fn create_returns_key_material() {
        let app = build(state_with(
            |_| unreachable!("sign not called"),
            UnlockResponder::new(UnlockResponderConfig::default()),
        ));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/create")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"curve":"secp256k1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["keyId"], "plainkey-01");
        assert_eq!(body["publicKey"], "01".repeat(33));
        assert_eq!(body["address"], "0x1234");
    }

    #[tokio::test]
    async fn healthz_degraded_without_pool() {
        let app = build(AppState::default());
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        let app = build(AppState::default());
        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = build(AppState::default());
        let resp = app
            .oneshot(Request::builder().uri("/unknown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
