//! C3 Webhook Ingress (spec.md §4.3).
//!
//! Validates inbound deliveries and hands them to the event mapper /
//! dispatch queue without ever doing agent work on the request path.
//! The router built here mirrors the teacher's `build_router` /
//! `start_server` shape (`factory/server.rs`), swapping the SPA/API
//! surface for the two routes this system actually needs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

use crate::errors::IngressError;

type HmacSha256 = Hmac<Sha256>;

/// Receives a validated webhook delivery and hands it off. Implemented
/// by the router; kept as a trait so ingress tests can use a recording
/// double instead of standing up the whole dispatch pipeline.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn accept(&self, event_name: String, delivery_id: String, payload: Value);
}

pub struct WebhookState<S: EventSink> {
    pub webhook_secret: String,
    pub sink: Arc<S>,
    pub ready: AtomicBool,
}

impl<S: EventSink> WebhookState<S> {
    pub fn new(webhook_secret: String, sink: Arc<S>) -> Self {
        Self {
            webhook_secret,
            sink,
            ready: AtomicBool::new(false),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }
}

pub fn build_router<S: EventSink + 'static>(state: Arc<WebhookState<S>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks", post(receive_webhook::<S>))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
struct ReceivedAck {
    received: bool,
}

async fn receive_webhook<S: EventSink + 'static>(
    State(state): State<Arc<WebhookState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.ready.load(Ordering::SeqCst) {
        return ingress_response(IngressError::NotReady);
    }

    match handle(&state, &headers, &body).await {
        Ok(()) => (StatusCode::OK, axum::Json(ReceivedAck { received: true })).into_response(),
        Err(err) => ingress_response(err),
    }
}

async fn handle<S: EventSink + 'static>(
    state: &WebhookState<S>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), IngressError> {
    let signature = header_str(headers, "signature")?;
    let event_name = header_str(headers, "event-name")?;
    let delivery_id = header_str(headers, "delivery-id")?;

    verify_signature(&state.webhook_secret, signature, body)?;

    let payload: Value = serde_json::from_slice(body)?;
    info!(event_name, delivery_id, "webhook accepted");
    state.sink.accept(event_name.to_string(), delivery_id.to_string(), payload).await;
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, IngressError> {
    headers
        .get(name)
        .ok_or(IngressError::MissingHeader(name))?
        .to_str()
        .map_err(|_| IngressError::MissingHeader(name))
}

/// Constant-time `HMAC-SHA256(secret, raw-body)` comparison. The
/// signature header carries a hex digest with no `sha256=` prefix.
fn verify_signature(secret: &str, signature: &str, body: &[u8]) -> Result<(), IngressError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = hex::decode(signature.trim()).map_err(|_| IngressError::BadSignature)?;
    mac.verify_slice(&expected).map_err(|_| {
        warn!("webhook signature mismatch");
        IngressError::BadSignature
    })
}

fn ingress_response(err: IngressError) -> Response {
    let status = match err {
        IngressError::MissingHeader(_) | IngressError::MalformedJson(_) => StatusCode::BAD_REQUEST,
        IngressError::BadSignature => StatusCode::UNAUTHORIZED,
        IngressError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct RecordingSink {
        received: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn accept(&self, event_name: String, delivery_id: String, _payload: Value) {
            self.received.lock().unwrap().push((event_name, delivery_id));
        }
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn router(ready: bool) -> (Router, Arc<WebhookState<RecordingSink>>) {
        let sink = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        let state = Arc::new(WebhookState::new("topsecret".to_string(), sink));
        if ready {
            state.mark_ready();
        }
        (build_router(state.clone()), state)
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let (app, _) = router(false);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhooks_are_503_before_ready() {
        let (app, _) = router(false);
        let body = b"{}".to_vec();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks")
                    .header("signature", sign("topsecret", &body))
                    .header("event-name", "issues")
                    .header("delivery-id", "d1")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn valid_signature_is_accepted() {
        let (app, _) = router(true);
        let body = serde_json::json!({"action": "opened"}).to_string().into_bytes();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks")
                    .header("signature", sign("topsecret", &body))
                    .header("event-name", "issues")
                    .header("delivery-id", "d1")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let (app, _) = router(true);
        let body = b"{}".to_vec();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks")
                    .header("signature", "0000")
                    .header("event-name", "issues")
                    .header("delivery-id", "d1")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_header_is_bad_request() {
        let (app, _) = router(true);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks")
                    .header("event-name", "issues")
                    .header("delivery-id", "d1")
                    .body(Body::from(b"{}".to_vec()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let (app, _) = router(true);
        let body = b"not json".to_vec();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks")
                    .header("signature", sign("topsecret", &body))
                    .header("event-name", "issues")
                    .header("delivery-id", "d1")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
