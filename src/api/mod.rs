//! Partition service HTTP surface.
//!
//! Health/readiness probes, an aggregated stats endpoint, and the manual
//! circuit-breaker controls. Breaker mutations require the configured API
//! key via `X-API-Key` or `Authorization: Bearer`, compared in constant
//! time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::circuit::CircuitBreaker;
use crate::detector::engine::DetectorStats;
use crate::leadership::LeaderElector;
use crate::stream::consumer::ConsumerStats;
use crate::stream::dlq::DlqSupervisor;
use crate::stream::{names, StreamTransport};

/// Liveness/degradation flags owned by the partition service.
#[derive(Debug, Default)]
pub struct HealthState {
    running: AtomicBool,
    degraded: AtomicBool,
}

impl HealthState {
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

pub struct ApiState {
    pub health: Arc<HealthState>,
    pub breaker: Arc<CircuitBreaker>,
    pub transport: Arc<dyn StreamTransport>,
    pub elector: Arc<LeaderElector>,
    pub detector_stats: Arc<DetectorStats>,
    pub consumer_stats: Arc<ConsumerStats>,
    pub dlq: Arc<DlqSupervisor>,
    pub api_key: Option<String>,
    pub instance_id: String,
    pub region_id: String,
    pub partition_id: String,
    pub started_at: Instant,
    pub maxlen: usize,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/stats", get(stats))
        .route("/circuit-breaker", get(breaker_status))
        .route("/circuit-breaker/open", post(breaker_open))
        .route("/circuit-breaker/close", post(breaker_close))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Equal-content check that does not leak a prefix length through timing:
/// both sides are hashed and the digests compared.
fn constant_time_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.api_key.as_deref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "circuit breaker API key not configured" })),
        )
            .into_response());
    };
    let provided = extract_api_key(headers).unwrap_or_default();
    if !constant_time_eq(expected, &provided) {
        warn!("Circuit breaker request rejected: bad API key");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid API key" })),
        )
            .into_response());
    }
    Ok(())
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    let (status_code, status) = if !state.health.is_running() {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if state.health.is_degraded() {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };
    let body = serde_json::json!({
        "status": status,
        "instanceId": state.instance_id,
        "regionId": state.region_id,
        "partitionId": state.partition_id,
        "isLeader": state.elector.is_leader(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    });
    (status_code, Json(body)).into_response()
}

async fn ready(State(state): State<Arc<ApiState>>) -> Response {
    if state.health.is_running() {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false })),
        )
            .into_response()
    }
}

async fn stats(State(state): State<Arc<ApiState>>) -> Response {
    let body = serde_json::json!({
        "leadership": {
            "state": state.elector.state(),
            "isLeader": state.elector.is_leader(),
            "isStandby": state.elector.is_standby(),
            "instanceId": state.elector.instance_id(),
        },
        "detector": state.detector_stats.snapshot(),
        "consumer": state.consumer_stats.snapshot(),
        "dlq": state.dlq.get_stats(),
        "circuitBreaker": state.breaker.status(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    });
    Json(body).into_response()
}

async fn breaker_status(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.breaker.status()).into_response()
}

async fn breaker_open(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let changed = state.breaker.open("manual API request");
    if changed {
        info!("Circuit breaker opened via API");
        publish_breaker_event(&state, "open").await;
    }
    Json(state.breaker.status()).into_response()
}

async fn breaker_close(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let changed = state.breaker.close();
    if changed {
        info!("Circuit breaker closed via API");
        publish_breaker_event(&state, "close").await;
    }
    Json(state.breaker.status()).into_response()
}

async fn publish_breaker_event(state: &ApiState, action: &str) {
    let payload = serde_json::json!({
        "action": action,
        "instanceId": state.instance_id,
        "regionId": state.region_id,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    });
    let fields = vec![("data".to_string(), payload.to_string())];
    if let Err(e) = state
        .transport
        .append(names::CIRCUIT_BREAKER, &fields, state.maxlen)
        .await
    {
        warn!(error = %e, "Failed to publish circuit breaker event");
    }
}

/// Short fingerprint of the configured API key for startup logs.
pub fn key_fingerprint(key: &str) -> String {
    hex::encode(&Sha256::digest(key.as_bytes())[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leadership::election::ElectionConfig;
    use crate::stream::dlq::DlqConfig;
    use crate::stream::memory::MemoryTransport;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn api_state(api_key: Option<&str>) -> (Arc<ApiState>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let elector = Arc::new(LeaderElector::new(
            transport.clone(),
            ElectionConfig::default(),
        ));
        let state = Arc::new(ApiState {
            health: Arc::new(HealthState::default()),
            breaker: Arc::new(CircuitBreaker::new()),
            transport: transport.clone(),
            elector,
            detector_stats: Arc::new(DetectorStats::default()),
            consumer_stats: Arc::new(ConsumerStats::default()),
            dlq: Arc::new(DlqSupervisor::new(transport.clone(), DlqConfig::default())),
            api_key: api_key.map(|k| k.to_string()),
            instance_id: "inst-1".to_string(),
            region_id: "primary".to_string(),
            partition_id: "l2-turbo".to_string(),
            started_at: Instant::now(),
            maxlen: 1000,
        });
        (state, transport)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(!constant_time_eq("secret", ""));
    }

    #[test]
    fn test_extract_api_key_variants() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "abc".parse().unwrap());
        assert_eq!(extract_api_key(&headers).as_deref(), Some("abc"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer xyz".parse().unwrap());
        assert_eq!(extract_api_key(&headers).as_deref(), Some("xyz"));

        let headers = HeaderMap::new();
        assert!(extract_api_key(&headers).is_none());
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let (state, _) = api_state(None);
        let request = || {
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap()
        };

        let (status, body) = send(router(state.clone()), request()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");

        state.health.set_running(true);
        let (status, body) = send(router(state.clone()), request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        state.health.set_degraded(true);
        let (status, body) = send(router(state.clone()), request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_ready_follows_running() {
        let (state, _) = api_state(None);
        let request = || {
            Request::builder()
                .uri("/ready")
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = send(router(state.clone()), request()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        state.health.set_running(true);
        let (status, _) = send(router(state), request()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_breaker_requires_valid_key() {
        let (state, transport) = api_state(Some("topsecret"));

        let no_key = Request::builder()
            .method("POST")
            .uri("/circuit-breaker/open")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router(state.clone()), no_key).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let bad_key = Request::builder()
            .method("POST")
            .uri("/circuit-breaker/open")
            .header("x-api-key", "wrong")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router(state.clone()), bad_key).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!state.breaker.is_open());

        let good_key = Request::builder()
            .method("POST")
            .uri("/circuit-breaker/open")
            .header("x-api-key", "topsecret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router(state.clone()), good_key).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["open"], true);
        assert!(state.breaker.is_open());
        assert_eq!(transport.len(names::CIRCUIT_BREAKER).await.unwrap(), 1);

        // Bearer form closes it again.
        let bearer = Request::builder()
            .method("POST")
            .uri("/circuit-breaker/close")
            .header("authorization", "Bearer topsecret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router(state.clone()), bearer).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["open"], false);
    }

    #[tokio::test]
    async fn test_breaker_unconfigured_key_is_service_unavailable() {
        let (state, _) = api_state(None);
        let request = Request::builder()
            .method("POST")
            .uri("/circuit-breaker/open")
            .header("x-api-key", "anything")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router(state), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let (state, _) = api_state(None);
        let request = Request::builder()
            .uri("/stats")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router(state), request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["leadership"]["instanceId"].is_string());
        assert!(body["detector"]["opportunities_published"].is_u64());
        assert!(body["dlq"]["total_messages"].is_u64());
    }

    #[test]
    fn test_key_fingerprint_is_stable_and_short() {
        assert_eq!(key_fingerprint("abc"), key_fingerprint("abc"));
        assert_ne!(key_fingerprint("abc"), key_fingerprint("abd"));
        assert_eq!(key_fingerprint("abc").len(), 8);
    }
}
