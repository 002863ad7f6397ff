//! HTTP upload client against an in-process axum server.

#![cfg(feature = "http")]

mod common;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{enroll, signed_record, t0, test_settings, ReferenceServer};
use fieldsign_core::sync::client::{BATCH_PATH, HEALTH_PATH};
use fieldsign_core::sync::{HttpUploadClient, SyncEngine, UploadApi, UploadItem, UploadResponse};
use fieldsign_core::{FieldSignError, ManualClock, SignatureQueue, SyncState};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    server: Arc<ReferenceServer>,
    device_id: Uuid,
}

async fn health() -> &'static str {
    "ok"
}

async fn batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(items): Json<Vec<UploadItem>>,
) -> Result<Json<UploadResponse>, StatusCode> {
    let device = headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok());
    if device != Some(state.device_id) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(state.server.deliver(&items)))
}

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_reference(device_id: Uuid) -> (String, Arc<ReferenceServer>) {
    let server = Arc::new(ReferenceServer::new());
    let app = Router::new()
        .route(HEALTH_PATH, get(health))
        .route(BATCH_PATH, post(batch))
        .with_state(AppState {
            server: server.clone(),
            device_id,
        });
    (spawn(app).await, server)
}

fn client(url: &str, device_id: Uuid) -> HttpUploadClient {
    HttpUploadClient::new(url, device_id, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn batch_upload_roundtrip() {
    let enrollment = enroll();
    let (url, server) = spawn_reference(enrollment.device_id()).await;
    let client = client(&url, enrollment.device_id());

    let record = signed_record(&enrollment, 42, t0());
    let response = client
        .upload_batch(&[UploadItem::from(&record)])
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].local_id, record.local_id);
    assert_eq!(server.applied_count(42), 1);
}

#[tokio::test]
async fn unknown_device_is_refused_as_network_error() {
    let enrollment = enroll();
    let (url, _server) = spawn_reference(enrollment.device_id()).await;
    // a different device id is refused with 401
    let client = client(&url, Uuid::new_v4());

    let record = signed_record(&enrollment, 1, t0());
    let err = client
        .upload_batch(&[UploadItem::from(&record)])
        .await
        .unwrap_err();
    assert!(matches!(err, FieldSignError::NetworkError(_)));
}

#[tokio::test]
async fn status_codes_map_to_error_kinds() {
    let app = Router::new()
        .route(
            "/unprocessable/api/v1/signatures/batch",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "bad attestation hash") }),
        )
        .route(
            "/unavailable/api/v1/signatures/batch",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        )
        .route(
            "/garbled/api/v1/signatures/batch",
            post(|| async { "not json" }),
        );
    let url = spawn(app).await;
    let enrollment = enroll();
    let items = [UploadItem::from(&signed_record(&enrollment, 1, t0()))];

    let rejected = client(&format!("{}/unprocessable", url), enrollment.device_id())
        .upload_batch(&items)
        .await
        .unwrap_err();
    match rejected {
        FieldSignError::ServerRejectedValidation(msg) => {
            assert!(msg.contains("bad attestation hash"))
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let unavailable = client(&format!("{}/unavailable", url), enrollment.device_id())
        .upload_batch(&items)
        .await
        .unwrap_err();
    assert!(matches!(unavailable, FieldSignError::NetworkError(_)));
    assert!(unavailable.is_retryable());

    let garbled = client(&format!("{}/garbled", url), enrollment.device_id())
        .upload_batch(&items)
        .await
        .unwrap_err();
    assert!(matches!(garbled, FieldSignError::NetworkError(_)));
}

#[tokio::test]
async fn probe_reports_reachability() {
    let device_id = Uuid::new_v4();
    let (url, _server) = spawn_reference(device_id).await;
    assert!(client(&url, device_id).probe().await);

    // bind then drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    assert!(!client(&dead, device_id).probe().await);
}

#[tokio::test]
async fn engine_drains_over_http() {
    let enrollment = enroll();
    let (url, server) = spawn_reference(enrollment.device_id()).await;
    server.complete_elsewhere(8, "sig-remote-8");

    let clock = ManualClock::new(t0());
    let queue = SignatureQueue::in_memory_with_clock(Arc::new(clock.clone())).unwrap();
    let mut engine = SyncEngine::new(
        queue,
        client(&url, enrollment.device_id()),
        enrollment.key(),
        clock,
        test_settings(),
    );

    let winner = signed_record(&enrollment, 7, t0());
    let loser = signed_record(&enrollment, 8, t0() + chrono::Duration::seconds(1));
    engine.queue_mut().append(&winner).unwrap();
    engine.queue_mut().append(&loser).unwrap();

    let report = engine.drain().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.conflicted, 1);
    assert_eq!(server.applied_ids(), vec![winner.local_id]);

    let conflicted = engine.queue().get(&loser.local_id).unwrap().unwrap();
    assert_eq!(conflicted.sync_state, SyncState::Conflicted);
}
