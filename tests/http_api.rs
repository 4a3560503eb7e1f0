//! HTTP API tests: router driven in-process, and a live server driven by the client

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use node_ipam::client::IpamClient;
use node_ipam::routing::NoopRouteInstaller;
use node_ipam::server::{build_router, AppState};
use node_ipam::{IpamEngine, MemoryStore, PoolSpec};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

fn test_state(subnet: &str, bits: u8) -> Arc<AppState> {
    let store = Arc::new(MemoryStore::with_pools([PoolSpec::new(
        "default",
        vec![subnet.parse().unwrap()],
        bits,
    )]));
    let engine = Arc::new(IpamEngine::new(
        "node1",
        store,
        Arc::new(NoopRouteInstaller),
        true,
    ));
    Arc::new(AppState::new(engine, Duration::from_secs(5)))
}

async fn call(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn allocate_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/ip")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn pod(container_id: &str) -> Value {
    json!({
        "pod-namespace": "default",
        "pod-name": "web-0",
        "container-id": container_id,
    })
}

#[tokio::test]
async fn test_allocate_lookup_release() {
    let state = test_state("10.3.0.0/24", 3);

    let (status, body) = call(&state, allocate_request(pod("c1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["address"], "10.3.0.0");
    assert_eq!(body["status"], 200);

    let (status, body) = call(&state, request("GET", "/ip/c1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["address"], "10.3.0.0");

    let (status, body) = call(&state, request("DELETE", "/ip/default/web-0/c1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["address"], "10.3.0.0");

    // Deleting again is not an error.
    let (status, body) = call(&state, request("DELETE", "/ip/default/web-0/c1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["address"], "");

    let (status, body) = call(&state, request("GET", "/ip/c1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn test_allocate_twice_conflicts() {
    let state = test_state("10.3.0.0/24", 3);

    let (status, _) = call(&state, allocate_request(pod("c1"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&state, allocate_request(pod("c1"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], 409);
    assert!(body["error"].as_str().unwrap().contains("c1"));
}

#[tokio::test]
async fn test_allocate_validates_fields() {
    let state = test_state("10.3.0.0/24", 3);

    let cases = [
        (json!({"pod-name": "p", "container-id": "c"}), "no pod namespace"),
        (json!({"pod-namespace": "ns", "container-id": "c"}), "no pod name"),
        (json!({"pod-namespace": "ns", "pod-name": "p"}), "no container-id"),
    ];
    for (payload, message) in cases {
        let (status, body) = call(&state, allocate_request(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], message);
    }

    let malformed = Request::builder()
        .method("POST")
        .uri("/ip")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = call(&state, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn test_exhausted_pool_is_unavailable() {
    let state = test_state("10.3.0.0/30", 2);

    for i in 0..4 {
        let (status, _) = call(&state, allocate_request(pod(&format!("c{}", i)))).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = call(&state, allocate_request(pod("c4"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], 503);
}

#[tokio::test]
async fn test_status_and_health_checks() {
    let state = test_state("10.3.0.0/24", 3);
    call(&state, allocate_request(pod("c1"))).await;

    let (status, body) = call(&state, request("GET", "/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node"], "node1");
    assert_eq!(body["containers"], 1);
    assert_eq!(body["pools"]["default"][0], "10.3.0.0/29");

    let (status, body) = call(&state, request("GET", "/health/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alive"], true);

    let (status, _) = call(&state, request("GET", "/health/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    state.health.set_ready().await;
    let (status, body) = call(&state, request("GET", "/health/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_client_against_live_server() {
    let state = test_state("10.4.0.0/24", 3);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = IpamClient::new(format!("http://{}", addr), Duration::from_secs(5)).unwrap();

    let ip = client.allocate("default", "web-0", "c1").await.unwrap();
    assert_eq!(ip.to_string(), "10.4.0.0");
    assert_eq!(client.lookup("c1").await.unwrap(), ip);

    let err = client.allocate("default", "web-0", "c1").await.unwrap_err();
    assert_eq!(err.status(), Some(409));

    let status = client.status().await.unwrap();
    assert_eq!(status.containers, 1);

    assert_eq!(client.release("default", "web-0", "c1").await.unwrap(), Some(ip));
    assert_eq!(client.release("default", "web-0", "c1").await.unwrap(), None);
    assert_eq!(client.lookup("c1").await.unwrap_err().status(), Some(404));
}
