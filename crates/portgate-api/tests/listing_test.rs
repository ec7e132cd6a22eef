//! Integration tests for the device listing endpoint

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use portgate_api::{models::*, ApiServer, ApiServerConfig};
use portgate_control::{Device, DeviceRegistry, PortRange};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt; // For `oneshot` method

fn create_test_router(registry: Arc<DeviceRegistry>) -> Router {
    let config = ApiServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
    };
    ApiServer::new(config, registry).build_router()
}

/// Register a device backed by a loopback connection; the remote end is
/// returned so the connection stays open for the test's duration.
async fn register_device(registry: &DeviceRegistry, name: &str, addr: &str) -> TcpStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    let (remote, accepted) = tokio::join!(TcpStream::connect(local_addr), listener.accept());

    let port = registry.reserve_port().unwrap();
    let device = Device::new(
        accepted.unwrap().0,
        port,
        name,
        addr,
        Duration::from_secs(30),
    );
    registry.add(addr.to_string(), Arc::new(device)).await;

    remote.unwrap()
}

async fn get_json<T: serde::de::DeserializeOwned>(app: Router, uri: &str) -> (StatusCode, T) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("application/json"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_empty_listing() {
    let registry = Arc::new(DeviceRegistry::new(PortRange::new(8990, 9000).unwrap()));
    let app = create_test_router(registry);

    let (status, list): (_, DeviceList) = get_json(app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.devices.is_empty());
}

#[tokio::test]
async fn test_listing_reports_registered_devices() {
    let registry = Arc::new(DeviceRegistry::new(PortRange::new(8990, 9000).unwrap()));
    let _first = register_device(&registry, "pixel", "10.0.0.5").await;
    let _second = register_device(&registry, "tablet", "10.0.0.6").await;

    for uri in ["/", "/api/devices"] {
        let (status, list): (_, DeviceList) =
            get_json(create_test_router(registry.clone()), uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            list.devices,
            vec![
                DeviceEntry {
                    proxy_port: "8990".to_string(),
                    device_name: "pixel".to_string(),
                    device_addr: "10.0.0.5".to_string(),
                },
                DeviceEntry {
                    proxy_port: "8991".to_string(),
                    device_name: "tablet".to_string(),
                    device_addr: "10.0.0.6".to_string(),
                },
            ]
        );
    }
}

#[tokio::test]
async fn test_listing_drops_torn_down_devices() {
    let registry = Arc::new(DeviceRegistry::new(PortRange::new(8990, 9000).unwrap()));
    let _remote = register_device(&registry, "pixel", "10.0.0.5").await;

    let device = registry.get("10.0.0.5").await.unwrap();
    registry.teardown(&device).await;

    let (_, list): (_, DeviceList) = get_json(create_test_router(registry), "/").await;
    assert!(list.devices.is_empty());
}

#[tokio::test]
async fn test_health_check() {
    let registry = Arc::new(DeviceRegistry::new(PortRange::new(8990, 8992).unwrap()));
    let _remote = register_device(&registry, "pixel", "10.0.0.5").await;

    let (status, health): (_, HealthResponse) =
        get_json(create_test_router(registry), "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health.status, "healthy");
    assert_eq!(health.active_devices, 1);
    assert_eq!(health.free_ports, 2);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let registry = Arc::new(DeviceRegistry::new(PortRange::new(8990, 9000).unwrap()));
    let request = Request::builder()
        .uri("/api/unknown")
        .body(Body::empty())
        .unwrap();

    let response = create_test_router(registry).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
