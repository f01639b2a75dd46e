use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Json, Router};
use peer_mesh::{DiscoveryError, HttpDiscovery, PeerDiscovery};
use tokio::net::TcpListener;

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}

#[tokio::test]
async fn fetches_roster_from_signaling_host() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new().route(
        "/peerjs/peers",
        get({
            let hits = hits.clone();
            move || async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(vec!["peer_a".to_string(), "peer_b".to_string()])
            }
        }),
    );
    let addr = serve(router).await;

    let discovery = HttpDiscovery::new(format!("127.0.0.1:{}", addr.port())).unwrap();
    assert_eq!(discovery.endpoint().scheme(), "http");
    let peers = discovery.list_peers().await.unwrap();
    assert_eq!(peers, vec!["peer_a", "peer_b"]);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_success_status_is_reported() {
    let router = Router::new().route(
        "/peerjs/peers",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
    );
    let addr = serve(router).await;

    let discovery = HttpDiscovery::new(format!("http://{addr}")).unwrap();
    match discovery.list_peers().await {
        Err(DiscoveryError::HttpStatus(status)) => assert_eq!(status.as_u16(), 503),
        other => panic!("expected http status error, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_host_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let discovery = HttpDiscovery::new(format!("http://{addr}")).unwrap();
    assert!(matches!(
        discovery.list_peers().await,
        Err(DiscoveryError::Network(_))
    ));
}
