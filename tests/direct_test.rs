// Direct relay against a fake upstream that supports Range requests.

mod common;

use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use ma_relay_engine::server::RelayState;
use serde_json::Value;

use common::{start_relay, FakeFactory, ReadyMode};

const CONTENT_SIZE: usize = 256 * 1024;

/// Generate deterministic test content.
fn generate_content() -> Vec<u8> {
    (0..CONTENT_SIZE).map(|i| (i % 256) as u8).collect()
}

/// Fake upstream: honors `bytes=start-end` / `bytes=start-`, echoes the user agent.
async fn fake_upstream_handler(req: Request) -> impl IntoResponse {
    let content = generate_content();
    let total = content.len() as u64;
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .map(|s| s.to_string());

    match range {
        Some(rest) => {
            let mut parts = rest.splitn(2, '-');
            let start: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
            let end: u64 = match parts.next() {
                Some(e) if !e.is_empty() => e.parse().unwrap_or(total - 1),
                _ => total - 1,
            };
            let end = end.min(total - 1);
            let slice = content[start as usize..=end as usize].to_vec();
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, "audio/mpeg".to_string()),
                    (header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}")),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::HeaderName::from_static("x-seen-ua"), user_agent),
                ],
                slice,
            )
                .into_response()
        }
        None => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "audio/mpeg".to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::HeaderName::from_static("x-seen-ua"), user_agent),
            ],
            content,
        )
            .into_response(),
    }
}

/// Sends a few bytes, then never another.
async fn stalling_handler() -> Body {
    let head = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"abc"))]);
    Body::from_stream(head.chain(futures::stream::pending()))
}

/// Wait until no transfer is in flight and no lease is held.
async fn settle(state: &RelayState) {
    for _ in 0..100 {
        let leased = state.store.list().iter().any(|s| s.active_leases > 0);
        if state.stats.snapshot().active_transfers == 0 && !leased {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn create_direct(client: &reqwest::Client, relay: &str, url: &str) -> reqwest::Response {
    client
        .post(format!("{relay}/api/direct"))
        .json(&serde_json::json!({ "url": url }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_direct_relay_ranges() {
    let origin =
        common::spawn_upstream(Router::new().route("/file", get(fake_upstream_handler))).await;
    let (server, state) = start_relay(FakeFactory::new(ReadyMode::Immediate)).await;
    let client = reqwest::Client::new();

    let created: Value = create_direct(&client, &server.url(""), &format!("{origin}/file"))
        .await
        .json()
        .await
        .unwrap();
    let id = created["sessionId"].as_str().unwrap();
    let stream_path = created["streamPath"].as_str().unwrap();
    assert_eq!(stream_path, format!("/api/direct/{id}/stream"));
    let stream_url = server.url(stream_path);

    let resp = client
        .get(&stream_url)
        .header(header::RANGE, "bytes=0-1023")
        .header(header::USER_AGENT, "TestPlayer/2.0")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers()[header::CONTENT_RANGE],
        format!("bytes 0-1023/{CONTENT_SIZE}").as_str()
    );
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "audio/mpeg");
    // Only the streaming subset of upstream headers is mirrored.
    assert!(!resp.headers().contains_key("x-seen-ua"));
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &generate_content()[..1024]);

    let resp = client
        .get(&stream_url)
        .header(header::RANGE, "bytes=1000-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.bytes().await.unwrap().len(), CONTENT_SIZE - 1000);

    let resp = client.get(&stream_url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()[header::CONTENT_LENGTH],
        CONTENT_SIZE.to_string().as_str()
    );
    assert_eq!(resp.bytes().await.unwrap().len(), CONTENT_SIZE);

    // The relay may finish its side just after the client has every byte.
    for _ in 0..50 {
        if state.stats.snapshot().active_transfers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stats = state.stats.snapshot();
    assert_eq!(stats.completed_transfers, 3);
    assert_eq!(stats.active_transfers, 0);
    assert_eq!(
        stats.served_bytes,
        (1024 + CONTENT_SIZE - 1000 + CONTENT_SIZE) as u64
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_direct_upstream_unreachable_is_bad_gateway() {
    // Bind then drop a listener so the port is very likely closed.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (server, _state) = start_relay(FakeFactory::new(ReadyMode::Immediate)).await;
    let client = reqwest::Client::new();

    let created: Value = create_direct(
        &client,
        &server.url(""),
        &format!("http://127.0.0.1:{port}/file"),
    )
    .await
    .json()
    .await
    .unwrap();
    let id = created["sessionId"].as_str().unwrap();

    let resp = client
        .get(server.url(&format!("/api/direct/{id}/stream")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], 502);
}

#[tokio::test]
async fn test_direct_rejects_bad_urls_and_unknown_sessions() {
    let (server, _state) = start_relay(FakeFactory::new(ReadyMode::Immediate)).await;
    let client = reqwest::Client::new();

    let resp = create_direct(&client, &server.url(""), "file:///etc/passwd").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .get(server.url("/api/direct/nonexistent/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stalled_upstream_body_is_cut_off() {
    let origin =
        common::spawn_upstream(Router::new().route("/stall", get(stalling_handler))).await;
    let (server, state) = start_relay(FakeFactory::new(ReadyMode::Immediate)).await;
    let client = reqwest::Client::new();

    let created: Value = create_direct(&client, &server.url(""), &format!("{origin}/stall"))
        .await
        .json()
        .await
        .unwrap();
    let id = created["sessionId"].as_str().unwrap();

    let resp = client
        .get(server.url(&format!("/api/direct/{id}/stream")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // The relay's upstream timeout is 2s; the body must end well before this.
    let outcome = tokio::time::timeout(Duration::from_secs(10), resp.bytes())
        .await
        .expect("stalled body was never cut off");
    if let Ok(body) = outcome {
        assert_eq!(body.as_ref(), b"abc");
    }

    settle(&state).await;
    let stats = state.stats.snapshot();
    assert_eq!(stats.failed_transfers, 1);
    assert_eq!(stats.active_transfers, 0);
    assert_eq!(state.store.list()[0].active_leases, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_disconnect_releases_lease() {
    let origin =
        common::spawn_upstream(Router::new().route("/stall", get(stalling_handler))).await;
    let (server, state) = start_relay(FakeFactory::new(ReadyMode::Immediate)).await;
    let client = reqwest::Client::new();

    let created: Value = create_direct(&client, &server.url(""), &format!("{origin}/stall"))
        .await
        .json()
        .await
        .unwrap();
    let id = created["sessionId"].as_str().unwrap().to_string();

    let mut resp = client
        .get(server.url(&format!("/api/direct/{id}/stream")))
        .send()
        .await
        .unwrap();
    let first = resp.chunk().await.unwrap().unwrap();
    assert_eq!(first.as_ref(), b"abc");
    assert_eq!(state.store.list()[0].active_leases, 1);

    drop(resp);
    settle(&state).await;
    assert_eq!(state.stats.snapshot().active_transfers, 0);
    assert_eq!(state.store.list()[0].active_leases, 0);
    assert!(state.store.contains(&id));

    server.shutdown().await;
}
