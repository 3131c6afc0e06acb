//! HTTP fabric behavior against a local mock server: retries and
//! Retry-After pacing, caching, revalidation, coalescing, size caps,
//! and egress guardrails.

use bytes::Bytes;
use http::{HeaderMap, Method};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use webscan_core::{HttpConfig, ScanErrorKind};
use webscan_engine::{HttpFabric, RequestOptions};
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Loopback-friendly config for talking to the mock server.
fn test_config() -> HttpConfig {
    HttpConfig {
        block_private_networks: false,
        max_retries: 3,
        backoff_base_seconds: 0.05,
        backoff_max_seconds: 0.2,
        bucket_max_tokens: 50.0,
        per_host_initial_rps: 50.0,
        per_host_rps_ceiling: 100.0,
        ..Default::default()
    }
}

fn fabric(config: HttpConfig) -> HttpFabric {
    HttpFabric::new(config).unwrap()
}

#[tokio::test]
async fn test_s4_retry_after_is_honored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
        .mount(&server)
        .await;

    let fabric = fabric(test_config());
    let cancel = CancellationToken::new();
    let started = Instant::now();
    let response = fabric
        .get(&cancel, &format!("{}/limited", server.uri()))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, Bytes::from("recovered"));
    // Two Retry-After: 1 pauses must have been waited out
    assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    let snapshot = fabric.metrics().snapshot();
    assert!(snapshot.retries >= 2);
    assert!(snapshot.throttle_waits >= 2);
    assert!(snapshot.rate_limited >= 2);
}

#[tokio::test]
async fn test_s5_private_target_never_touches_wire() {
    let fabric = fabric(HttpConfig::default()); // block_private_networks on
    let cancel = CancellationToken::new();

    let err = fabric.get(&cancel, "http://127.0.0.1/").await.unwrap_err();
    assert_eq!(err.kind(), ScanErrorKind::EgressBlocked);

    let snapshot = fabric.metrics().snapshot();
    assert_eq!(snapshot.requests_sent, 0);
    assert!(snapshot.egress_blocks >= 1);
}

#[tokio::test]
async fn test_coalescing_identical_gets_single_wire_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("shared")
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let fabric = Arc::new(fabric(test_config()));
    let url = format!("{}/slow", server.uri());

    let mut handles = Vec::new();
    for _ in 0..5 {
        let fabric = Arc::clone(&fabric);
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            fabric.get(&cancel, &url).await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.body, Bytes::from("shared"));
    }

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1, "coalescing must issue one wire request");
    assert_eq!(fabric.metrics().snapshot().coalesced_requests, 4);
}

#[tokio::test]
async fn test_cache_serves_second_get() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cacheable"))
        .respond_with(ResponseTemplate::new(200).set_body_string("cached body"))
        .mount(&server)
        .await;

    let fabric = fabric(test_config());
    let cancel = CancellationToken::new();
    let url = format!("{}/cacheable", server.uri());

    let first = fabric.get(&cancel, &url).await.unwrap();
    assert!(!first.from_cache);

    let second = fabric.get(&cancel, &url).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.body, Bytes::from("cached body"));

    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(fabric.metrics().snapshot().cache_hits, 1);
}

#[tokio::test]
async fn test_no_store_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/volatile"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("fresh")
                .insert_header("Cache-Control", "no-store"),
        )
        .mount(&server)
        .await;

    let fabric = fabric(test_config());
    let cancel = CancellationToken::new();
    let url = format!("{}/volatile", server.uri());

    fabric.get(&cancel, &url).await.unwrap();
    let second = fabric.get(&cancel, &url).await.unwrap();
    assert!(!second.from_cache);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_conditional_revalidation_on_304() {
    let server = MockServer::start().await;
    // First response carries a validator
    Mock::given(method("GET"))
        .and(path("/versioned"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("v1")
                .insert_header("ETag", "\"v1\""),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // Revalidation gets a 304
    Mock::given(method("GET"))
        .and(path("/versioned"))
        .and(header_exists("If-None-Match"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    // TTL zero: every hit after the first is stale and must revalidate
    let fabric = fabric(HttpConfig {
        cache_ttl_seconds: 0,
        ..test_config()
    });
    let cancel = CancellationToken::new();
    let url = format!("{}/versioned", server.uri());

    let first = fabric.get(&cancel, &url).await.unwrap();
    assert_eq!(first.body, Bytes::from("v1"));

    let second = fabric.get(&cancel, &url).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.status, 200);
    assert_eq!(second.body, Bytes::from("v1"));

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_response_size_cap_truncates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/huge"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x41u8; 64 * 1024]))
        .mount(&server)
        .await;

    let fabric = fabric(HttpConfig {
        max_response_bytes: 1024,
        ..test_config()
    });
    let cancel = CancellationToken::new();
    let response = fabric
        .get(&cancel, &format!("{}/huge", server.uri()))
        .await
        .unwrap();

    assert!(response.truncated);
    assert_eq!(response.body.len(), 1024);
    assert_eq!(response.status, 200);
    assert!(fabric.metrics().snapshot().bytes_truncated > 0);
}

#[tokio::test]
async fn test_size_cap_zero_disables_truncation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/huge"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x41u8; 64 * 1024]))
        .mount(&server)
        .await;

    let fabric = fabric(HttpConfig {
        max_response_bytes: 0,
        ..test_config()
    });
    let cancel = CancellationToken::new();
    let response = fabric
        .get(&cancel, &format!("{}/huge", server.uri()))
        .await
        .unwrap();

    assert!(!response.truncated);
    assert_eq!(response.body.len(), 64 * 1024);
}

#[tokio::test]
async fn test_transient_5xx_retried_to_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("finally"))
        .mount(&server)
        .await;

    let fabric = fabric(test_config());
    let cancel = CancellationToken::new();
    let response = fabric
        .get(&cancel, &format!("{}/flaky", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    assert!(fabric.metrics().snapshot().retries >= 2);
}

#[tokio::test]
async fn test_501_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nope"))
        .respond_with(ResponseTemplate::new(501))
        .mount(&server)
        .await;

    let fabric = fabric(test_config());
    let cancel = CancellationToken::new();
    let response = fabric
        .get(&cancel, &format!("{}/nope", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status, 501);
    assert_eq!(response.error_kind(), Some(ScanErrorKind::Status5xx));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_4xx_passes_through_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
        .mount(&server)
        .await;

    let fabric = fabric(test_config());
    let cancel = CancellationToken::new();
    let response = fabric
        .get(&cancel, &format!("{}/missing", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status, 404);
    assert_eq!(response.error_kind(), Some(ScanErrorKind::Status4xx));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_persistent_429_surfaces_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/always-limited"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let fabric = fabric(HttpConfig {
        max_retries: 1,
        ..test_config()
    });
    let cancel = CancellationToken::new();
    let err = fabric
        .get(&cancel, &format!("{}/always-limited", server.uri()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ScanErrorKind::RateLimited);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_host_pacer_slows_after_429() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/limited-once"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/post"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = HttpConfig {
        per_host_initial_rps: 8.0,
        per_host_rps_ceiling: 16.0,
        ..test_config()
    };
    let fabric = fabric(config);
    let cancel = CancellationToken::new();

    let response = fabric
        .get(&cancel, &format!("{}/limited-once", server.uri()))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(fabric.metrics().snapshot().rate_limited >= 1);

    // POST bypasses cache and coalescing but still paces and succeeds
    let response = fabric
        .execute(
            &cancel,
            Method::POST,
            &format!("{}/post", server.uri()),
            HeaderMap::new(),
            Some(Bytes::from("payload")),
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_head_requests_coalesce_separately_from_get() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dual"))
        .respond_with(ResponseTemplate::new(200).set_body_string("get body"))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/dual"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fabric = fabric(test_config());
    let cancel = CancellationToken::new();
    let url = format!("{}/dual", server.uri());

    let get = fabric.get(&cancel, &url).await.unwrap();
    let head = fabric
        .execute(
            &cancel,
            Method::HEAD,
            &url,
            HeaderMap::new(),
            None,
            RequestOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(get.body, Bytes::from("get body"));
    assert!(head.body.is_empty());
    // Different methods are distinct cache keys: two wire requests
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
