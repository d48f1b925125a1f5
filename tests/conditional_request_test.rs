//! Conditional request handling: 304 synthesis from the warm fast tier,
//! origin-validated 304 on bypass, and mismatch behavior.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Method, Request, StatusCode};
use object_gateway::config::GatewayConfig;
use object_gateway::kv_cache::ChunkedKvCache;
use object_gateway::memory::{MemoryBlobStore, MemoryEdgeCache, MemoryKvStore};
use object_gateway::router::BucketRouter;
use object_gateway::service::ObjectService;
use object_gateway::stores::BlobStore;
use std::collections::HashMap;
use std::sync::Arc;

struct Gateway {
    service: ObjectService,
    origin: Arc<MemoryBlobStore>,
}

fn gateway() -> Gateway {
    let mut config = GatewayConfig::default();
    config.storage.retry_delay_ms = 1;

    let origin = Arc::new(MemoryBlobStore::new());
    let mut bindings: HashMap<String, Arc<dyn BlobStore>> = HashMap::new();
    bindings.insert("default".to_string(), origin.clone() as Arc<dyn BlobStore>);
    let router = BucketRouter::new(vec![], "default".to_string(), bindings);

    let edge = Arc::new(MemoryEdgeCache::new(config.cache.fast_cache_cap));
    let kv = Arc::new(MemoryKvStore::new());
    let kv_cache = Arc::new(ChunkedKvCache::new(kv, config.cache.kv.clone()));
    let service = ObjectService::new(Arc::new(config), router, edge, Some(kv_cache));
    Gateway { service, origin }
}

fn deterministic(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<u8>>())
}

fn get(uri: &str) -> Request<()> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("host", "cdn.example")
        .body(())
        .unwrap()
}

fn conditional_get(uri: &str, etag: &str) -> Request<()> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("host", "cdn.example")
        .header("if-none-match", etag)
        .body(())
        .unwrap()
}

async fn body_of(response: hyper::Response<object_gateway::stores::ResponseBody>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn warm_cache_synthesizes_304_with_matching_etag() {
    let gw = gateway();
    gw.origin
        .put_object("x.bin", deterministic(64), "application/octet-stream");

    let first = gw.service.handle(get("/x.bin")).await;
    assert_eq!(first.status(), StatusCode::OK);
    let etag = first
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    body_of(first).await;
    gw.service.background_tasks().wait_idle().await;

    let second = gw.service.handle(conditional_get("/x.bin", &etag)).await;
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(second.headers().get("etag").unwrap().to_str().unwrap(), etag);
    assert!(body_of(second).await.is_empty());
    assert_eq!(gw.origin.fetch_count(), 1, "304 must come from the fast tier");
}

#[tokio::test]
async fn cold_conditional_is_validated_by_the_origin() {
    let gw = gateway();
    gw.origin
        .put_object("x.bin", deterministic(64), "application/octet-stream");
    let etag = gw.origin.etag_of("x.bin").unwrap();

    // No cache entry yet: If-None-Match goes to the origin verbatim
    let response = gw.service.handle(conditional_get("/x.bin", &etag)).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers().get("etag").unwrap().to_str().unwrap(), etag);
    assert!(body_of(response).await.is_empty());
    assert_eq!(gw.origin.fetch_count(), 1);
}

#[tokio::test]
async fn mismatched_etag_serves_full_body() {
    let gw = gateway();
    gw.origin
        .put_object("x.bin", deterministic(64), "application/octet-stream");

    let response = gw
        .service
        .handle(conditional_get("/x.bin", "\"something-else\""))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_of(response).await, deterministic(64));
}

#[tokio::test]
async fn bypass_conditional_revalidates_at_origin() {
    let gw = gateway();
    gw.origin
        .put_object("x.bin", deterministic(64), "application/octet-stream");

    let first = gw.service.handle(get("/x.bin")).await;
    let etag = first
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    body_of(first).await;
    gw.service.background_tasks().wait_idle().await;
    assert_eq!(gw.origin.fetch_count(), 1);

    let response = gw
        .service
        .handle(conditional_get("/x.bin?no-cache", &etag))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(gw.origin.fetch_count(), 2, "bypass must revalidate at the origin");
}
