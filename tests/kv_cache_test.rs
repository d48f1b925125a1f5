//! Tests for the chunked key-value cache format: entry layout, round trips,
//! manifest arithmetic, range slicing, and read-side degradation to miss.

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::BodyExt;
use hyper::{HeaderMap, StatusCode};
use object_gateway::config::ChunkedCacheConfig;
use object_gateway::kv_cache::{ChunkedKvCache, EntryDescriptor};
use object_gateway::memory::MemoryKvStore;
use object_gateway::stores::{ByteStream, KvStore};
use std::collections::HashMap;
use std::sync::Arc;

fn small_config() -> ChunkedCacheConfig {
    ChunkedCacheConfig {
        single_entry_max: 32,
        chunk_size: 32,
        total_max: 10_000,
        min_read_ttl: 60,
        min_write_ttl: 60,
    }
}

fn cache_with(config: ChunkedCacheConfig) -> (ChunkedKvCache, Arc<MemoryKvStore>) {
    let kv = Arc::new(MemoryKvStore::new());
    (ChunkedKvCache::new(kv.clone(), config), kv)
}

fn descriptor(len: u64) -> EntryDescriptor {
    let mut preserved = HashMap::new();
    preserved.insert("cache-control".to_string(), "public, max-age=3600".to_string());
    EntryDescriptor {
        content_type: "application/octet-stream".to_string(),
        content_length: len,
        etag: "\"deadbeef\"".to_string(),
        preserved_headers: preserved,
    }
}

fn pattern(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

fn frames_of(data: &Bytes, frame: usize) -> ByteStream {
    let frames: Vec<object_gateway::Result<Bytes>> = (0..data.len())
        .step_by(frame.max(1))
        .map(|start| Ok(data.slice(start..(start + frame).min(data.len()))))
        .collect();
    futures::stream::iter(frames).boxed()
}

fn range_headers(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("range", value.parse().unwrap());
    headers
}

async fn body_of(response: hyper::Response<object_gateway::stores::ResponseBody>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn single_entry_round_trip_is_byte_identical() {
    let (cache, kv) = cache_with(small_config());
    let data = pattern(20);

    cache
        .write_buffered("https://h/x.bin", data.clone(), &descriptor(20), 3600)
        .await
        .unwrap();

    assert!(kv.contains("https://h/x.bin"));
    assert!(kv.contains("https://h/x.bin_body"));

    let response = cache
        .match_request("https://h/x.bin", &HeaderMap::new())
        .await
        .unwrap()
        .expect("expected a cache hit");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-kv-cache-status").unwrap(), "HIT");
    assert_eq!(response.headers().get("etag").unwrap(), "\"deadbeef\"");
    assert_eq!(response.headers().get("content-length").unwrap(), "20");
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=3600"
    );
    assert_eq!(body_of(response).await, data);
}

#[tokio::test]
async fn chunked_round_trip_and_manifest_arithmetic() {
    let (cache, kv) = cache_with(small_config());
    let data = pattern(100); // 32 + 32 + 32 + 4

    cache
        .write_buffered("https://h/big.bin", data.clone(), &descriptor(100), 3600)
        .await
        .unwrap();

    for i in 0..4 {
        assert!(kv.contains(&format!("https://h/big.bin_chunk_{}", i)), "chunk {} missing", i);
    }
    assert!(!kv.contains("https://h/big.bin_body"));

    let (manifest, _) = kv
        .get_with_metadata("https://h/big.bin", 60)
        .await
        .unwrap()
        .unwrap();
    let manifest: serde_json::Value = serde_json::from_slice(&manifest).unwrap();
    assert_eq!(manifest["chunkCount"], 4);
    assert_eq!(manifest["totalSize"], 100);
    let sizes: Vec<u64> = manifest["chunkSizes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    assert_eq!(sizes, vec![32, 32, 32, 4]);
    assert_eq!(sizes.iter().sum::<u64>(), 100);

    let response = cache
        .match_request("https://h/big.bin", &HeaderMap::new())
        .await
        .unwrap()
        .expect("expected a cache hit");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-length").unwrap(), "100");
    assert_eq!(body_of(response).await, data);
}

#[tokio::test]
async fn streaming_write_crosses_chunk_boundaries() {
    let (cache, kv) = cache_with(small_config());
    let data = pattern(100);

    // 48-byte frames do not line up with the 32-byte chunk width
    cache
        .write_stream("https://h/s.bin", frames_of(&data, 48), 100, &descriptor(100), 3600)
        .await
        .unwrap();

    let chunk0 = kv.get_bytes("https://h/s.bin_chunk_0", 60).await.unwrap().unwrap();
    let chunk3 = kv.get_bytes("https://h/s.bin_chunk_3", 60).await.unwrap().unwrap();
    assert_eq!(chunk0, data.slice(0..32));
    assert_eq!(chunk3, data.slice(96..100));

    let response = cache
        .match_request("https://h/s.bin", &HeaderMap::new())
        .await
        .unwrap()
        .expect("expected a cache hit");
    assert_eq!(body_of(response).await, data);
}

#[tokio::test]
async fn streaming_write_of_small_body_uses_single_entry() {
    let (cache, kv) = cache_with(small_config());
    let data = pattern(20);

    cache
        .write_stream("https://h/small.bin", frames_of(&data, 7), 20, &descriptor(20), 3600)
        .await
        .unwrap();

    assert!(kv.contains("https://h/small.bin_body"));
    assert!(!kv.contains("https://h/small.bin_chunk_0"));
}

#[tokio::test]
async fn range_read_slices_across_chunks() {
    let (cache, _) = cache_with(small_config());
    let data = pattern(100);
    cache
        .write_buffered("https://h/r.bin", data.clone(), &descriptor(100), 3600)
        .await
        .unwrap();

    // Bytes 30..=70 touch chunks 0, 1 and 2
    let response = cache
        .match_request("https://h/r.bin", &range_headers("bytes=30-70"))
        .await
        .unwrap()
        .expect("expected a cache hit");
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        "bytes 30-70/100"
    );
    assert_eq!(response.headers().get("content-length").unwrap(), "41");
    assert_eq!(body_of(response).await, data.slice(30..=70));
}

#[tokio::test]
async fn suffix_range_reads_tail() {
    let (cache, _) = cache_with(small_config());
    let data = pattern(100);
    cache
        .write_buffered("https://h/t.bin", data.clone(), &descriptor(100), 3600)
        .await
        .unwrap();

    let response = cache
        .match_request("https://h/t.bin", &range_headers("bytes=-10"))
        .await
        .unwrap()
        .expect("expected a cache hit");
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        "bytes 90-99/100"
    );
    assert_eq!(body_of(response).await, data.slice(90..100));
}

#[tokio::test]
async fn bad_ranges_fall_back_to_full_body() {
    let (cache, _) = cache_with(small_config());
    let data = pattern(100);
    cache
        .write_buffered("https://h/f.bin", data.clone(), &descriptor(100), 3600)
        .await
        .unwrap();

    for value in ["bytes=500-600", "bytes=zz", "bytes=0-10,20-30"] {
        let response = cache
            .match_request("https://h/f.bin", &range_headers(value))
            .await
            .unwrap()
            .expect("expected a cache hit");
        assert_eq!(response.status(), StatusCode::OK, "for {}", value);
        assert_eq!(body_of(response).await, data, "for {}", value);
    }
}

#[tokio::test]
async fn single_entry_range_read() {
    let (cache, _) = cache_with(small_config());
    let data = pattern(30);
    cache
        .write_buffered("https://h/se.bin", data.clone(), &descriptor(30), 3600)
        .await
        .unwrap();

    let response = cache
        .match_request("https://h/se.bin", &range_headers("bytes=5-14"))
        .await
        .unwrap()
        .expect("expected a cache hit");
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        "bytes 5-14/30"
    );
    assert_eq!(body_of(response).await, data.slice(5..15));
}

#[tokio::test]
async fn missing_metadata_is_a_miss() {
    let (cache, _) = cache_with(small_config());
    let hit = cache
        .match_request("https://h/nothing.bin", &HeaderMap::new())
        .await
        .unwrap();
    assert!(hit.is_none());
}

#[tokio::test]
async fn missing_body_companion_is_a_miss() {
    let (cache, kv) = cache_with(small_config());
    cache
        .write_buffered("https://h/m.bin", pattern(20), &descriptor(20), 3600)
        .await
        .unwrap();

    kv.remove("https://h/m.bin_body");
    let hit = cache.match_request("https://h/m.bin", &HeaderMap::new()).await.unwrap();
    assert!(hit.is_none());
}

#[tokio::test]
async fn body_length_mismatch_is_a_miss() {
    let (cache, kv) = cache_with(small_config());
    cache
        .write_buffered("https://h/l.bin", pattern(20), &descriptor(20), 3600)
        .await
        .unwrap();

    // Overwrite the body with fewer bytes than the metadata declares
    kv.put(
        "https://h/l.bin_body",
        pattern(10),
        object_gateway::stores::KvPutOptions {
            metadata: None,
            expiration_ttl: Some(60),
        },
    )
    .await
    .unwrap();

    let hit = cache.match_request("https://h/l.bin", &HeaderMap::new()).await.unwrap();
    assert!(hit.is_none());
}

#[tokio::test]
async fn corrupt_manifest_surfaces_a_distinct_error() {
    let (cache, kv) = cache_with(small_config());
    cache
        .write_buffered("https://h/c.bin", pattern(100), &descriptor(100), 3600)
        .await
        .unwrap();
    let (_, metadata) = kv
        .get_with_metadata("https://h/c.bin", 60)
        .await
        .unwrap()
        .unwrap();

    // A chunked entry whose manifest lost its chunk fields is corruption,
    // not a miss
    let corrupt_values: &[&[u8]] = &[
        b"{}",
        b"not json at all",
        br#"{"totalSize":100,"chunkCount":5,"chunkSizes":[32,32,32,4]}"#,
    ];
    for value in corrupt_values {
        kv.put(
            "https://h/c.bin",
            Bytes::from_static(value),
            object_gateway::stores::KvPutOptions {
                metadata: metadata.clone(),
                expiration_ttl: Some(60),
            },
        )
        .await
        .unwrap();

        let result = cache.match_request("https://h/c.bin", &HeaderMap::new()).await;
        assert!(
            matches!(
                result,
                Err(object_gateway::GatewayError::ChunkedManifestInvalid(_))
            ),
            "value {:?} should read as manifest corruption",
            String::from_utf8_lossy(value)
        );
    }
}

#[tokio::test]
async fn stale_entry_is_a_miss() {
    let (cache, _) = cache_with(small_config());
    cache
        .write_buffered("https://h/old.bin", pattern(20), &descriptor(20), 0)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let hit = cache.match_request("https://h/old.bin", &HeaderMap::new()).await.unwrap();
    assert!(hit.is_none(), "entry past its max_age should read as a miss");
}

#[tokio::test]
async fn oversized_buffered_write_is_skipped() {
    let mut config = small_config();
    config.total_max = 50;
    let (cache, kv) = cache_with(config);

    cache
        .write_buffered("https://h/huge.bin", pattern(80), &descriptor(80), 3600)
        .await
        .unwrap();

    assert!(kv.keys().is_empty(), "no keys should be written past the cap");
}

#[tokio::test]
async fn oversized_streaming_write_is_refused() {
    let mut config = small_config();
    config.total_max = 50;
    let (cache, kv) = cache_with(config);
    let data = pattern(80);

    let result = cache
        .write_stream("https://h/huge.bin", frames_of(&data, 16), 80, &descriptor(80), 3600)
        .await;
    assert!(matches!(result, Err(object_gateway::GatewayError::SizeCapExceeded(_))));
    assert!(kv.keys().is_empty());
}

#[tokio::test]
async fn short_stream_writes_no_manifest() {
    let (cache, kv) = cache_with(small_config());
    let data = pattern(50);

    // Declared 100 bytes, delivered 50: the entry must stay invisible
    let result = cache
        .write_stream("https://h/cut.bin", frames_of(&data, 16), 100, &descriptor(100), 3600)
        .await;
    assert!(result.is_err());
    assert!(!kv.contains("https://h/cut.bin"));

    let hit = cache.match_request("https://h/cut.bin", &HeaderMap::new()).await.unwrap();
    assert!(hit.is_none());
}

#[tokio::test]
async fn errored_stream_writes_no_manifest() {
    let (cache, kv) = cache_with(small_config());
    let frames: Vec<object_gateway::Result<Bytes>> = vec![
        Ok(pattern(40)),
        Err(object_gateway::GatewayError::OriginTransport("reset".to_string())),
    ];
    let stream: ByteStream = futures::stream::iter(frames).boxed();

    let result = cache
        .write_stream("https://h/err.bin", stream, 100, &descriptor(100), 3600)
        .await;
    assert!(result.is_err());
    assert!(!kv.contains("https://h/err.bin"));
}

#[tokio::test]
async fn recommended_constants_chunk_a_60_mib_body() {
    // Uses the default 20 MiB chunk width end-to-end
    let config = ChunkedCacheConfig::default();
    let (cache, kv) = cache_with(config);
    const MIB: usize = 1024 * 1024;
    let data = pattern(60 * MIB);

    cache
        .write_stream(
            "https://h/big60.bin",
            frames_of(&data, 256 * 1024),
            (60 * MIB) as u64,
            &descriptor((60 * MIB) as u64),
            3600,
        )
        .await
        .unwrap();

    let (manifest, _) = kv
        .get_with_metadata("https://h/big60.bin", 60)
        .await
        .unwrap()
        .unwrap();
    let manifest: serde_json::Value = serde_json::from_slice(&manifest).unwrap();
    assert_eq!(manifest["chunkCount"], 3);
    let sizes: Vec<u64> = manifest["chunkSizes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    assert_eq!(sizes, vec![20 * MIB as u64, 20 * MIB as u64, 20 * MIB as u64]);

    // 1 MiB read inside chunk 2
    let response = cache
        .match_request("https://h/big60.bin", &range_headers("bytes=25165824-26214399"))
        .await
        .unwrap()
        .expect("expected a cache hit");
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        "bytes 25165824-26214399/62914560"
    );
    assert_eq!(body_of(response).await, data.slice(25165824..26214400));
}
