//! Memory Stores Module
//!
//! In-memory implementations of the collaborator handles: a blob store, a
//! key-value store with TTL and metadata blobs, and an edge HTTP cache that
//! synthesizes 206 and 304 responses from stored full-body entries. Used by
//! the dev wiring in `main` and throughout the test suite.

use crate::range;
use crate::stores::{
    empty_body, full_body, BlobFetch, BlobMeta, BlobObject, BlobStore, ByteStream, CachePut,
    EdgeCache, FetchOptions, FetchRange, HttpMetadata, KvPutOptions, KvStore, ResponseBody,
};
use crate::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Response, StatusCode};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_FRAME_SIZE: usize = 64 * 1024;

/// A stored origin object
#[derive(Clone)]
struct StoredBlob {
    data: Bytes,
    etag: String,
    content_type: Option<String>,
    http_metadata: HttpMetadata,
}

/// In-memory blob store
pub struct MemoryBlobStore {
    objects: DashMap<String, StoredBlob>,
    /// Frame width used when streaming bodies out
    frame_size: usize,
    fetch_count: AtomicU64,
    fail_next: AtomicU32,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            frame_size: DEFAULT_FRAME_SIZE,
            fetch_count: AtomicU64::new(0),
            fail_next: AtomicU32::new(0),
        }
    }

    pub fn with_frame_size(frame_size: usize) -> Self {
        Self {
            frame_size,
            ..Self::new()
        }
    }

    /// Store an object, deriving a strong quoted ETag from its bytes
    pub fn put_object(&self, key: &str, data: Bytes, content_type: &str) {
        let etag = compute_etag(&data);
        self.objects.insert(
            key.to_string(),
            StoredBlob {
                data,
                etag,
                content_type: Some(content_type.to_string()),
                http_metadata: HttpMetadata::default(),
            },
        );
    }

    /// Store an object with explicit upload-time HTTP metadata
    pub fn put_object_with_metadata(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        http_metadata: HttpMetadata,
    ) {
        let etag = compute_etag(&data);
        self.objects.insert(
            key.to_string(),
            StoredBlob {
                data,
                etag,
                content_type: Some(content_type.to_string()),
                http_metadata,
            },
        );
    }

    pub fn etag_of(&self, key: &str) -> Option<String> {
        self.objects.get(key).map(|b| b.etag.clone())
    }

    /// Number of fetches served, including failures
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Make the next `n` fetches fail with a transport error
    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn body_stream(&self, data: Bytes) -> ByteStream {
        let frame_size = self.frame_size.max(1);
        let frames: Vec<Result<Bytes>> = (0..data.len())
            .step_by(frame_size)
            .map(|start| {
                let end = (start + frame_size).min(data.len());
                Ok(data.slice(start..end))
            })
            .collect();
        futures::stream::iter(frames).boxed()
    }
}

fn compute_etag(data: &Bytes) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    data.len().hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn fetch(&self, key: &str, opts: FetchOptions) -> Result<BlobFetch> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::OriginTransport("injected failure".to_string()));
        }

        let blob = match self.objects.get(key) {
            Some(entry) => entry.value().clone(),
            None => return Ok(BlobFetch::Missing),
        };

        let meta = BlobMeta {
            key: key.to_string(),
            size: Some(blob.data.len() as u64),
            etag: blob.etag.clone(),
            content_type: blob.content_type.clone(),
            http_metadata: blob.http_metadata.clone(),
        };

        if let Some(cond) = &opts.only_if {
            if let Some(candidate) = &cond.if_none_match {
                if candidate == &blob.etag {
                    return Ok(BlobFetch::NotModified(meta));
                }
            }
        }

        let total = blob.data.len() as u64;
        if let Some(requested) = opts.range {
            let satisfiable = match requested {
                FetchRange::Bounded { offset, length } => offset < total && length > 0,
                FetchRange::From { offset } => offset < total,
                FetchRange::Suffix { length } => length > 0 && total > 0,
            };
            if satisfiable {
                let (start, end) = requested.bounds(total);
                let slice = blob.data.slice(start as usize..=end as usize);
                return Ok(BlobFetch::Found(BlobObject {
                    meta,
                    range: Some(FetchRange::Bounded {
                        offset: start,
                        length: end - start + 1,
                    }),
                    body: self.body_stream(slice),
                }));
            }
            // Unsatisfiable ranges fall back to the full body
        }

        Ok(BlobFetch::Found(BlobObject {
            meta,
            range: None,
            body: self.body_stream(blob.data),
        }))
    }
}

struct KvEntry {
    value: Bytes,
    metadata: Option<Bytes>,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }
}

/// In-memory key-value store with per-key TTL and metadata blobs
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, KvEntry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a key outright (test hook for simulating partial expiry)
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.get(key).map(|e| !e.is_expired()).unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_with_metadata(
        &self,
        key: &str,
        _cache_ttl: u64,
    ) -> Result<Option<(Bytes, Option<Bytes>)>> {
        {
            let entry = match self.entries.get(key) {
                Some(entry) => entry,
                None => return Ok(None),
            };
            if !entry.is_expired() {
                return Ok(Some((entry.value.clone(), entry.metadata.clone())));
            }
        }
        // Expired entries are dropped lazily on read
        self.entries.remove(key);
        Ok(None)
    }

    async fn get_bytes(&self, key: &str, cache_ttl: u64) -> Result<Option<Bytes>> {
        Ok(self
            .get_with_metadata(key, cache_ttl)
            .await?
            .map(|(value, _)| value))
    }

    async fn put(&self, key: &str, value: Bytes, opts: KvPutOptions) -> Result<()> {
        let expires_at = opts
            .expiration_ttl
            .map(|ttl| Instant::now() + Duration::from_secs(ttl));
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                metadata: opts.metadata,
                expires_at,
            },
        );
        Ok(())
    }
}

struct EdgeEntry {
    headers: Vec<(String, String)>,
    body: Bytes,
    etag: Option<String>,
}

/// In-memory edge HTTP cache. Stores only full 200 responses under a
/// per-entry size cap and synthesizes 206/304 on lookup, the way an edge
/// cache does natively.
pub struct MemoryEdgeCache {
    entries: DashMap<String, EdgeEntry>,
    cap: u64,
}

impl MemoryEdgeCache {
    pub fn new(cap: u64) -> Self {
        Self {
            entries: DashMap::new(),
            cap,
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Evict a stored entry (test hook)
    pub fn purge(&self, url: &str) {
        self.entries.remove(url);
    }

    fn apply_headers(
        builder: hyper::http::response::Builder,
        headers: &[(String, String)],
        skip_length: bool,
    ) -> hyper::http::response::Builder {
        let mut builder = builder;
        for (name, value) in headers {
            if skip_length && name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }
        builder
    }
}

#[async_trait]
impl EdgeCache for MemoryEdgeCache {
    async fn lookup(
        &self,
        url: &str,
        request_headers: &HeaderMap,
    ) -> Result<Option<Response<ResponseBody>>> {
        let entry = match self.entries.get(url) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let total = entry.body.len() as u64;

        if let (Some(stored), Some(candidate)) = (
            entry.etag.as_deref(),
            request_headers
                .get("if-none-match")
                .and_then(|v| v.to_str().ok()),
        ) {
            if candidate == stored {
                let builder = Self::apply_headers(
                    Response::builder().status(StatusCode::NOT_MODIFIED),
                    &entry.headers,
                    true,
                );
                return Ok(Some(builder.body(empty_body())?));
            }
        }

        if let Some(value) = request_headers.get("range").and_then(|v| v.to_str().ok()) {
            if let Ok(spec) = range::parse(value, total) {
                let slice = entry.body.slice(spec.start as usize..=spec.end as usize);
                let builder = Self::apply_headers(
                    Response::builder().status(StatusCode::PARTIAL_CONTENT),
                    &entry.headers,
                    true,
                )
                .header("content-range", spec.content_range(total))
                .header("content-length", spec.len().to_string());
                return Ok(Some(builder.body(full_body(slice))?));
            }
            // Unparseable or unsatisfiable ranges degrade to the full body
        }

        let builder = Self::apply_headers(Response::builder().status(StatusCode::OK), &entry.headers, false);
        Ok(Some(builder.body(full_body(entry.body.clone()))?))
    }

    async fn put(&self, url: &str, response: CachePut) -> Result<()> {
        if response.content_length > self.cap {
            debug!(url, size = response.content_length, "entry exceeds edge cache cap, skipping");
            return Ok(());
        }

        let mut collected = Vec::with_capacity(response.content_length as usize);
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => collected.extend_from_slice(&bytes),
                Err(e) => {
                    warn!(url, error = %e, "edge cache put aborted mid-stream");
                    return Err(GatewayError::CacheWrite(e.to_string()));
                }
            }
        }
        if collected.len() as u64 != response.content_length {
            return Err(GatewayError::CacheWrite(format!(
                "body ended at {} of {} declared bytes",
                collected.len(),
                response.content_length
            )));
        }

        let etag = response
            .headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        self.entries.insert(
            url.to_string(),
            EdgeEntry {
                headers,
                body: Bytes::from(collected),
                etag,
            },
        );
        Ok(())
    }
}
