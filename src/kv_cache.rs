//! Chunked KV Cache Module
//!
//! A storage format layered over the slow key-value store. Small bodies are
//! stored as a single companion entry; large bodies are split into fixed-size
//! chunks enumerated by a JSON manifest. The manifest is the exclusive source
//! of truth for chunk boundaries and is written only after every chunk has
//! been acknowledged, so a reader that sees the manifest sees all chunks.
//!
//! Key layout: `{base}` holds the manifest (or a single-entry sentinel) plus
//! an out-of-band metadata blob; `{base}_body` holds a single-entry body;
//! `{base}_chunk_0 .. {base}_chunk_{N-1}` hold chunk bodies.

use crate::config::ChunkedCacheConfig;
use crate::range::{self, RangeSpec};
use crate::stores::{full_body, stream_body, ByteStream, KvPutOptions, KvStore, ResponseBody};
use crate::{GatewayError, Result};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::StreamExt;
use hyper::{HeaderMap, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Manifest enumerating every chunk of a chunked entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkManifest {
    pub total_size: u64,
    pub chunk_count: u32,
    pub chunk_sizes: Vec<u64>,
}

/// Permissive manifest form used on the read side; a manifest missing its
/// chunk fields is treated as a miss rather than an error
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    chunk_count: Option<u32>,
    #[serde(default)]
    chunk_sizes: Option<Vec<u64>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleEntrySentinel {
    single_entry: bool,
}

/// Metadata blob stored out-of-band with the base key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryMetadata {
    content_type: String,
    content_length: u64,
    etag: String,
    is_chunked: bool,
    /// Write time, epoch milliseconds
    created_at: u64,
    /// Freshness lifetime in seconds
    max_age: u64,
    /// Preserved response headers (Cache-Control, Cache-Tag, Last-Modified,
    /// Content-Disposition, Content-Encoding, Content-Language)
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// What the caller knows about the entry being written
#[derive(Debug, Clone, Default)]
pub struct EntryDescriptor {
    pub content_type: String,
    pub content_length: u64,
    pub etag: String,
    pub preserved_headers: HashMap<String, String>,
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

fn body_key(base: &str) -> String {
    format!("{}_body", base)
}

fn chunk_key(base: &str, index: u32) -> String {
    format!("{}_chunk_{}", base, index)
}

/// One planned chunk read: which chunk, how many bytes it must hold, and
/// which slice of it to emit
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkRead {
    index: u32,
    expected_len: u64,
    slice_from: u64,
    slice_len: u64,
}

/// Plan the chunk reads covering `spec`, or the whole body when `spec` is
/// `None`. Walks the manifest's chunk sizes, the sole authority on
/// boundaries.
fn plan_reads(chunk_sizes: &[u64], spec: Option<RangeSpec>) -> Vec<ChunkRead> {
    let mut plan = Vec::new();
    let mut chunk_start = 0u64;

    for (index, &size) in chunk_sizes.iter().enumerate() {
        let chunk_end = chunk_start + size; // exclusive
        let (want_start, want_end) = match spec {
            Some(spec) => (spec.start, spec.end + 1),
            None => (0, u64::MAX),
        };

        if chunk_end > want_start && chunk_start < want_end {
            let from = want_start.saturating_sub(chunk_start);
            let to = (want_end - chunk_start).min(size);
            plan.push(ChunkRead {
                index: index as u32,
                expected_len: size,
                slice_from: from,
                slice_len: to - from,
            });
        }
        chunk_start = chunk_end;
    }

    plan
}

/// Chunked-KV cache over a key-value store handle
pub struct ChunkedKvCache {
    kv: Arc<dyn KvStore>,
    config: ChunkedCacheConfig,
}

impl ChunkedKvCache {
    pub fn new(kv: Arc<dyn KvStore>, config: ChunkedCacheConfig) -> Self {
        Self { kv, config }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    fn write_ttl(&self, max_age: u64) -> u64 {
        self.config.min_write_ttl.max(max_age)
    }

    fn read_ttl(&self, max_age: u64) -> u64 {
        self.config.min_read_ttl.max(max_age)
    }

    fn metadata_blob(&self, desc: &EntryDescriptor, is_chunked: bool, max_age: u64) -> Result<Bytes> {
        let metadata = EntryMetadata {
            content_type: desc.content_type.clone(),
            content_length: desc.content_length,
            etag: desc.etag.clone(),
            is_chunked,
            created_at: now_ms(),
            max_age,
            headers: desc.preserved_headers.clone(),
        };
        Ok(Bytes::from(serde_json::to_vec(&metadata)?))
    }

    async fn write_single_entry(
        &self,
        base_key: &str,
        bytes: Bytes,
        desc: &EntryDescriptor,
        max_age: u64,
    ) -> Result<()> {
        let ttl = self.write_ttl(max_age);
        let sentinel = Bytes::from(serde_json::to_vec(&SingleEntrySentinel { single_entry: true })?);
        let metadata = self.metadata_blob(desc, false, max_age)?;
        let body_entry = body_key(base_key);

        let meta_put = self.kv.put(
            base_key,
            sentinel,
            KvPutOptions {
                metadata: Some(metadata),
                expiration_ttl: Some(ttl),
            },
        );
        let body_put = self.kv.put(
            &body_entry,
            bytes,
            KvPutOptions {
                metadata: None,
                expiration_ttl: Some(ttl),
            },
        );
        futures::try_join!(meta_put, body_put)?;
        Ok(())
    }

    /// Write a fully buffered body. Bodies over the total cap are skipped
    /// silently; cache writes never fail the request.
    pub async fn write_buffered(
        &self,
        base_key: &str,
        bytes: Bytes,
        desc: &EntryDescriptor,
        max_age: u64,
    ) -> Result<()> {
        let total = bytes.len() as u64;
        if total > self.config.total_max {
            debug!(base_key, total, "body exceeds cache total cap, skipping");
            return Ok(());
        }

        if total <= self.config.single_entry_max {
            return self.write_single_entry(base_key, bytes, desc, max_age).await;
        }

        let ttl = self.write_ttl(max_age);
        let chunk_size = self.config.chunk_size as usize;
        let mut chunk_sizes = Vec::new();
        let mut puts: Vec<BoxFuture<'static, Result<()>>> = Vec::new();

        for (index, start) in (0..bytes.len()).step_by(chunk_size).enumerate() {
            let end = (start + chunk_size).min(bytes.len());
            let slice = bytes.slice(start..end);
            chunk_sizes.push(slice.len() as u64);
            let kv = Arc::clone(&self.kv);
            let key = chunk_key(base_key, index as u32);
            puts.push(Box::pin(async move {
                kv.put(
                    &key,
                    slice,
                    KvPutOptions {
                        metadata: None,
                        expiration_ttl: Some(ttl),
                    },
                )
                .await
            }));
        }

        let manifest = ChunkManifest {
            total_size: total,
            chunk_count: chunk_sizes.len() as u32,
            chunk_sizes,
        };
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest)?);
        let metadata = self.metadata_blob(desc, true, max_age)?;
        let kv = Arc::clone(&self.kv);
        let base = base_key.to_string();
        puts.push(Box::pin(async move {
            kv.put(
                &base,
                manifest_bytes,
                KvPutOptions {
                    metadata: Some(metadata),
                    expiration_ttl: Some(ttl),
                },
            )
            .await
        }));

        futures::future::try_join_all(puts).await?;
        Ok(())
    }

    /// Write a body from a stream without buffering it whole.
    ///
    /// Bodies at or below the single-entry cutoff are drained and stored as
    /// one entry. Larger bodies are accumulated one chunk at a time: when the
    /// accumulator fills it is frozen, its upload is issued, and a fresh
    /// buffer is allocated, so an in-flight upload never aliases bytes still
    /// being written. The manifest goes last, after every chunk acknowledges.
    pub async fn write_stream(
        &self,
        base_key: &str,
        stream: ByteStream,
        total_size: u64,
        desc: &EntryDescriptor,
        max_age: u64,
    ) -> Result<()> {
        if total_size > self.config.total_max {
            return Err(GatewayError::SizeCapExceeded(format!(
                "{} bytes exceeds cache cap {}",
                total_size, self.config.total_max
            )));
        }

        if total_size <= self.config.single_entry_max {
            let bytes = drain_stream(stream, total_size).await?;
            return self.write_single_entry(base_key, bytes, desc, max_age).await;
        }

        let ttl = self.write_ttl(max_age);
        let chunk_size = self.config.chunk_size as usize;
        let mut stream = stream;
        let mut acc = BytesMut::with_capacity(chunk_size);
        let mut chunk_index = 0u32;
        let mut chunk_sizes: Vec<u64> = Vec::new();
        let mut bytes_seen = 0u64;
        let mut uploads: Vec<JoinHandle<Result<()>>> = Vec::new();

        while let Some(frame) = stream.next().await {
            let mut data = frame.map_err(|e| GatewayError::CacheWrite(e.to_string()))?;
            bytes_seen += data.len() as u64;

            // One frame can cross several chunk boundaries
            while !data.is_empty() {
                let room = chunk_size - acc.len();
                let take = room.min(data.len());
                acc.extend_from_slice(&data.split_to(take));

                if acc.len() == chunk_size {
                    let chunk = acc.freeze();
                    acc = BytesMut::with_capacity(chunk_size);
                    chunk_sizes.push(chunk.len() as u64);
                    uploads.push(self.spawn_chunk_upload(base_key, chunk_index, chunk, ttl));
                    chunk_index += 1;
                }
            }
        }

        if !acc.is_empty() {
            let chunk = acc.freeze();
            chunk_sizes.push(chunk.len() as u64);
            uploads.push(self.spawn_chunk_upload(base_key, chunk_index, chunk, ttl));
        }

        if bytes_seen != total_size {
            // Abandon the entry: without a manifest the chunks are invisible
            // and expire on their own
            for upload in &uploads {
                upload.abort();
            }
            return Err(GatewayError::CacheWrite(format!(
                "stream ended at {} of {} declared bytes",
                bytes_seen, total_size
            )));
        }

        for upload in uploads {
            upload
                .await
                .map_err(|e| GatewayError::CacheWrite(format!("chunk upload task failed: {}", e)))??;
        }

        let manifest = ChunkManifest {
            total_size,
            chunk_count: chunk_sizes.len() as u32,
            chunk_sizes,
        };
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest)?);
        let metadata = self.metadata_blob(desc, true, max_age)?;
        self.kv
            .put(
                base_key,
                manifest_bytes,
                KvPutOptions {
                    metadata: Some(metadata),
                    expiration_ttl: Some(ttl),
                },
            )
            .await?;
        Ok(())
    }

    fn spawn_chunk_upload(
        &self,
        base_key: &str,
        index: u32,
        chunk: Bytes,
        ttl: u64,
    ) -> JoinHandle<Result<()>> {
        let kv = Arc::clone(&self.kv);
        let key = chunk_key(base_key, index);
        tokio::spawn(async move {
            kv.put(
                &key,
                chunk,
                KvPutOptions {
                    metadata: None,
                    expiration_ttl: Some(ttl),
                },
            )
            .await
        })
    }

    /// Look up a cached response. Returns `Ok(None)` on any miss. A
    /// structurally invalid chunk manifest surfaces as
    /// `ChunkedManifestInvalid` so corruption is distinguishable from a
    /// plain miss; callers log it and degrade to a miss, never failing the
    /// request.
    pub async fn match_request(
        &self,
        base_key: &str,
        request_headers: &HeaderMap,
    ) -> Result<Option<Response<ResponseBody>>> {
        let (value, metadata_blob) = match self
            .kv
            .get_with_metadata(base_key, self.config.min_read_ttl)
            .await?
        {
            Some(found) => found,
            None => return Ok(None),
        };

        let metadata_blob = match metadata_blob {
            Some(blob) => blob,
            None => {
                debug!(base_key, "cache entry has no metadata blob, treating as miss");
                return Ok(None);
            }
        };
        let metadata: EntryMetadata = match serde_json::from_slice(&metadata_blob) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(base_key, error = %e, "unreadable cache metadata, treating as miss");
                return Ok(None);
            }
        };

        // TTL is the primary expiry; this guards against stores that keep
        // entries past their requested lifetime
        if now_ms().saturating_sub(metadata.created_at) > metadata.max_age * 1000 {
            debug!(base_key, "cache entry past max_age, treating as miss");
            return Ok(None);
        }

        let body_ttl = self.read_ttl(metadata.max_age);
        let requested_range = request_headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        if metadata.is_chunked {
            self.serve_chunked(base_key, &metadata, &value, requested_range.as_deref(), body_ttl)
                .await
        } else {
            self.serve_single(base_key, &metadata, requested_range.as_deref(), body_ttl)
                .await
        }
    }

    async fn serve_single(
        &self,
        base_key: &str,
        metadata: &EntryMetadata,
        requested_range: Option<&str>,
        body_ttl: u64,
    ) -> Result<Option<Response<ResponseBody>>> {
        let body = match self.kv.get_bytes(&body_key(base_key), body_ttl).await? {
            Some(body) => body,
            None => {
                debug!(base_key, "cache body missing, treating as miss");
                return Ok(None);
            }
        };
        if body.len() as u64 != metadata.content_length {
            warn!(
                base_key,
                stored = body.len(),
                expected = metadata.content_length,
                "cache body length mismatch, treating as miss"
            );
            return Ok(None);
        }

        let total = metadata.content_length;
        if let Some(value) = requested_range {
            if let Ok(spec) = range::parse(value, total) {
                let slice = body.slice(spec.start as usize..=spec.end as usize);
                let response = hit_response(StatusCode::PARTIAL_CONTENT, metadata)
                    .header("content-length", spec.len().to_string())
                    .header("content-range", spec.content_range(total))
                    .body(full_body(slice))?;
                return Ok(Some(response));
            }
            // Bad ranges degrade to the full body
        }

        let response = hit_response(StatusCode::OK, metadata)
            .header("content-length", total.to_string())
            .body(full_body(body))?;
        Ok(Some(response))
    }

    async fn serve_chunked(
        &self,
        base_key: &str,
        metadata: &EntryMetadata,
        manifest_value: &Bytes,
        requested_range: Option<&str>,
        body_ttl: u64,
    ) -> Result<Option<Response<ResponseBody>>> {
        let raw: RawManifest = serde_json::from_slice(manifest_value).map_err(|e| {
            GatewayError::ChunkedManifestInvalid(format!(
                "unreadable manifest for {}: {}",
                base_key, e
            ))
        })?;
        let (chunk_count, chunk_sizes) = match (raw.chunk_count, raw.chunk_sizes) {
            (Some(count), Some(sizes)) => (count, sizes),
            _ => {
                return Err(GatewayError::ChunkedManifestInvalid(format!(
                    "manifest for {} missing chunk fields",
                    base_key
                )));
            }
        };
        if chunk_count as usize != chunk_sizes.len() {
            return Err(GatewayError::ChunkedManifestInvalid(format!(
                "manifest for {} declares {} chunks but lists {}",
                base_key,
                chunk_count,
                chunk_sizes.len()
            )));
        }

        let total: u64 = chunk_sizes.iter().sum();
        let spec = requested_range.and_then(|value| range::parse(value, total).ok());

        let plan = plan_reads(&chunk_sizes, spec);
        let content_length: u64 = plan.iter().map(|read| read.slice_len).sum();
        let body = chunk_stream(Arc::clone(&self.kv), base_key.to_string(), body_ttl, plan);

        let builder = match spec {
            Some(spec) => hit_response(StatusCode::PARTIAL_CONTENT, metadata)
                .header("content-length", content_length.to_string())
                .header("content-range", spec.content_range(total)),
            None => {
                hit_response(StatusCode::OK, metadata).header("content-length", total.to_string())
            }
        };
        Ok(Some(builder.body(stream_body(body))?))
    }
}

/// Shared header set for every slow-tier hit
fn hit_response(status: StatusCode, metadata: &EntryMetadata) -> hyper::http::response::Builder {
    let mut builder = Response::builder()
        .status(status)
        .header("content-type", metadata.content_type.as_str())
        .header("accept-ranges", "bytes")
        .header("x-content-type-options", "nosniff")
        .header("x-kv-cache-status", "HIT");
    if !metadata.etag.is_empty() {
        builder = builder.header("etag", metadata.etag.as_str());
    }
    for (name, value) in &metadata.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

/// Sequentially fetch the planned chunks, emitting each slice as it arrives
fn chunk_stream(kv: Arc<dyn KvStore>, base_key: String, ttl: u64, plan: Vec<ChunkRead>) -> ByteStream {
    futures::stream::try_unfold(
        (kv, base_key, ttl, plan.into_iter()),
        |(kv, base_key, ttl, mut plan)| async move {
            let read = match plan.next() {
                Some(read) => read,
                None => return Ok(None),
            };
            let key = chunk_key(&base_key, read.index);
            let chunk = kv.get_bytes(&key, ttl).await?.ok_or_else(|| {
                GatewayError::CacheRead(format!("chunk {} missing mid-read", key))
            })?;
            if chunk.len() as u64 != read.expected_len {
                return Err(GatewayError::CacheRead(format!(
                    "chunk {} holds {} bytes, manifest says {}",
                    key,
                    chunk.len(),
                    read.expected_len
                )));
            }
            let slice = chunk.slice(read.slice_from as usize..(read.slice_from + read.slice_len) as usize);
            Ok(Some((slice, (kv, base_key, ttl, plan))))
        },
    )
    .boxed()
}

/// Drain a stream into one buffer, verifying the declared size
async fn drain_stream(stream: ByteStream, total_size: u64) -> Result<Bytes> {
    let mut buffer = BytesMut::with_capacity(total_size as usize);
    let mut stream = stream;
    while let Some(frame) = stream.next().await {
        let data = frame.map_err(|e| GatewayError::CacheWrite(e.to_string()))?;
        buffer.extend_from_slice(&data);
    }
    if buffer.len() as u64 != total_size {
        return Err(GatewayError::CacheWrite(format!(
            "stream ended at {} of {} declared bytes",
            buffer.len(),
            total_size
        )));
    }
    Ok(buffer.freeze())
}
