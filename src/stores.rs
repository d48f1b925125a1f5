//! Stores Module
//!
//! Collaborator seams consumed by the read path: the blob store behind each
//! bucket, the key-value store backing the chunked cache tier, and the edge
//! HTTP cache. Implementations live in `http_origin` and `memory`.

use crate::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::HeaderMap;

/// Streaming body of an object, frame by frame
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Response body type served to clients
pub type ResponseBody = UnsyncBoxBody<Bytes, GatewayError>;

/// Fully buffered response body
pub fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Empty response body
pub fn empty_body() -> ResponseBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed_unsync()
}

/// Streaming response body over a byte stream
pub fn stream_body(stream: ByteStream) -> ResponseBody {
    UnsyncBoxBody::new(StreamBody::new(stream.map(|chunk| chunk.map(Frame::data))))
}

/// Byte range requested from a blob store, prior to resolution against the
/// object's size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRange {
    /// `offset` plus an exact `length`
    Bounded { offset: u64, length: u64 },
    /// `offset` to the end of the object
    From { offset: u64 },
    /// Final `length` bytes of the object
    Suffix { length: u64 },
}

impl FetchRange {
    /// Resolve to inclusive `(start, end)` bounds against a total size.
    /// Assumes the range is satisfiable; callers check that first.
    pub fn bounds(&self, total: u64) -> (u64, u64) {
        match *self {
            FetchRange::Bounded { offset, length } => {
                (offset, (offset + length - 1).min(total.saturating_sub(1)))
            }
            FetchRange::From { offset } => (offset, total.saturating_sub(1)),
            FetchRange::Suffix { length } => {
                (total.saturating_sub(length), total.saturating_sub(1))
            }
        }
    }

    /// Render as a `Range` request header value
    pub fn to_header_value(&self) -> String {
        match *self {
            FetchRange::Bounded { offset, length } => {
                format!("bytes={}-{}", offset, offset + length - 1)
            }
            FetchRange::From { offset } => format!("bytes={}-", offset),
            FetchRange::Suffix { length } => format!("bytes=-{}", length),
        }
    }
}

/// Conditional predicates forwarded verbatim to the origin
#[derive(Debug, Clone, Default)]
pub struct Conditional {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

impl Conditional {
    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }
}

/// Options for a blob-store fetch
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub range: Option<FetchRange>,
    pub only_if: Option<Conditional>,
}

/// Response-header subset the origin recorded at upload time
#[derive(Debug, Clone, Default)]
pub struct HttpMetadata {
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub last_modified: Option<String>,
    pub cache_control: Option<String>,
}

/// Object attributes as seen by the origin
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub key: String,
    /// Full object size, even when a range was served. `None` when the
    /// origin declined to state a length; such bodies stream to the client
    /// uncached, since both tiers need an exact size.
    pub size: Option<u64>,
    /// Strong ETag in its quoted form, treated as opaque
    pub etag: String,
    pub content_type: Option<String>,
    pub http_metadata: HttpMetadata,
}

/// A fetched object with its body stream. `range` is set when the origin
/// served a partial body and describes the slice the stream carries.
pub struct BlobObject {
    pub meta: BlobMeta,
    pub range: Option<FetchRange>,
    pub body: ByteStream,
}

/// Outcome of a blob-store fetch
pub enum BlobFetch {
    /// Object present, body attached
    Found(BlobObject),
    /// Conditional precondition failed; metadata only, no body
    NotModified(BlobMeta),
    /// No object under this key
    Missing,
}

/// Blob-storage bucket handle
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn fetch(&self, key: &str, opts: FetchOptions) -> Result<BlobFetch>;
}

/// Options for a key-value put
#[derive(Debug, Clone, Default)]
pub struct KvPutOptions {
    /// Out-of-band metadata blob, bounded to roughly 1 KiB
    pub metadata: Option<Bytes>,
    /// TTL in seconds after which all reads observe a miss
    pub expiration_ttl: Option<u64>,
}

/// Key-value store handle backing the chunked cache tier
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value and its metadata blob. `cache_ttl` is a propagation hint
    /// for read-side caching inside the store, in seconds.
    async fn get_with_metadata(
        &self,
        key: &str,
        cache_ttl: u64,
    ) -> Result<Option<(Bytes, Option<Bytes>)>>;

    async fn get_bytes(&self, key: &str, cache_ttl: u64) -> Result<Option<Bytes>>;

    async fn put(&self, key: &str, value: Bytes, opts: KvPutOptions) -> Result<()>;
}

/// A full 200 response handed to the edge cache for storage. The edge tier
/// refuses chunked-transfer bodies, so an exact `content_length` is required.
pub struct CachePut {
    pub headers: HeaderMap,
    pub content_length: u64,
    pub body: ByteStream,
}

/// Edge HTTP cache handle. Lookups may natively synthesize 206 and 304
/// responses from the stored full-body entry; callers must not re-apply
/// range or conditional logic to a hit.
#[async_trait]
pub trait EdgeCache: Send + Sync {
    /// Look up a cached response for `url`, honoring Range and conditional
    /// headers from `request_headers`. Method is ignored.
    async fn lookup(
        &self,
        url: &str,
        request_headers: &HeaderMap,
    ) -> Result<Option<hyper::Response<ResponseBody>>>;

    /// Store a full 200 response under `url`
    async fn put(&self, url: &str, response: CachePut) -> Result<()>;
}
