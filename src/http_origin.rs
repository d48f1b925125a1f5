//! HTTP Origin Module
//!
//! A blob-store handle speaking plain HTTP to an origin endpoint. Range and
//! conditional headers are forwarded verbatim; 404 and 304 are mapped to
//! their fetch outcomes rather than surfaced as errors.

use crate::stores::{
    BlobFetch, BlobMeta, BlobObject, BlobStore, ByteStream, FetchOptions, FetchRange, HttpMetadata,
};
use crate::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::debug;

/// Blob store backed by an HTTP origin endpoint
pub struct HttpBlobStore {
    client: Client<HttpConnector, Full<Bytes>>,
    /// Endpoint prefix, e.g. `http://origin.internal:9000/media`
    endpoint: String,
}

impl HttpBlobStore {
    pub fn new(endpoint: String) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn object_uri(&self, key: &str) -> Result<Uri> {
        let url = format!("{}/{}", self.endpoint, key);
        url.parse::<Uri>()
            .map_err(|e| GatewayError::OriginTransport(format!("bad origin uri {}: {}", url, e)))
    }

    async fn send(&self, key: &str, range: Option<&FetchRange>, opts: &FetchOptions) -> Result<hyper::Response<hyper::body::Incoming>> {
        let mut builder = Request::get(self.object_uri(key)?);

        if let Some(range) = range {
            builder = builder.header("range", range.to_header_value());
        }
        if let Some(cond) = &opts.only_if {
            if let Some(etag) = &cond.if_none_match {
                builder = builder.header("if-none-match", etag.as_str());
            }
            if let Some(since) = &cond.if_modified_since {
                builder = builder.header("if-modified-since", since.as_str());
            }
        }

        let request = builder.body(Full::new(Bytes::new()))?;
        self.client
            .request(request)
            .await
            .map_err(|e| GatewayError::OriginTransport(e.to_string()))
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Parse `Content-Range: bytes a-b/T` into the served slice and total size
fn parse_content_range(value: &str) -> Option<(FetchRange, u64)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (span, total) = rest.split_once('/')?;
    let total = total.parse::<u64>().ok()?;
    let (start, end) = span.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    Some((
        FetchRange::Bounded {
            offset: start,
            length: end - start + 1,
        },
        total,
    ))
}

fn meta_from_headers(key: &str, headers: &HeaderMap, size: Option<u64>) -> BlobMeta {
    BlobMeta {
        key: key.to_string(),
        size,
        etag: header_string(headers, "etag").unwrap_or_default(),
        content_type: header_string(headers, "content-type"),
        http_metadata: HttpMetadata {
            content_disposition: header_string(headers, "content-disposition"),
            content_encoding: header_string(headers, "content-encoding"),
            content_language: header_string(headers, "content-language"),
            last_modified: header_string(headers, "last-modified"),
            cache_control: header_string(headers, "cache-control"),
        },
    }
}

fn body_stream(body: hyper::body::Incoming) -> ByteStream {
    body.into_data_stream()
        .map_err(|e| GatewayError::OriginTransport(e.to_string()))
        .boxed()
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn fetch(&self, key: &str, opts: FetchOptions) -> Result<BlobFetch> {
        let mut response = self.send(key, opts.range.as_ref(), &opts).await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            // Fall back to the full body; the service serves 200 in this case
            debug!(key, "origin rejected range, refetching full object");
            response = self.send(key, None, &opts).await?;
        }

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Ok(BlobFetch::Missing),
            StatusCode::NOT_MODIFIED => {
                let meta = meta_from_headers(key, response.headers(), None);
                Ok(BlobFetch::NotModified(meta))
            }
            StatusCode::OK => {
                // A missing Content-Length still streams; it only means the
                // body cannot be cached
                let size = header_string(response.headers(), "content-length")
                    .and_then(|v| v.parse::<u64>().ok());
                let meta = meta_from_headers(key, response.headers(), size);
                Ok(BlobFetch::Found(BlobObject {
                    meta,
                    range: None,
                    body: body_stream(response.into_body()),
                }))
            }
            StatusCode::PARTIAL_CONTENT => {
                let (range, total) = header_string(response.headers(), "content-range")
                    .as_deref()
                    .and_then(parse_content_range)
                    .ok_or_else(|| {
                        GatewayError::OriginTransport(format!(
                            "206 from origin without a usable Content-Range for {}",
                            key
                        ))
                    })?;
                let meta = meta_from_headers(key, response.headers(), Some(total));
                Ok(BlobFetch::Found(BlobObject {
                    meta,
                    range: Some(range),
                    body: body_stream(response.into_body()),
                }))
            }
            s => Err(GatewayError::OriginTransport(format!(
                "origin returned {} for {}",
                s, key
            ))),
        }
    }
}
