//! Service Module
//!
//! The per-request read state machine: probe the fast edge cache, fall back
//! to the chunked key-value tier, then to the origin, and on an origin hit
//! stream the body to the client while populating the tier selected by
//! object size. Cache failures degrade; only origin failures surface.

use crate::config::GatewayConfig;
use crate::content_type::{categorize, mime_for_key, ObjectCategory};
use crate::headers::{build_object_headers, preserved_subset, sanitize_tag};
use crate::kv_cache::{ChunkedKvCache, EntryDescriptor};
use crate::origin::{OriginClient, RetryPolicy};
use crate::range::{self, RangeSpec};
use crate::router::BucketRouter;
use crate::split_stream::{self, DEFAULT_CAPACITY};
use crate::stores::{
    empty_body, full_body, stream_body, BlobFetch, BlobObject, BlobStore, CachePut, Conditional,
    EdgeCache, FetchOptions, FetchRange, ResponseBody,
};
use bytes::Bytes;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry of work that must outlive the client response. Spawned tasks
/// are detached from the request lifetime; the registry exists so callers
/// (and tests) can wait for outstanding work to settle.
#[derive(Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn register(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.register(tokio::spawn(fut));
    }

    /// Wait until every registered task has completed, including tasks
    /// registered while waiting
    pub async fn wait_idle(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().unwrap();
                handles.drain(..).collect()
            };
            if drained.is_empty() {
                return;
            }
            for handle in drained {
                let _ = handle.await;
            }
        }
    }
}

/// Query parameters the read path understands
#[derive(Debug, Default)]
struct QueryParams {
    bypass_requested: bool,
    custom_tags: Vec<String>,
    via: Option<String>,
}

fn parse_query(query: &str, bypass_param: &str) -> QueryParams {
    let mut params = QueryParams::default();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if name == bypass_param {
            params.bypass_requested = true;
        } else if name == "tags" {
            params.custom_tags = value
                .split(',')
                .map(sanitize_tag)
                .filter(|t| !t.is_empty())
                .collect();
        } else if name == "via" {
            params.via = Some(value.to_string());
        }
    }
    params
}

/// Convert parsed range bounds to an origin fetch range. Bounds that cannot
/// be satisfied by any object degrade to a full fetch, which the read path
/// serves as 200.
fn fetch_range_from_header(value: &str) -> Option<FetchRange> {
    let raw = range::parse_bounds(value).ok()?;
    match (raw.start, raw.end) {
        (Some(start), Some(end)) => {
            if end < start {
                None
            } else {
                Some(FetchRange::Bounded {
                    offset: start,
                    length: end - start + 1,
                })
            }
        }
        (Some(start), None) => Some(FetchRange::From { offset: start }),
        (None, Some(length)) => {
            if length == 0 {
                None
            } else {
                Some(FetchRange::Suffix { length })
            }
        }
        (None, None) => None,
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .header("content-length", message.len().to_string())
        .body(full_body(Bytes::from(message.to_string())))
        .unwrap()
}

fn apply_headers(builder: hyper::http::response::Builder, headers: &HeaderMap) -> hyper::http::response::Builder {
    let mut builder = builder;
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
}

/// The object gateway read path
pub struct ObjectService {
    config: Arc<GatewayConfig>,
    router: BucketRouter,
    edge_cache: Arc<dyn EdgeCache>,
    kv_cache: Option<Arc<ChunkedKvCache>>,
    retry: RetryPolicy,
    tasks: Arc<BackgroundTasks>,
}

impl ObjectService {
    pub fn new(
        config: Arc<GatewayConfig>,
        router: BucketRouter,
        edge_cache: Arc<dyn EdgeCache>,
        kv_cache: Option<Arc<ChunkedKvCache>>,
    ) -> Self {
        let retry = RetryPolicy {
            max_retries: config.storage.max_retries,
            retry_delay: Duration::from_millis(config.storage.retry_delay_ms),
            exponential_backoff: config.storage.exponential_backoff,
        };
        Self {
            config,
            router,
            edge_cache,
            kv_cache,
            retry,
            tasks: Arc::new(BackgroundTasks::default()),
        }
    }

    /// Handle to the background-task registry, for shutdown and tests
    pub fn background_tasks(&self) -> Arc<BackgroundTasks> {
        Arc::clone(&self.tasks)
    }

    /// Run one request through the read state machine
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody> {
        let request_id = Uuid::new_v4();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if method != Method::GET && method != Method::HEAD {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
        }

        if path == "/" {
            let mut response = text_response(
                StatusCode::OK,
                concat!("object-gateway v", env!("CARGO_PKG_VERSION"), "\n"),
            );
            if method == Method::HEAD {
                *response.body_mut() = empty_body();
            }
            return response;
        }

        let host = req
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost")
            .to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());
        let cache_url = format!(
            "{}://{}{}",
            self.config.server.public_scheme, host, path_and_query
        );

        let target = match self.router.resolve(&host, &path) {
            Ok(target) => target,
            Err(e) => {
                warn!(%request_id, %host, %path, error = %e, "route resolution failed");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "configuration error\n");
            }
        };

        let params = parse_query(&query, &self.config.cache.bypass_param_name);
        let bypass = !self.config.cache.enabled
            || (self.config.cache.bypass_param_enabled && params.bypass_requested);
        if let Some(via) = &params.via {
            debug!(%request_id, %via, "alternate origin dispatch requested");
        }

        // Fast tier first; it synthesizes 206/304 itself, so a hit is final
        if !bypass {
            match self.edge_cache.lookup(&cache_url, req.headers()).await {
                Ok(Some(mut response)) => {
                    info!(%request_id, %method, %path, status = response.status().as_u16(), tier = "edge", "request served");
                    if method == Method::HEAD {
                        *response.body_mut() = empty_body();
                    }
                    return response;
                }
                Ok(None) => {}
                Err(e) => warn!(%request_id, error = %e, "edge cache probe failed"),
            }
        }

        // Slow tier next
        if !bypass {
            if let Some(kv_cache) = &self.kv_cache {
                match kv_cache.match_request(&cache_url, req.headers()).await {
                    Ok(Some(mut response)) => {
                        info!(%request_id, %method, %path, status = response.status().as_u16(), tier = "kv", "request served");
                        if method == Method::HEAD {
                            *response.body_mut() = empty_body();
                        }
                        return response;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(%request_id, error = %e, "kv cache probe failed"),
                }
            }
        }

        // Origin, with Range and conditional predicates forwarded verbatim
        let fetch_range = req
            .headers()
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(fetch_range_from_header);
        let only_if = {
            let cond = Conditional {
                if_none_match: req
                    .headers()
                    .get("if-none-match")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string()),
                if_modified_since: req
                    .headers()
                    .get("if-modified-since")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string()),
            };
            if cond.is_empty() {
                None
            } else {
                Some(cond)
            }
        };

        let origin = OriginClient::new(Arc::clone(&target.store), self.retry.clone());
        let fetched = origin
            .fetch(
                &target.key,
                FetchOptions {
                    range: fetch_range,
                    only_if,
                },
            )
            .await;

        let object = match fetched {
            Err(e) => {
                warn!(%request_id, key = %target.key, bucket = %target.bucket_name, error = %e, "origin fetch failed");
                return text_response(StatusCode::BAD_GATEWAY, "origin error\n");
            }
            Ok(BlobFetch::Missing) => {
                info!(%request_id, %method, %path, status = 404u16, tier = "origin", "request served");
                return text_response(StatusCode::NOT_FOUND, "object not found\n");
            }
            Ok(BlobFetch::NotModified(meta)) => {
                info!(%request_id, %method, %path, status = 304u16, tier = "origin", "request served");
                let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
                if !meta.etag.is_empty() {
                    builder = builder.header("etag", meta.etag.as_str());
                }
                return builder.body(empty_body()).unwrap();
            }
            Ok(BlobFetch::Found(object)) => object,
        };

        self.dispatch(request_id, method, &path, &host, cache_url, target.store, object, &params, bypass)
            .await
    }

    /// A body is present: build headers, then branch on range / bypass /
    /// populate
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        request_id: Uuid,
        method: Method,
        path: &str,
        host: &str,
        cache_url: String,
        store: Arc<dyn BlobStore>,
        object: BlobObject,
        params: &QueryParams,
        bypass: bool,
    ) -> Response<ResponseBody> {
        let mime = object
            .meta
            .content_type
            .clone()
            .unwrap_or_else(|| mime_for_key(&object.meta.key).to_string());
        let category = categorize(&mime);
        let mut headers = build_object_headers(
            &object.meta,
            host,
            category,
            &self.config,
            &params.custom_tags,
            bypass,
        );

        // Partial body from the origin: pass the 206 through uncached and
        // warm the caches with a full fetch in the background
        if let Some(served) = object.range {
            let total = match object.meta.size {
                Some(total) => total,
                None => {
                    // Content-Range cannot be framed without the total
                    warn!(%request_id, key = %object.meta.key, "origin served a partial body without a total size");
                    return text_response(StatusCode::BAD_GATEWAY, "origin error\n");
                }
            };
            let (start, end) = served.bounds(total);
            let spec = RangeSpec { start, end };
            headers.insert("content-length", spec.len().to_string().parse().unwrap());
            headers.insert(
                "content-range",
                spec.content_range(total).parse().unwrap(),
            );

            if !bypass && method == Method::GET {
                self.spawn_full_populate(store, object.meta.key.clone(), cache_url, host.to_string(), params.custom_tags.clone());
            }

            info!(%request_id, %method, %path, status = 206u16, tier = "origin", "request served");
            let body = if method == Method::HEAD {
                empty_body()
            } else {
                stream_body(object.body)
            };
            return apply_headers(Response::builder().status(StatusCode::PARTIAL_CONTENT), &headers)
                .header("x-fetch-via", "origin-binding")
                .body(body)
                .unwrap();
        }

        if bypass || method == Method::HEAD {
            info!(%request_id, %method, %path, status = 200u16, tier = if bypass { "origin-bypass" } else { "origin" }, "request served");
            let body = if method == Method::HEAD {
                empty_body()
            } else {
                stream_body(object.body)
            };
            return apply_headers(Response::builder().status(StatusCode::OK), &headers)
                .header("x-fetch-via", "origin-binding")
                .body(body)
                .unwrap();
        }

        let client = self.populate_and_stream(&cache_url, &mime, category, &headers, object);
        info!(%request_id, %method, %path, status = 200u16, tier = "origin", "request served");
        apply_headers(Response::builder().status(StatusCode::OK), &headers)
            .header("x-fetch-via", "origin-binding")
            .body(client)
            .unwrap()
    }

    /// Split the origin body between the client and the cache tier chosen
    /// by object size
    fn populate_and_stream(
        &self,
        cache_url: &str,
        mime: &str,
        category: ObjectCategory,
        headers: &HeaderMap,
        object: BlobObject,
    ) -> ResponseBody {
        let size = match object.meta.size {
            Some(size) => size,
            None => {
                // Neither tier can take a body of undeclared length; the
                // client still gets the stream
                debug!(url = %cache_url, "origin declined to supply a length, skipping cache populate");
                return stream_body(object.body);
            }
        };
        let max_age = self.config.max_age_for(category.as_str());
        let desc = EntryDescriptor {
            content_type: mime.to_string(),
            content_length: size,
            etag: object.meta.etag.clone(),
            preserved_headers: preserved_subset(headers),
        };

        let split = split_stream::split(object.body, DEFAULT_CAPACITY);
        self.tasks.register(split.pump);

        if size > self.config.cache.fast_cache_cap {
            if let Some(kv_cache) = &self.kv_cache {
                let kv_cache = Arc::clone(kv_cache);
                let url = cache_url.to_string();
                let cache_side = split.cache;
                self.tasks.spawn(async move {
                    match kv_cache.write_stream(&url, cache_side, size, &desc, max_age).await {
                        Ok(()) => debug!(%url, size, "kv cache populated"),
                        Err(e) => warn!(%url, error = %e, "kv cache write failed"),
                    }
                });
                return stream_body(split.client);
            }
        }

        // Fast tier: start the put now so its progress couples to the pump
        // through the bounded channel
        let edge = Arc::clone(&self.edge_cache);
        let url = cache_url.to_string();
        let put = CachePut {
            headers: headers.clone(),
            content_length: size,
            body: split.cache,
        };
        self.tasks.spawn(async move {
            match edge.put(&url, put).await {
                Ok(()) => debug!(%url, size, "edge cache populated"),
                Err(e) => warn!(%url, error = %e, "edge cache put failed"),
            }
        });
        stream_body(split.client)
    }

    /// After serving a partial response, fetch the whole object once in the
    /// background so later requests hit a warm tier
    fn spawn_full_populate(
        &self,
        store: Arc<dyn BlobStore>,
        key: String,
        cache_url: String,
        host: String,
        custom_tags: Vec<String>,
    ) {
        let config = Arc::clone(&self.config);
        let edge = Arc::clone(&self.edge_cache);
        let kv_cache = self.kv_cache.clone();
        let retry = self.retry.clone();

        self.tasks.spawn(async move {
            let origin = OriginClient::new(store, retry);
            let object = match origin.fetch(&key, FetchOptions::default()).await {
                Ok(BlobFetch::Found(object)) => object,
                Ok(_) => {
                    debug!(%key, "full populate found no body, skipping");
                    return;
                }
                Err(e) => {
                    warn!(%key, error = %e, "full populate fetch failed");
                    return;
                }
            };

            let mime = object
                .meta
                .content_type
                .clone()
                .unwrap_or_else(|| mime_for_key(&object.meta.key).to_string());
            let category = categorize(&mime);
            let headers =
                build_object_headers(&object.meta, &host, category, &config, &custom_tags, false);
            let size = match object.meta.size {
                Some(size) => size,
                None => {
                    debug!(%cache_url, "populate skipped, origin declined to supply a length");
                    return;
                }
            };
            let max_age = config.max_age_for(category.as_str());

            if size > config.cache.fast_cache_cap {
                if let Some(kv_cache) = kv_cache {
                    let desc = EntryDescriptor {
                        content_type: mime,
                        content_length: size,
                        etag: object.meta.etag.clone(),
                        preserved_headers: preserved_subset(&headers),
                    };
                    match kv_cache
                        .write_stream(&cache_url, object.body, size, &desc, max_age)
                        .await
                    {
                        Ok(()) => debug!(%cache_url, size, "kv cache populated after range"),
                        Err(e) => warn!(%cache_url, error = %e, "kv populate after range failed"),
                    }
                }
                return;
            }

            let put = CachePut {
                headers,
                content_length: size,
                body: object.body,
            };
            match edge.put(&cache_url, put).await {
                Ok(()) => debug!(%cache_url, size, "edge cache populated after range"),
                Err(e) => warn!(%cache_url, error = %e, "edge populate after range failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing() {
        let params = parse_query("no-cache&tags=a,b%20,c&via=signed", "no-cache");
        assert!(params.bypass_requested);
        assert_eq!(params.custom_tags, vec!["a", "b20", "c"]);
        assert_eq!(params.via.as_deref(), Some("signed"));

        let params = parse_query("tags=,,", "no-cache");
        assert!(!params.bypass_requested);
        assert!(params.custom_tags.is_empty());
    }

    #[test]
    fn bypass_param_requires_exact_name() {
        let params = parse_query("nocache", "no-cache");
        assert!(!params.bypass_requested);
        let params = parse_query("no-cache=1", "no-cache");
        assert!(params.bypass_requested);
    }

    #[test]
    fn range_header_to_fetch_range() {
        assert_eq!(
            fetch_range_from_header("bytes=0-1023"),
            Some(FetchRange::Bounded { offset: 0, length: 1024 })
        );
        assert_eq!(
            fetch_range_from_header("bytes=512-"),
            Some(FetchRange::From { offset: 512 })
        );
        assert_eq!(
            fetch_range_from_header("bytes=-64"),
            Some(FetchRange::Suffix { length: 64 })
        );
        // Degenerate forms degrade to a full fetch
        assert_eq!(fetch_range_from_header("bytes=10-5"), None);
        assert_eq!(fetch_range_from_header("bytes=-0"), None);
        assert_eq!(fetch_range_from_header("bytes=0-10,20-30"), None);
        assert_eq!(fetch_range_from_header("garbage"), None);
    }
}
