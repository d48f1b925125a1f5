//! Router Module
//!
//! Matches the request host and path against an ordered route table and
//! resolves the bucket handle plus object key for the read path.

use crate::config::RouteConfig;
use crate::stores::BlobStore;
use crate::{GatewayError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Resolution result: which bucket serves the request and under what key
pub struct RouteTarget {
    pub store: Arc<dyn BlobStore>,
    pub key: String,
    pub bucket_name: String,
}

/// Ordered route table plus the bucket bindings behind it
pub struct BucketRouter {
    routes: Vec<RouteConfig>,
    default_bucket: String,
    bindings: HashMap<String, Arc<dyn BlobStore>>,
}

/// `*` matches everything; `*.suffix` matches hosts ending in `.suffix` and
/// strictly longer than it; anything else is an exact match.
fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.len() > suffix.len() + 1
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.';
    }
    pattern == host
}

impl BucketRouter {
    pub fn new(
        routes: Vec<RouteConfig>,
        default_bucket: String,
        bindings: HashMap<String, Arc<dyn BlobStore>>,
    ) -> Self {
        Self {
            routes,
            default_bucket,
            bindings,
        }
    }

    /// Resolve a request to a bucket handle and object key
    pub fn resolve(&self, host: &str, path: &str) -> Result<RouteTarget> {
        let mut key = path.trim_start_matches('/').to_string();
        let mut bucket = self.default_bucket.as_str();
        let mut bucket_name = self.default_bucket.as_str();

        for route in &self.routes {
            if host_matches(&route.host, host) && path.starts_with(route.path_prefix.as_str()) {
                if route.strip_prefix && route.path_prefix != "/" {
                    let prefix = route.path_prefix.trim_start_matches('/');
                    key = key
                        .strip_prefix(prefix)
                        .map(|rest| rest.trim_start_matches('/').to_string())
                        .unwrap_or(key);
                }
                bucket = route.bucket.as_str();
                bucket_name = route.name.as_deref().unwrap_or(route.bucket.as_str());
                debug!(host, path, bucket, "route matched");
                break;
            }
        }

        let store = self
            .bindings
            .get(bucket)
            .cloned()
            .ok_or_else(|| GatewayError::Config(format!("no binding for bucket {}", bucket)))?;

        Ok(RouteTarget {
            store,
            key,
            bucket_name: bucket_name.to_string(),
        })
    }
}
