//! Headers Module
//!
//! Builds the response header set for origin-served objects: content
//! negotiation headers, cache policy, purge tags, and sniffing protection.
//! The same set feeds both the client response and the cache tiers, so
//! cached replays match what the origin-derived response carried.

use crate::config::GatewayConfig;
use crate::content_type::{mime_for_key, ObjectCategory};
use crate::stores::BlobMeta;
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use std::collections::HashMap;

/// Characters allowed in a cache tag
fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

/// Strip everything outside the tag alphabet
pub fn sanitize_tag(raw: &str) -> String {
    raw.chars().filter(|c| is_tag_char(*c)).collect()
}

/// Generate the ordered tag list for an object.
///
/// Deterministic: object-specific tag, category tag, configured category
/// tags, configured default tags, then caller-supplied custom tags. All
/// output is sanitized; empty tags are dropped.
pub fn generate_tags(
    host: &str,
    key: &str,
    category: ObjectCategory,
    config: &GatewayConfig,
    custom_tags: &[String],
) -> Vec<String> {
    let prefix = &config.tags.prefix;
    let mut tags = Vec::new();

    let mut push = |tag: String| {
        if !tag.is_empty() {
            tags.push(tag);
        }
    };

    push(format!("{}{}", prefix, sanitize_tag(&format!("{}/{}", host, key))));
    push(format!("{}type-{}", prefix, category));
    for tag in config.tags_for(category.as_str()) {
        push(format!("{}{}", prefix, sanitize_tag(tag)));
    }
    for tag in &config.tags.default_tags {
        push(format!("{}{}", prefix, sanitize_tag(tag)));
    }
    for tag in custom_tags {
        push(sanitize_tag(tag));
    }

    tags
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Build the full header set for a response derived from origin metadata.
///
/// Bypass responses carry `no-store` and no purge tags; everything else is
/// identical between the two modes.
pub fn build_object_headers(
    meta: &BlobMeta,
    host: &str,
    category: ObjectCategory,
    config: &GatewayConfig,
    custom_tags: &[String],
    bypass: bool,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| mime_for_key(&meta.key).to_string());
    insert(&mut headers, "content-type", &content_type);
    if let Some(size) = meta.size {
        insert(&mut headers, "content-length", &size.to_string());
    }
    if !meta.etag.is_empty() {
        insert(&mut headers, "etag", &meta.etag);
    }
    insert(&mut headers, "accept-ranges", "bytes");
    insert(&mut headers, "x-content-type-options", "nosniff");

    if bypass {
        insert(&mut headers, "cache-control", "no-store, max-age=0");
    } else {
        let max_age = config.max_age_for(category.as_str());
        insert(
            &mut headers,
            "cache-control",
            &format!(
                "public, max-age={}, stale-while-revalidate={}",
                max_age, config.cache.default_swr
            ),
        );
        if config.tags.enabled {
            let tags = generate_tags(host, &meta.key, category, config, custom_tags);
            if !tags.is_empty() {
                insert(&mut headers, "cache-tag", &tags.join(","));
            }
        }
    }

    let http = &meta.http_metadata;
    if let Some(v) = &http.last_modified {
        insert(&mut headers, "last-modified", v);
    }
    if let Some(v) = &http.content_disposition {
        insert(&mut headers, "content-disposition", v);
    }
    if let Some(v) = &http.content_encoding {
        insert(&mut headers, "content-encoding", v);
    }
    if let Some(v) = &http.content_language {
        insert(&mut headers, "content-language", v);
    }

    headers
}

/// The header subset preserved in slow-tier metadata for later replay
pub fn preserved_subset(headers: &HeaderMap) -> HashMap<String, String> {
    const PRESERVED: &[&str] = &[
        "cache-control",
        "cache-tag",
        "last-modified",
        "content-disposition",
        "content-encoding",
        "content-language",
    ];
    let mut subset = HashMap::new();
    for name in PRESERVED {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            subset.insert(name.to_string(), value.to_string());
        }
    }
    subset
}
