//! Configuration Module
//!
//! Configuration structures for the gateway. The core never reads files
//! itself; the binary loads a YAML file and hands the validated structs in.

use crate::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tags: TagConfig,
    /// Per-category policy overrides keyed by category name
    /// (`image`, `video`, `audio`, `font`, `document`, `static`, `archive`, `binary`)
    #[serde(default)]
    pub object_types: HashMap<String, ObjectTypePolicy>,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Ordered route table; first match wins
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Bucket used when no route matches
    #[serde(default = "default_bucket_name")]
    pub default_bucket: String,
    /// Origin endpoint per bucket name (binary wiring only)
    #[serde(default)]
    pub origins: HashMap<String, String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            tags: TagConfig::default(),
            object_types: HashMap::new(),
            storage: StorageConfig::default(),
            routes: Vec::new(),
            default_bucket: default_bucket_name(),
            origins: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Scheme used when reconstructing the cache URL from the request
    #[serde(default = "default_scheme")]
    pub public_scheme: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            public_scheme: default_scheme(),
        }
    }
}

/// Cache behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Disables cache reads and writes globally when false
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default max-age in seconds when no category override applies
    #[serde(default = "default_max_age")]
    pub default_max_age: u64,
    /// Default stale-while-revalidate window in seconds
    #[serde(default = "default_swr")]
    pub default_swr: u64,
    /// Per-entry size cap of the fast (edge) tier; larger objects go to the
    /// chunked key-value tier
    #[serde(default = "default_fast_cache_cap")]
    pub fast_cache_cap: u64,
    /// Whether the bypass query parameter is honored
    #[serde(default = "default_true")]
    pub bypass_param_enabled: bool,
    /// Name of the bypass query parameter
    #[serde(default = "default_bypass_param")]
    pub bypass_param_name: String,
    #[serde(default)]
    pub kv: ChunkedCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_age: default_max_age(),
            default_swr: default_swr(),
            fast_cache_cap: default_fast_cache_cap(),
            bypass_param_enabled: true,
            bypass_param_name: default_bypass_param(),
            kv: ChunkedCacheConfig::default(),
        }
    }
}

/// Chunked key-value cache format constants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedCacheConfig {
    /// Bodies at or below this size are stored as a single `_body` entry
    #[serde(default = "default_single_entry_max")]
    pub single_entry_max: u64,
    /// Chunk width for bodies above `single_entry_max`
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Bodies above this size are not cached at all
    #[serde(default = "default_total_max")]
    pub total_max: u64,
    /// Floor for the read-side cache propagation hint, in seconds
    #[serde(default = "default_min_ttl")]
    pub min_read_ttl: u64,
    /// Floor for entry TTLs on write, in seconds
    #[serde(default = "default_min_ttl")]
    pub min_write_ttl: u64,
}

impl Default for ChunkedCacheConfig {
    fn default() -> Self {
        Self {
            single_entry_max: default_single_entry_max(),
            chunk_size: default_chunk_size(),
            total_max: default_total_max(),
            min_read_ttl: default_min_ttl(),
            min_write_ttl: default_min_ttl(),
        }
    }
}

/// Cache-tag configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Prefix prepended to every emitted tag
    #[serde(default)]
    pub prefix: String,
    /// Tags attached to every cached response
    #[serde(default)]
    pub default_tags: Vec<String>,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: String::new(),
            default_tags: Vec::new(),
        }
    }
}

/// Per-category cache policy override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectTypePolicy {
    /// Overrides `cache.default_max_age` for this category
    #[serde(default)]
    pub max_age: Option<u64>,
    /// Extra tags attached to responses of this category
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Origin fetch retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Total fetch attempts, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Doubles the delay after each failed attempt when true
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: true,
        }
    }
}

/// A single bucket route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Host pattern: exact host, `*`, or a `*.suffix` wildcard
    pub host: String,
    /// Path prefix the request path must start with
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    /// Bucket identifier this route resolves to
    pub bucket: String,
    /// Display name; defaults to the bucket identifier
    #[serde(default)]
    pub name: Option<String>,
    /// Remove the matched path prefix from the object key
    #[serde(default)]
    pub strip_prefix: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_max_age() -> u64 {
    86400
}

fn default_swr() -> u64 {
    3600
}

fn default_fast_cache_cap() -> u64 {
    25 * 1024 * 1024
}

fn default_bypass_param() -> String {
    "no-cache".to_string()
}

fn default_single_entry_max() -> u64 {
    20 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    20 * 1024 * 1024
}

fn default_total_max() -> u64 {
    500 * 1024 * 1024
}

fn default_min_ttl() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_path_prefix() -> String {
    "/".to_string()
}

fn default_bucket_name() -> String {
    "default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: GatewayConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(GatewayError::Config("server.port must be nonzero".into()));
        }
        if self.server.public_scheme != "http" && self.server.public_scheme != "https" {
            return Err(GatewayError::Config(format!(
                "server.public_scheme must be http or https, got {}",
                self.server.public_scheme
            )));
        }
        if self.cache.kv.chunk_size == 0 {
            return Err(GatewayError::Config("cache.kv.chunk_size must be nonzero".into()));
        }
        if self.cache.kv.single_entry_max > self.cache.kv.total_max {
            return Err(GatewayError::Config(
                "cache.kv.single_entry_max exceeds cache.kv.total_max".into(),
            ));
        }
        if self.storage.max_retries == 0 {
            return Err(GatewayError::Config("storage.max_retries must be at least 1".into()));
        }
        if self.default_bucket.is_empty() {
            return Err(GatewayError::Config("default_bucket must not be empty".into()));
        }
        for route in &self.routes {
            if route.host.is_empty() {
                return Err(GatewayError::Config("route host must not be empty".into()));
            }
            if !route.path_prefix.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "route path_prefix must start with '/', got {}",
                    route.path_prefix
                )));
            }
            if route.bucket.is_empty() {
                return Err(GatewayError::Config("route bucket must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Effective max-age for a category, falling back to the default
    pub fn max_age_for(&self, category: &str) -> u64 {
        self.object_types
            .get(category)
            .and_then(|p| p.max_age)
            .unwrap_or(self.cache.default_max_age)
    }

    /// Extra tags configured for a category
    pub fn tags_for(&self, category: &str) -> &[String] {
        self.object_types
            .get(category)
            .map(|p| p.tags.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cache.kv.single_entry_max, 20 * 1024 * 1024);
        assert_eq!(config.cache.kv.chunk_size, 20 * 1024 * 1024);
        assert_eq!(config.cache.kv.total_max, 500 * 1024 * 1024);
        assert_eq!(config.cache.kv.min_read_ttl, 60);
        assert_eq!(config.cache.fast_cache_cap, 25 * 1024 * 1024);
    }

    #[test]
    fn rejects_bad_scheme() {
        let mut config = GatewayConfig::default();
        config.server.public_scheme = "ftp".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_route_without_leading_slash() {
        let mut config = GatewayConfig::default();
        config.routes.push(RouteConfig {
            host: "*".to_string(),
            path_prefix: "images".to_string(),
            bucket: "media".to_string(),
            name: None,
            strip_prefix: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn category_policy_lookup() {
        let mut config = GatewayConfig::default();
        config.object_types.insert(
            "image".to_string(),
            ObjectTypePolicy {
                max_age: Some(604800),
                tags: vec!["img".to_string()],
            },
        );
        assert_eq!(config.max_age_for("image"), 604800);
        assert_eq!(config.max_age_for("video"), config.cache.default_max_age);
        assert_eq!(config.tags_for("image"), &["img".to_string()]);
        assert!(config.tags_for("video").is_empty());
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
server:
  port: 9000
cache:
  default_max_age: 3600
routes:
  - host: "cdn.example"
    path_prefix: "/media"
    bucket: "media-bucket"
    strip_prefix: true
default_bucket: "main"
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.cache.default_max_age, 3600);
        assert_eq!(config.routes.len(), 1);
        assert!(config.routes[0].strip_prefix);
        assert_eq!(config.default_bucket, "main");
    }
}
