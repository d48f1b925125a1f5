//! Object Gateway - Edge HTTP gateway for blob-storage buckets with a
//! two-tier read-through cache.
//!
//! This library provides the core functionality for the gateway server:
//! bucket routing, the per-request read state machine, an edge-cache tier,
//! and a chunked key-value cache tier for objects too large for the edge.

pub mod config;
pub mod content_type;
pub mod error;
pub mod headers;
pub mod http_origin;
pub mod kv_cache;
pub mod logging;
pub mod memory;
pub mod origin;
pub mod range;
pub mod router;
pub mod service;
pub mod split_stream;
pub mod stores;

pub use error::{GatewayError, Result};
