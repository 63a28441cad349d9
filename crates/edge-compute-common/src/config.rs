//! Configuration structures for edge-compute.
//!
//! This module defines configuration options for the exchange core:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`StreamConfig`]: Body read sizes and stream high-water marks
//! - [`DispatchConfig`]: Backend resolution and event loop limits
//! - [`CacheConfig`]: Defaults applied to cache writes

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// Every exchange gets its own copy; changing a value affects exchanges
/// started afterwards.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Stream and body settings.
    #[serde(default)]
    pub streams: StreamConfig,

    /// Dispatch settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Stream and body settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Maximum number of bytes requested from the host per body read.
    #[serde(default = "defaults::read_chunk_size")]
    pub read_chunk_size: usize,

    /// High-water mark of streams created over host bodies.
    ///
    /// Zero means nothing is read until a consumer asks for a chunk.
    #[serde(default)]
    pub body_high_water_mark: usize,

    /// Default high-water mark of a transform pipeline's writable end.
    #[serde(default = "defaults::transform_writable_high_water_mark")]
    pub transform_writable_high_water_mark: usize,

    /// Default high-water mark of a transform pipeline's readable end.
    #[serde(default)]
    pub transform_readable_high_water_mark: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: defaults::read_chunk_size(),
            body_high_water_mark: 0,
            transform_writable_high_water_mark: defaults::transform_writable_high_water_mark(),
            transform_readable_high_water_mark: 0,
        }
    }
}

/// Backend resolution and event loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Backend used when a request names none.
    #[serde(default)]
    pub default_backend: Option<String>,

    /// Derive and register a backend from the request URL when none is named.
    #[serde(default)]
    pub allow_dynamic_backends: bool,

    /// Upper bound on a single wait for host readiness.
    ///
    /// `None` waits until something becomes ready.
    #[serde(default)]
    pub select_timeout_ms: Option<u64>,

    /// Maximum number of host operations an exchange may have outstanding.
    #[serde(default = "defaults::max_pending_tasks")]
    pub max_pending_tasks: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_backend: None,
            allow_dynamic_backends: false,
            select_timeout_ms: None,
            max_pending_tasks: defaults::max_pending_tasks(),
        }
    }
}

impl DispatchConfig {
    /// Get the select timeout as a `Duration`.
    pub fn select_timeout(&self) -> Option<Duration> {
        self.select_timeout_ms.map(Duration::from_millis)
    }
}

/// Defaults applied to cache writes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Max age used when an insert does not specify one.
    #[serde(default)]
    pub default_max_age_secs: Option<u64>,
}

impl CacheConfig {
    /// Get the default max age as a `Duration`.
    pub fn default_max_age(&self) -> Option<Duration> {
        self.default_max_age_secs.map(Duration::from_secs)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn read_chunk_size() -> usize {
        8192
    }

    pub const fn transform_writable_high_water_mark() -> usize {
        1
    }

    pub const fn max_pending_tasks() -> usize {
        1024
    }
}
