//! Plain data exchanged across the host-call boundary.

use std::time::Duration;

use bytes::Bytes;

/// Which end of a body a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyWriteEnd {
    #[default]
    Back,
    Front,
}

/// Whether the host derives `Content-Length`/`Transfer-Encoding` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingHeadersMode {
    #[default]
    Automatic,
    ManuallyFromHeaders,
}

/// Per-request override of the host's caching policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheOverride {
    /// Use the policy derived from the response.
    #[default]
    None,
    /// Never cache.
    Pass,
    /// Cache with explicit settings; unset fields keep the derived value.
    Override {
        ttl: Option<u32>,
        stale_while_revalidate: Option<u32>,
        pci: bool,
        surrogate_key: Option<String>,
    },
}

impl CacheOverride {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Settings for a backend registered at run time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendConfig {
    pub override_host: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub first_byte_timeout: Option<Duration>,
    pub between_bytes_timeout: Option<Duration>,
    pub use_ssl: bool,
}

/// Last known health of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Bit set describing a cache lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheLookupState(u8);

impl CacheLookupState {
    pub const FOUND: u8 = 1 << 0;
    pub const USABLE: u8 = 1 << 1;
    pub const STALE: u8 = 1 << 2;
    pub const MUST_INSERT_OR_UPDATE: u8 = 1 << 3;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_found(self) -> bool {
        self.0 & Self::FOUND != 0
    }

    pub const fn is_usable(self) -> bool {
        self.0 & Self::USABLE != 0
    }

    pub const fn is_stale(self) -> bool {
        self.0 & Self::STALE != 0
    }

    pub const fn must_insert_or_update(self) -> bool {
        self.0 & Self::MUST_INSERT_OR_UPDATE != 0
    }
}

/// Options for a cache lookup.
#[derive(Debug, Clone, Default)]
pub struct CacheLookupOptions {
    /// Headers of the request the lookup is made for.
    pub request_headers: Vec<(String, String)>,
}

/// Options for a cache insert or update.
#[derive(Debug, Clone, Default)]
pub struct CacheWriteOptions {
    pub max_age: Duration,
    pub initial_age: Duration,
    pub stale_while_revalidate: Duration,
    pub surrogate_keys: Vec<String>,
    pub length: Option<u64>,
    pub user_metadata: Bytes,
    pub sensitive_data: bool,
}

/// Selects whose headers a header call addresses.
#[derive(Debug, Clone, Copy)]
pub enum MessageRef<'a> {
    Request(&'a crate::RequestHandle),
    Response(&'a crate::ResponseHandle),
}

impl MessageRef<'_> {
    pub(crate) fn raw(self) -> u32 {
        match self {
            Self::Request(handle) => handle.as_u32(),
            Self::Response(handle) => handle.as_u32(),
        }
    }
}
