//! Host-call boundary for edge-compute.
//!
//! This crate defines what the exchange core may ask of its host, and ships
//! an in-memory host that implements it.
//!
//! # Modules
//!
//! - [`handle`]: Typed, move-only wrappers around host resource identifiers
//! - [`api`]: The [`Host`] trait
//! - [`session`]: [`Session`], the in-memory host for one exchange
//! - [`backend`]: Named backends and the origins that answer them
//! - [`http_outbound`]: Origin forwarding to real servers with `reqwest`
//! - [`cache`]: Cache store shared by sessions
//! - [`logging`]: Log endpoints
//! - [`permissions`]: Policy for dynamically registered backends
//!
//! # Threading
//!
//! The exchange core calls the host from a single thread. Origins complete
//! sends from other threads or tokio tasks; the session is synchronized so
//! those completions wake a thread blocked in [`Host::async_select`].

pub mod api;
pub mod backend;
mod body;
pub mod cache;
pub mod handle;
pub mod http_outbound;
pub mod logging;
pub mod permissions;
mod ready;
pub mod session;
pub mod types;

pub use api::{Host, HostResult, Upstream};
pub use backend::{
    Backend, BackendRegistry, DelayedOrigin, FnOrigin, Origin, OriginFactory, OriginRequest,
    OriginResponse, Reply, StaticOrigin,
};
pub use cache::CacheStore;
pub use handle::{
    AsyncItemHandle, BodyHandle, CacheHandle, INVALID_HANDLE, PendingRequestHandle,
    RequestHandle, ResponseHandle,
};
pub use http_outbound::HttpOrigin;
pub use logging::{LogEndpoints, LogEntry};
pub use permissions::BackendPolicy;
pub use session::{DownstreamRequest, DownstreamResponse, HostCallStats, Session, SessionBuilder};
pub use types::{
    BackendConfig, BackendHealth, BodyWriteEnd, CacheLookupOptions, CacheLookupState,
    CacheOverride, CacheWriteOptions, FramingHeadersMode, MessageRef,
};
