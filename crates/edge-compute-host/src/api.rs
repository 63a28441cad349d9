//! The host-call boundary.
//!
//! [`Host`] is everything the exchange core needs from the outside world:
//! body byte streams, request and response heads, outbound sends, readiness
//! selection, the cache, backends and log endpoints. Calls never block
//! except [`Host::async_select`], [`Host::pending_req_wait`] and
//! [`Host::req_send`].

use std::net::IpAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use edge_compute_common::{HostError, SendError};

use crate::handle::{
    AsyncItemHandle, BodyHandle, CacheHandle, PendingRequestHandle, RequestHandle,
    ResponseHandle,
};
use crate::types::{
    BackendConfig, BackendHealth, BodyWriteEnd, CacheLookupOptions, CacheLookupState,
    CacheOverride, CacheWriteOptions, FramingHeadersMode, MessageRef,
};

/// Result of a host call.
pub type HostResult<T> = Result<T, HostError>;

/// A response head and body received from a backend.
pub type Upstream = (ResponseHandle, BodyHandle);

/// Host calls available to an exchange.
///
/// Implementations must be usable through `&dyn Host`; every method takes
/// `&self` and synchronizes internally.
pub trait Host {
    // Bodies

    fn body_new(&self) -> HostResult<BodyHandle>;

    /// Create a closed body already holding `bytes`. Reads drain it and then
    /// report end of body.
    fn body_from_bytes(&self, bytes: Bytes) -> HostResult<BodyHandle>;

    /// Read up to `chunk_size` bytes. An empty result means end of body.
    fn body_read(&self, body: &BodyHandle, chunk_size: usize) -> HostResult<Bytes>;

    /// Write bytes, returning how many were accepted.
    fn body_write(&self, body: &BodyHandle, bytes: &[u8], end: BodyWriteEnd)
    -> HostResult<usize>;

    /// Move all of `src` onto the end of `dest`.
    fn body_append(&self, dest: &BodyHandle, src: BodyHandle) -> HostResult<()>;

    fn body_close(&self, body: BodyHandle) -> HostResult<()>;

    /// Close a body signalling that it is incomplete.
    fn body_abandon(&self, body: BodyHandle) -> HostResult<()>;

    fn body_known_length(&self, body: &BodyHandle) -> HostResult<Option<u64>>;

    // Request heads

    fn req_new(&self) -> HostResult<RequestHandle>;
    fn req_method_get(&self, req: &RequestHandle) -> HostResult<String>;
    fn req_method_set(&self, req: &RequestHandle, method: &str) -> HostResult<()>;
    fn req_uri_get(&self, req: &RequestHandle) -> HostResult<String>;
    fn req_uri_set(&self, req: &RequestHandle, uri: &str) -> HostResult<()>;
    fn req_cache_override_set(
        &self,
        req: &RequestHandle,
        cache_override: &CacheOverride,
    ) -> HostResult<()>;
    fn req_framing_headers_mode_set(
        &self,
        req: &RequestHandle,
        mode: FramingHeadersMode,
    ) -> HostResult<()>;

    /// Send and wait for the response.
    fn req_send(
        &self,
        req: RequestHandle,
        body: BodyHandle,
        backend: &str,
    ) -> Result<Upstream, SendError>;

    /// Send with a complete body; the response is collected later.
    fn req_send_async(
        &self,
        req: RequestHandle,
        body: BodyHandle,
        backend: &str,
    ) -> HostResult<PendingRequestHandle>;

    /// Send while the caller keeps writing `body`; the send completes once
    /// `body` is closed.
    fn req_send_async_streaming(
        &self,
        req: RequestHandle,
        body: &BodyHandle,
        backend: &str,
    ) -> HostResult<PendingRequestHandle>;

    // Header access shared by request and response heads

    fn header_names_get(&self, message: MessageRef<'_>) -> HostResult<Vec<String>>;
    fn header_values_get(&self, message: MessageRef<'_>, name: &str) -> HostResult<Vec<String>>;
    /// Replace every value of `name` with `value`.
    fn header_insert(&self, message: MessageRef<'_>, name: &str, value: &str) -> HostResult<()>;
    fn header_append(&self, message: MessageRef<'_>, name: &str, value: &str) -> HostResult<()>;
    fn header_remove(&self, message: MessageRef<'_>, name: &str) -> HostResult<()>;

    // Pending sends

    /// `Some` once the response is available; the pending handle is spent then.
    fn pending_req_poll(
        &self,
        pending: &PendingRequestHandle,
    ) -> Result<Option<Upstream>, SendError>;

    fn pending_req_wait(&self, pending: PendingRequestHandle) -> Result<Upstream, SendError>;

    // Response heads

    fn resp_new(&self) -> HostResult<ResponseHandle>;
    fn resp_status_get(&self, resp: &ResponseHandle) -> HostResult<u16>;
    fn resp_status_set(&self, resp: &ResponseHandle, status: u16) -> HostResult<()>;
    fn resp_framing_headers_mode_set(
        &self,
        resp: &ResponseHandle,
        mode: FramingHeadersMode,
    ) -> HostResult<()>;

    /// Deliver the downstream response with a complete body.
    fn resp_send_downstream(&self, resp: ResponseHandle, body: BodyHandle) -> HostResult<()>;

    /// Deliver the downstream response head now; bytes written to `body`
    /// afterwards are streamed until it is closed.
    fn resp_send_downstream_streaming(
        &self,
        resp: ResponseHandle,
        body: &BodyHandle,
    ) -> HostResult<()>;

    // Downstream

    /// The inbound request. Available once per exchange.
    fn downstream_request(&self) -> HostResult<(RequestHandle, BodyHandle)>;
    fn downstream_client_addr(&self) -> HostResult<Option<IpAddr>>;
    fn downstream_server_addr(&self) -> HostResult<Option<IpAddr>>;

    // Readiness

    fn async_is_ready(&self, item: AsyncItemHandle) -> HostResult<bool>;

    /// Block until one of `items` is ready, returning its index, or until
    /// `timeout` passes, returning `None`.
    fn async_select(
        &self,
        items: &[AsyncItemHandle],
        timeout: Option<Duration>,
    ) -> HostResult<Option<usize>>;

    // Cache

    fn cache_lookup(&self, key: &[u8], options: &CacheLookupOptions) -> HostResult<CacheHandle>;

    /// Lookup that may hand this caller the obligation to insert or update.
    /// The handle becomes ready once any competing obligation is resolved.
    fn cache_transaction_lookup(
        &self,
        key: &[u8],
        options: &CacheLookupOptions,
    ) -> HostResult<CacheHandle>;

    fn cache_insert(&self, key: &[u8], options: &CacheWriteOptions) -> HostResult<BodyHandle>;
    fn cache_transaction_insert(
        &self,
        entry: &CacheHandle,
        options: &CacheWriteOptions,
    ) -> HostResult<BodyHandle>;
    fn cache_transaction_insert_and_stream_back(
        &self,
        entry: &CacheHandle,
        options: &CacheWriteOptions,
    ) -> HostResult<(BodyHandle, CacheHandle)>;
    fn cache_transaction_update(
        &self,
        entry: &CacheHandle,
        options: &CacheWriteOptions,
    ) -> HostResult<()>;
    fn cache_transaction_cancel(&self, entry: &CacheHandle) -> HostResult<()>;
    fn cache_close(&self, entry: CacheHandle) -> HostResult<()>;
    fn cache_get_state(&self, entry: &CacheHandle) -> HostResult<CacheLookupState>;
    /// A fresh body over the cached object, `None` when nothing was found.
    fn cache_get_body(&self, entry: &CacheHandle) -> HostResult<Option<BodyHandle>>;
    fn cache_get_user_metadata(&self, entry: &CacheHandle) -> HostResult<Bytes>;
    fn cache_get_age_ns(&self, entry: &CacheHandle) -> HostResult<Option<u64>>;
    fn cache_get_hits(&self, entry: &CacheHandle) -> HostResult<Option<u64>>;
    fn cache_get_length(&self, entry: &CacheHandle) -> HostResult<Option<u64>>;
    fn cache_get_max_age_ns(&self, entry: &CacheHandle) -> HostResult<Option<u64>>;
    fn cache_get_stale_while_revalidate_ns(&self, entry: &CacheHandle)
    -> HostResult<Option<u64>>;

    // Backends

    fn backend_register_dynamic(
        &self,
        name: &str,
        target: &str,
        config: &BackendConfig,
    ) -> HostResult<()>;
    fn backend_exists(&self, name: &str) -> HostResult<bool>;
    fn backend_health(&self, name: &str) -> HostResult<BackendHealth>;

    // Log endpoints

    /// Check that a log endpoint may be written to.
    fn log_endpoint_get(&self, name: &str) -> HostResult<()>;
    fn log_write(&self, endpoint: &str, message: &str) -> HostResult<()>;
}

impl BodyHandle {
    /// Write all of `bytes`, retrying partial writes.
    pub fn write_all(&self, host: &dyn Host, mut bytes: &[u8]) -> HostResult<()> {
        while !bytes.is_empty() {
            let written = host.body_write(self, bytes, BodyWriteEnd::Back)?;
            if written == 0 {
                return Err(HostError::generic("body_write"));
            }
            bytes = &bytes[written..];
        }
        Ok(())
    }

    /// Read until end of body.
    pub fn read_all(&self, host: &dyn Host, chunk_size: usize) -> HostResult<Bytes> {
        let mut out = BytesMut::new();
        loop {
            let chunk = host.body_read(self, chunk_size)?;
            if chunk.is_empty() {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&chunk);
        }
    }
}
