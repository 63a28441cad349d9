//! In-memory host session.
//!
//! A [`Session`] backs one exchange: it owns the handle tables, the inbound
//! request, and the channel the downstream response leaves through.
//! Backends, the cache store and the dynamic-backend policy are shared with
//! other sessions.
//!
//! Every resource kind draws identifiers from one counter, so an
//! [`AsyncItemHandle`] names exactly one body, pending send or cache entry.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use edge_compute_common::{HostError, HostErrorCode, SendError};

use crate::api::{Host, HostResult, Upstream};
use crate::backend::{Backend, BackendRegistry, OriginFactory, OriginRequest, PendingSlot, Reply};
use crate::body::{BodyCell, concat};
use crate::cache::{CacheStore, CachedObject, TransactionStart, lookup_state};
use crate::handle::{
    AsyncItemHandle, BodyHandle, CacheHandle, PendingRequestHandle, RequestHandle,
    ResponseHandle,
};
use crate::logging::LogEndpoints;
use crate::permissions::BackendPolicy;
use crate::ready::ReadySignal;
use crate::types::{
    BackendConfig, BackendHealth, BodyWriteEnd, CacheLookupOptions, CacheLookupState,
    CacheOverride, CacheWriteOptions, FramingHeadersMode, MessageRef,
};

/// How often busy cache lookups are re-checked while selecting.
const CACHE_BUSY_POLL: Duration = Duration::from_millis(5);

/// The inbound request of an exchange.
#[derive(Debug, Clone)]
pub struct DownstreamRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub client_addr: Option<IpAddr>,
    pub server_addr: Option<IpAddr>,
}

impl DownstreamRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            client_addr: None,
            server_addr: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }
}

/// The response an exchange delivered.
#[derive(Debug)]
pub struct DownstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Body chunks; the stream ends when the exchange closes the body.
    pub body: mpsc::UnboundedReceiver<Bytes>,
}

impl DownstreamResponse {
    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Drain the chunks delivered so far without waiting.
    pub fn body_now(&mut self) -> Bytes {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.body.try_recv() {
            chunks.push(chunk);
        }
        concat(chunks)
    }

    /// Wait for the whole body.
    pub async fn collect_body(mut self) -> Bytes {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.body.recv().await {
            chunks.push(chunk);
        }
        concat(chunks)
    }
}

/// Counts of selected host calls, for observing how an exchange used the
/// host.
#[derive(Debug, Default)]
pub struct HostCallStats {
    body_reads: AtomicUsize,
    body_writes: AtomicUsize,
    body_appends: AtomicUsize,
    sends: AtomicUsize,
    selects: AtomicUsize,
}

impl HostCallStats {
    pub fn body_reads(&self) -> usize {
        self.body_reads.load(Ordering::Relaxed)
    }

    pub fn body_writes(&self) -> usize {
        self.body_writes.load(Ordering::Relaxed)
    }

    pub fn body_appends(&self) -> usize {
        self.body_appends.load(Ordering::Relaxed)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::Relaxed)
    }

    pub fn selects(&self) -> usize {
        self.selects.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
struct Head {
    method: String,
    uri: String,
    status: u16,
    headers: Vec<(String, String)>,
    cache_override: CacheOverride,
    framing: FramingHeadersMode,
}

impl Default for Head {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            uri: String::new(),
            status: 200,
            headers: Vec::new(),
            cache_override: CacheOverride::None,
            framing: FramingHeadersMode::Automatic,
        }
    }
}

impl Head {
    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (name, _) in &self.headers {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.clone());
            }
        }
        names
    }

    fn values(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn remove(&mut self, name: &str) -> bool {
        let before = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.headers.len()
    }
}

#[derive(Debug)]
enum CacheEntryState {
    /// Waiting for another transaction's obligation to resolve.
    Busy { key: Vec<u8>, token: u64 },
    Ready {
        key: Vec<u8>,
        token: u64,
        object: Option<Arc<CachedObject>>,
        obligation: bool,
        /// Body of an object still being written by this session.
        stream_back: Option<Arc<BodyCell>>,
    },
}

#[derive(Debug, Default)]
struct Tables {
    next_id: u32,
    bodies: HashMap<u32, Arc<BodyCell>>,
    requests: HashMap<u32, Head>,
    responses: HashMap<u32, Head>,
    pending: HashMap<u32, Arc<PendingSlot>>,
    caches: HashMap<u32, CacheEntryState>,
    dynamic_backends: HashMap<String, Backend>,
}

impl Tables {
    fn allocate(&mut self, operation: &'static str) -> HostResult<u32> {
        let id = self.next_id;
        if id >= crate::handle::INVALID_HANDLE {
            return Err(HostError::limit_exceeded(operation));
        }
        self.next_id += 1;
        Ok(id)
    }

    fn head(&self, message: MessageRef<'_>, operation: &'static str) -> HostResult<&Head> {
        let head = match message {
            MessageRef::Request(_) => self.requests.get(&message.raw()),
            MessageRef::Response(_) => self.responses.get(&message.raw()),
        };
        head.ok_or(HostError::bad_handle(operation))
    }

    fn head_mut(
        &mut self,
        message: MessageRef<'_>,
        operation: &'static str,
    ) -> HostResult<&mut Head> {
        let head = match message {
            MessageRef::Request(_) => self.requests.get_mut(&message.raw()),
            MessageRef::Response(_) => self.responses.get_mut(&message.raw()),
        };
        head.ok_or(HostError::bad_handle(operation))
    }

    fn body(&self, body: &BodyHandle, operation: &'static str) -> HostResult<Arc<BodyCell>> {
        self.bodies
            .get(&body.as_u32())
            .cloned()
            .ok_or(HostError::bad_handle(operation))
    }
}

#[derive(Debug)]
struct Downstream {
    request: Option<DownstreamRequest>,
    client_addr: Option<IpAddr>,
    server_addr: Option<IpAddr>,
    responder: Option<oneshot::Sender<DownstreamResponse>>,
}

/// Builder for [`Session`].
#[must_use]
pub struct SessionBuilder {
    request: DownstreamRequest,
    request_id: Option<String>,
    backends: Arc<BackendRegistry>,
    cache: Arc<CacheStore>,
    policy: BackendPolicy,
    origin_factory: Option<OriginFactory>,
    log_endpoints: Option<Vec<String>>,
}

impl SessionBuilder {
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn backends(mut self, backends: Arc<BackendRegistry>) -> Self {
        self.backends = backends;
        self
    }

    pub fn cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn policy(mut self, policy: BackendPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How origins for dynamically registered backends are built.
    pub fn origin_factory(mut self, factory: OriginFactory) -> Self {
        self.origin_factory = Some(factory);
        self
    }

    /// Accept only these log endpoint names.
    pub fn log_endpoints<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log_endpoints = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Build the session and the receiver its downstream response arrives on.
    pub fn build(self) -> (Session, oneshot::Receiver<DownstreamResponse>) {
        let (tx, rx) = oneshot::channel();
        let request_id = self.request_id.unwrap_or_else(|| "session".to_string());

        let mut logs = LogEndpoints::new(request_id.clone());
        if let Some(names) = self.log_endpoints {
            logs = logs.restricted_to(names);
        }

        let session = Session {
            signal: ReadySignal::new(),
            tables: Mutex::new(Tables::default()),
            backends: self.backends,
            cache: self.cache,
            policy: self.policy,
            origin_factory: self.origin_factory,
            logs,
            downstream: Mutex::new(Downstream {
                client_addr: self.request.client_addr,
                server_addr: self.request.server_addr,
                request: Some(self.request),
                responder: Some(tx),
            }),
            stats: HostCallStats::default(),
            request_id,
        };
        (session, rx)
    }
}

/// A host for one exchange, backed by memory and pluggable origins.
pub struct Session {
    request_id: String,
    signal: Arc<ReadySignal>,
    tables: Mutex<Tables>,
    backends: Arc<BackendRegistry>,
    cache: Arc<CacheStore>,
    policy: BackendPolicy,
    origin_factory: Option<OriginFactory>,
    logs: LogEndpoints,
    downstream: Mutex<Downstream>,
    stats: HostCallStats,
}

impl Session {
    pub fn builder(request: DownstreamRequest) -> SessionBuilder {
        SessionBuilder {
            request,
            request_id: None,
            backends: Arc::new(BackendRegistry::new()),
            cache: Arc::new(CacheStore::default()),
            policy: BackendPolicy::none(),
            origin_factory: None,
            log_endpoints: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn stats(&self) -> &HostCallStats {
        &self.stats
    }

    pub fn logs(&self) -> &LogEndpoints {
        &self.logs
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    /// Number of live handles of every kind.
    pub fn live_handles(&self) -> usize {
        let tables = self.tables.lock();
        tables.bodies.len()
            + tables.requests.len()
            + tables.responses.len()
            + tables.pending.len()
            + tables.caches.len()
    }

    fn insert_body(&self, cell: Arc<BodyCell>, operation: &'static str) -> HostResult<BodyHandle> {
        let mut tables = self.tables.lock();
        let id = tables.allocate(operation)?;
        tables.bodies.insert(id, cell);
        Ok(BodyHandle::from_raw(id))
    }

    fn insert_head(&self, head: Head, response: bool) -> HostResult<u32> {
        let mut tables = self.tables.lock();
        let id = tables.allocate(if response { "resp_new" } else { "req_new" })?;
        if response {
            tables.responses.insert(id, head);
        } else {
            tables.requests.insert(id, head);
        }
        Ok(id)
    }

    fn find_backend(&self, name: &str) -> Option<Backend> {
        let dynamic = self.tables.lock().dynamic_backends.get(name).cloned();
        dynamic.or_else(|| self.backends.get(name))
    }

    /// Remove the head and body of an outbound request and resolve its
    /// backend.
    fn prepare_send(
        &self,
        req: &RequestHandle,
        backend: &str,
        operation: &'static str,
    ) -> HostResult<(Backend, OriginRequest)> {
        let Some(target) = self.find_backend(backend) else {
            debug!(request_id = %self.request_id, backend, "Send to unknown backend");
            return Err(HostError::invalid_argument(operation));
        };
        let head = self
            .tables
            .lock()
            .requests
            .remove(&req.as_u32())
            .ok_or(HostError::bad_handle(operation))?;

        HostCallStats::bump(&self.stats.sends);
        debug!(
            request_id = %self.request_id,
            backend,
            method = %head.method,
            uri = %head.uri,
            "Outbound send"
        );
        let request = OriginRequest {
            backend: backend.to_string(),
            method: head.method,
            uri: head.uri,
            headers: framed(head.headers, head.framing),
            body: Bytes::new(),
            cache_override: head.cache_override,
        };
        Ok((target, request))
    }

    fn insert_pending(&self, slot: Arc<PendingSlot>) -> HostResult<PendingRequestHandle> {
        let mut tables = self.tables.lock();
        let id = tables.allocate("req_send_async")?;
        tables.pending.insert(id, slot);
        Ok(PendingRequestHandle::from_raw(id))
    }

    /// Turn a completed send into response and body handles.
    fn upstream(&self, slot: &PendingSlot) -> Option<Result<Upstream, SendError>> {
        let outcome = slot.take()?;
        Some(match outcome {
            Ok(response) => self.insert_upstream(response).map_err(SendError::from),
            Err(detail) => Err(SendError::Network(detail)),
        })
    }

    fn insert_upstream(&self, response: crate::backend::OriginResponse) -> HostResult<Upstream> {
        let head = Head {
            status: response.status,
            headers: response.headers,
            ..Head::default()
        };
        let resp = ResponseHandle::from_raw(self.insert_head(head, true)?);
        let cell = BodyCell::complete(Arc::clone(&self.signal), response.body);
        let body = self.insert_body(cell, "pending_req_poll")?;
        Ok((resp, body))
    }

    fn item_ready(&self, item: AsyncItemHandle) -> HostResult<bool> {
        let id = item.as_u32();
        let body = {
            let tables = self.tables.lock();
            if let Some(slot) = tables.pending.get(&id) {
                return Ok(slot.is_ready());
            }
            if tables.caches.contains_key(&id) {
                None
            } else {
                Some(
                    tables
                        .bodies
                        .get(&id)
                        .cloned()
                        .ok_or(HostError::bad_handle("async_is_ready"))?,
                )
            }
        };
        match body {
            Some(cell) => Ok(cell.is_ready()),
            None => Ok(self.resolve_cache(id)),
        }
    }

    /// Try to resolve a busy transactional lookup. Returns whether the
    /// entry is ready.
    fn resolve_cache(&self, id: u32) -> bool {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.caches.get_mut(&id) else {
            return false;
        };
        let CacheEntryState::Busy { key, token } = entry else {
            return true;
        };
        match self.cache.begin_transaction(key, *token) {
            TransactionStart::Busy => false,
            TransactionStart::Resolved { object, obligation } => {
                *entry = CacheEntryState::Ready {
                    key: std::mem::take(key),
                    token: *token,
                    object,
                    obligation,
                    stream_back: None,
                };
                true
            }
        }
    }

    /// Wait for a busy cache entry to resolve.
    fn await_cache(&self, entry: &CacheHandle) {
        loop {
            let seen = self.signal.generation();
            if self.resolve_cache(entry.as_u32()) {
                return;
            }
            self.signal.wait_past_for(seen, CACHE_BUSY_POLL);
        }
    }

    fn with_cache<T>(
        &self,
        entry: &CacheHandle,
        operation: &'static str,
        f: impl FnOnce(&mut CacheEntryState) -> HostResult<T>,
    ) -> HostResult<T> {
        if !self.tables.lock().caches.contains_key(&entry.as_u32()) {
            return Err(HostError::bad_handle(operation));
        }
        self.await_cache(entry);
        let mut tables = self.tables.lock();
        let state = tables
            .caches
            .get_mut(&entry.as_u32())
            .ok_or(HostError::bad_handle(operation))?;
        f(state)
    }

    fn cache_object<T>(
        &self,
        entry: &CacheHandle,
        operation: &'static str,
        f: impl FnOnce(&CachedObject) -> Option<T>,
    ) -> HostResult<Option<T>> {
        self.with_cache(entry, operation, |state| match state {
            CacheEntryState::Ready { object, .. } => Ok(object.as_deref().and_then(f)),
            CacheEntryState::Busy { .. } => Err(HostError::generic(operation)),
        })
    }

    /// A body that commits to the cache when closed.
    fn committing_body(
        &self,
        key: Vec<u8>,
        token: Option<u64>,
        options: &CacheWriteOptions,
        operation: &'static str,
    ) -> HostResult<(BodyHandle, Arc<BodyCell>)> {
        let cell = BodyCell::new(Arc::clone(&self.signal));
        let cache = Arc::clone(&self.cache);
        let options = options.clone();
        cell.attach_collector(Box::new(move |bytes| match (bytes, token) {
            (Some(bytes), token) => cache.commit(&key, token, bytes, &options),
            (None, Some(token)) => cache.release(&key, token),
            (None, None) => {}
        }));
        let handle = self.insert_body(Arc::clone(&cell), operation)?;
        Ok((handle, cell))
    }

    /// Take the obligation of a ready transaction, for an insert.
    fn take_obligation(
        &self,
        entry: &CacheHandle,
        operation: &'static str,
    ) -> HostResult<(Vec<u8>, u64)> {
        self.with_cache(entry, operation, |state| match state {
            CacheEntryState::Ready {
                key,
                token,
                obligation,
                ..
            } if *obligation => {
                *obligation = false;
                Ok((key.clone(), *token))
            }
            _ => Err(HostError::invalid_argument(operation)),
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("request_id", &self.request_id)
            .field("live_handles", &self.live_handles())
            .finish_non_exhaustive()
    }
}

impl Host for Session {
    fn body_new(&self) -> HostResult<BodyHandle> {
        self.insert_body(BodyCell::new(Arc::clone(&self.signal)), "body_new")
    }

    fn body_from_bytes(&self, bytes: Bytes) -> HostResult<BodyHandle> {
        let cell = BodyCell::complete(Arc::clone(&self.signal), bytes);
        self.insert_body(cell, "body_from_bytes")
    }

    fn body_read(&self, body: &BodyHandle, chunk_size: usize) -> HostResult<Bytes> {
        HostCallStats::bump(&self.stats.body_reads);
        let cell = self.tables.lock().body(body, "body_read")?;
        loop {
            let seen = self.signal.generation();
            if cell.is_ready() {
                let chunk = cell.read(chunk_size.max(1))?;
                trace!(handle = body.as_u32(), len = chunk.len(), "body_read");
                return Ok(chunk);
            }
            self.signal.wait_past(seen, None);
        }
    }

    fn body_write(&self, body: &BodyHandle, bytes: &[u8], end: BodyWriteEnd) -> HostResult<usize> {
        HostCallStats::bump(&self.stats.body_writes);
        let cell = self.tables.lock().body(body, "body_write")?;
        cell.write(bytes, end)
    }

    fn body_append(&self, dest: &BodyHandle, src: BodyHandle) -> HostResult<()> {
        HostCallStats::bump(&self.stats.body_appends);
        let (dest_cell, src_cell) = {
            let mut tables = self.tables.lock();
            let dest_cell = tables.body(dest, "body_append")?;
            let src_cell = tables
                .bodies
                .remove(&src.as_u32())
                .ok_or(HostError::bad_handle("body_append"))?;
            (dest_cell, src_cell)
        };
        debug!(dest = dest.as_u32(), src = src.as_u32(), "body_append");
        dest_cell.append_from(&src_cell)
    }

    fn body_close(&self, body: BodyHandle) -> HostResult<()> {
        let cell = self
            .tables
            .lock()
            .bodies
            .remove(&body.as_u32())
            .ok_or(HostError::bad_handle("body_close"))?;
        cell.close();
        Ok(())
    }

    fn body_abandon(&self, body: BodyHandle) -> HostResult<()> {
        let cell = self
            .tables
            .lock()
            .bodies
            .remove(&body.as_u32())
            .ok_or(HostError::bad_handle("body_abandon"))?;
        cell.abandon();
        Ok(())
    }

    fn body_known_length(&self, body: &BodyHandle) -> HostResult<Option<u64>> {
        Ok(self.tables.lock().body(body, "body_known_length")?.known_length())
    }

    fn req_new(&self) -> HostResult<RequestHandle> {
        self.insert_head(Head::default(), false).map(RequestHandle::from_raw)
    }

    fn req_method_get(&self, req: &RequestHandle) -> HostResult<String> {
        let tables = self.tables.lock();
        Ok(tables.head(MessageRef::Request(req), "req_method_get")?.method.clone())
    }

    fn req_method_set(&self, req: &RequestHandle, method: &str) -> HostResult<()> {
        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(HostError::new("req_method_set", HostErrorCode::HttpInvalid));
        }
        let mut tables = self.tables.lock();
        tables.head_mut(MessageRef::Request(req), "req_method_set")?.method = method.to_string();
        Ok(())
    }

    fn req_uri_get(&self, req: &RequestHandle) -> HostResult<String> {
        let tables = self.tables.lock();
        Ok(tables.head(MessageRef::Request(req), "req_uri_get")?.uri.clone())
    }

    fn req_uri_set(&self, req: &RequestHandle, uri: &str) -> HostResult<()> {
        if url::Url::parse(uri).is_err() {
            return Err(HostError::new("req_uri_set", HostErrorCode::HttpInvalid));
        }
        let mut tables = self.tables.lock();
        tables.head_mut(MessageRef::Request(req), "req_uri_set")?.uri = uri.to_string();
        Ok(())
    }

    fn req_cache_override_set(
        &self,
        req: &RequestHandle,
        cache_override: &CacheOverride,
    ) -> HostResult<()> {
        let mut tables = self.tables.lock();
        tables
            .head_mut(MessageRef::Request(req), "req_cache_override_set")?
            .cache_override = cache_override.clone();
        Ok(())
    }

    fn req_framing_headers_mode_set(
        &self,
        req: &RequestHandle,
        mode: FramingHeadersMode,
    ) -> HostResult<()> {
        let mut tables = self.tables.lock();
        tables
            .head_mut(MessageRef::Request(req), "req_framing_headers_mode_set")?
            .framing = mode;
        Ok(())
    }

    fn req_send(
        &self,
        req: RequestHandle,
        body: BodyHandle,
        backend: &str,
    ) -> Result<Upstream, SendError> {
        let pending = self.req_send_async(req, body, backend)?;
        self.pending_req_wait(pending)
    }

    fn req_send_async(
        &self,
        req: RequestHandle,
        body: BodyHandle,
        backend: &str,
    ) -> HostResult<PendingRequestHandle> {
        let (target, mut request) = self.prepare_send(&req, backend, "req_send_async")?;
        let cell = self
            .tables
            .lock()
            .bodies
            .remove(&body.as_u32())
            .ok_or(HostError::bad_handle("req_send_async"))?;
        request.body = cell.take_buffered();

        let slot = PendingSlot::new(Arc::clone(&self.signal));
        let handle = self.insert_pending(Arc::clone(&slot))?;
        target.origin().dispatch(request, Reply::new(slot));
        Ok(handle)
    }

    fn req_send_async_streaming(
        &self,
        req: RequestHandle,
        body: &BodyHandle,
        backend: &str,
    ) -> HostResult<PendingRequestHandle> {
        let (target, request) = self.prepare_send(&req, backend, "req_send_async_streaming")?;
        let cell = self.tables.lock().body(body, "req_send_async_streaming")?;

        let slot = PendingSlot::new(Arc::clone(&self.signal));
        let handle = self.insert_pending(Arc::clone(&slot))?;
        let reply = Reply::new(slot);
        let origin = Arc::clone(target.origin());
        cell.attach_collector(Box::new(move |bytes| match bytes {
            Some(bytes) => origin.dispatch(
                OriginRequest {
                    body: bytes,
                    ..request
                },
                reply,
            ),
            None => reply.fail(edge_compute_common::SendErrorDetail::HttpIncompleteResponse),
        }));
        Ok(handle)
    }

    fn header_names_get(&self, message: MessageRef<'_>) -> HostResult<Vec<String>> {
        Ok(self.tables.lock().head(message, "header_names_get")?.names())
    }

    fn header_values_get(&self, message: MessageRef<'_>, name: &str) -> HostResult<Vec<String>> {
        Ok(self.tables.lock().head(message, "header_values_get")?.values(name))
    }

    fn header_insert(&self, message: MessageRef<'_>, name: &str, value: &str) -> HostResult<()> {
        let mut tables = self.tables.lock();
        let head = tables.head_mut(message, "header_insert")?;
        head.remove(name);
        head.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn header_append(&self, message: MessageRef<'_>, name: &str, value: &str) -> HostResult<()> {
        let mut tables = self.tables.lock();
        tables
            .head_mut(message, "header_append")?
            .headers
            .push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn header_remove(&self, message: MessageRef<'_>, name: &str) -> HostResult<()> {
        let mut tables = self.tables.lock();
        if tables.head_mut(message, "header_remove")?.remove(name) {
            Ok(())
        } else {
            Err(HostError::invalid_argument("header_remove"))
        }
    }

    fn pending_req_poll(
        &self,
        pending: &PendingRequestHandle,
    ) -> Result<Option<Upstream>, SendError> {
        let slot = self
            .tables
            .lock()
            .pending
            .get(&pending.as_u32())
            .cloned()
            .ok_or(HostError::bad_handle("pending_req_poll"))?;
        match self.upstream(&slot) {
            None => Ok(None),
            Some(result) => {
                self.tables.lock().pending.remove(&pending.as_u32());
                result.map(Some)
            }
        }
    }

    fn pending_req_wait(&self, pending: PendingRequestHandle) -> Result<Upstream, SendError> {
        loop {
            let seen = self.signal.generation();
            if let Some(upstream) = self.pending_req_poll(&pending)? {
                return Ok(upstream);
            }
            self.signal.wait_past(seen, None);
        }
    }

    fn resp_new(&self) -> HostResult<ResponseHandle> {
        self.insert_head(Head::default(), true).map(ResponseHandle::from_raw)
    }

    fn resp_status_get(&self, resp: &ResponseHandle) -> HostResult<u16> {
        Ok(self.tables.lock().head(MessageRef::Response(resp), "resp_status_get")?.status)
    }

    fn resp_status_set(&self, resp: &ResponseHandle, status: u16) -> HostResult<()> {
        if !(100..=999).contains(&status) {
            return Err(HostError::new("resp_status_set", HostErrorCode::HttpInvalidStatus));
        }
        let mut tables = self.tables.lock();
        tables.head_mut(MessageRef::Response(resp), "resp_status_set")?.status = status;
        Ok(())
    }

    fn resp_framing_headers_mode_set(
        &self,
        resp: &ResponseHandle,
        mode: FramingHeadersMode,
    ) -> HostResult<()> {
        let mut tables = self.tables.lock();
        tables
            .head_mut(MessageRef::Response(resp), "resp_framing_headers_mode_set")?
            .framing = mode;
        Ok(())
    }

    fn resp_send_downstream(&self, resp: ResponseHandle, body: BodyHandle) -> HostResult<()> {
        let (head, cell) = {
            let mut tables = self.tables.lock();
            let head = tables
                .responses
                .remove(&resp.as_u32())
                .ok_or(HostError::bad_handle("resp_send_downstream"))?;
            let cell = tables
                .bodies
                .remove(&body.as_u32())
                .ok_or(HostError::bad_handle("resp_send_downstream"))?;
            (head, cell)
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let bytes = cell.take_buffered();
        if !bytes.is_empty() {
            let _ = tx.send(bytes);
        }
        self.deliver(head, rx, "resp_send_downstream")
    }

    fn resp_send_downstream_streaming(
        &self,
        resp: ResponseHandle,
        body: &BodyHandle,
    ) -> HostResult<()> {
        let (head, cell) = {
            let mut tables = self.tables.lock();
            let cell = tables.body(body, "resp_send_downstream_streaming")?;
            let head = tables
                .responses
                .remove(&resp.as_u32())
                .ok_or(HostError::bad_handle("resp_send_downstream_streaming"))?;
            (head, cell)
        };
        let (tx, rx) = mpsc::unbounded_channel();
        cell.attach_channel(tx);
        self.deliver(head, rx, "resp_send_downstream_streaming")
    }

    fn downstream_request(&self) -> HostResult<(RequestHandle, BodyHandle)> {
        let request = self
            .downstream
            .lock()
            .request
            .take()
            .ok_or(HostError::generic("downstream_request"))?;
        let head = Head {
            method: request.method,
            uri: request.uri,
            headers: request.headers,
            ..Head::default()
        };
        let req = RequestHandle::from_raw(self.insert_head(head, false)?);
        let body = self.body_from_bytes(request.body)?;
        Ok((req, body))
    }

    fn downstream_client_addr(&self) -> HostResult<Option<IpAddr>> {
        Ok(self.downstream.lock().client_addr)
    }

    fn downstream_server_addr(&self) -> HostResult<Option<IpAddr>> {
        Ok(self.downstream.lock().server_addr)
    }

    fn async_is_ready(&self, item: AsyncItemHandle) -> HostResult<bool> {
        self.item_ready(item)
    }

    fn async_select(
        &self,
        items: &[AsyncItemHandle],
        timeout: Option<Duration>,
    ) -> HostResult<Option<usize>> {
        HostCallStats::bump(&self.stats.selects);
        let deadline = timeout.map(|t| Instant::now() + t);
        let polls_cache = {
            let tables = self.tables.lock();
            items.iter().any(|i| tables.caches.contains_key(&i.as_u32()))
        };

        loop {
            let seen = self.signal.generation();
            for (index, item) in items.iter().enumerate() {
                if self.item_ready(*item)? {
                    trace!(index, handle = item.as_u32(), "async_select ready");
                    return Ok(Some(index));
                }
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Ok(None);
            }
            let wake = match (deadline, polls_cache) {
                (Some(d), true) => Some(d.min(now + CACHE_BUSY_POLL)),
                (None, true) => Some(now + CACHE_BUSY_POLL),
                (d, false) => d,
            };
            self.signal.wait_past(seen, wake);
        }
    }

    fn cache_lookup(&self, key: &[u8], _options: &CacheLookupOptions) -> HostResult<CacheHandle> {
        let object = self.cache.lookup(key);
        let token = self.cache.new_token();
        let mut tables = self.tables.lock();
        let id = tables.allocate("cache_lookup")?;
        tables.caches.insert(
            id,
            CacheEntryState::Ready {
                key: key.to_vec(),
                token,
                object,
                obligation: false,
                stream_back: None,
            },
        );
        Ok(CacheHandle::from_raw(id))
    }

    fn cache_transaction_lookup(
        &self,
        key: &[u8],
        _options: &CacheLookupOptions,
    ) -> HostResult<CacheHandle> {
        let token = self.cache.new_token();
        let state = match self.cache.begin_transaction(key, token) {
            TransactionStart::Busy => CacheEntryState::Busy {
                key: key.to_vec(),
                token,
            },
            TransactionStart::Resolved { object, obligation } => CacheEntryState::Ready {
                key: key.to_vec(),
                token,
                object,
                obligation,
                stream_back: None,
            },
        };
        let mut tables = self.tables.lock();
        let id = tables.allocate("cache_transaction_lookup")?;
        tables.caches.insert(id, state);
        Ok(CacheHandle::from_raw(id))
    }

    fn cache_insert(&self, key: &[u8], options: &CacheWriteOptions) -> HostResult<BodyHandle> {
        let (handle, _) = self.committing_body(key.to_vec(), None, options, "cache_insert")?;
        Ok(handle)
    }

    fn cache_transaction_insert(
        &self,
        entry: &CacheHandle,
        options: &CacheWriteOptions,
    ) -> HostResult<BodyHandle> {
        let (key, token) = self.take_obligation(entry, "cache_transaction_insert")?;
        let (handle, _) =
            self.committing_body(key, Some(token), options, "cache_transaction_insert")?;
        Ok(handle)
    }

    fn cache_transaction_insert_and_stream_back(
        &self,
        entry: &CacheHandle,
        options: &CacheWriteOptions,
    ) -> HostResult<(BodyHandle, CacheHandle)> {
        const OPERATION: &str = "cache_transaction_insert_and_stream_back";
        let (key, token) = self.take_obligation(entry, OPERATION)?;
        let (handle, cell) = self.committing_body(key.clone(), Some(token), options, OPERATION)?;

        let mirror = BodyCell::new(Arc::clone(&self.signal));
        cell.attach_mirror(Arc::clone(&mirror));

        let mut tables = self.tables.lock();
        let id = tables.allocate(OPERATION)?;
        tables.caches.insert(
            id,
            CacheEntryState::Ready {
                key,
                token,
                object: Some(Arc::new(CachedObject::new(Bytes::new(), options))),
                obligation: false,
                stream_back: Some(mirror),
            },
        );
        Ok((handle, CacheHandle::from_raw(id)))
    }

    fn cache_transaction_update(
        &self,
        entry: &CacheHandle,
        options: &CacheWriteOptions,
    ) -> HostResult<()> {
        const OPERATION: &str = "cache_transaction_update";
        let (key, token) = self.with_cache(entry, OPERATION, |state| match state {
            CacheEntryState::Ready {
                key,
                token,
                object: Some(_),
                obligation,
                ..
            } if *obligation => {
                *obligation = false;
                Ok((key.clone(), *token))
            }
            _ => Err(HostError::invalid_argument(OPERATION)),
        })?;
        if self.cache.update(&key, token, options) {
            Ok(())
        } else {
            self.cache.release(&key, token);
            Err(HostError::invalid_argument(OPERATION))
        }
    }

    fn cache_transaction_cancel(&self, entry: &CacheHandle) -> HostResult<()> {
        let released = self.with_cache(entry, "cache_transaction_cancel", |state| match state {
            CacheEntryState::Ready {
                key,
                token,
                obligation,
                ..
            } if *obligation => {
                *obligation = false;
                Ok(Some((key.clone(), *token)))
            }
            _ => Ok(None),
        })?;
        if let Some((key, token)) = released {
            self.cache.release(&key, token);
        }
        Ok(())
    }

    fn cache_close(&self, entry: CacheHandle) -> HostResult<()> {
        let state = self
            .tables
            .lock()
            .caches
            .remove(&entry.as_u32())
            .ok_or(HostError::bad_handle("cache_close"))?;
        if let CacheEntryState::Ready {
            key,
            token,
            obligation: true,
            ..
        } = state
        {
            self.cache.release(&key, token);
        }
        Ok(())
    }

    fn cache_get_state(&self, entry: &CacheHandle) -> HostResult<CacheLookupState> {
        self.with_cache(entry, "cache_get_state", |state| match state {
            CacheEntryState::Ready {
                object,
                obligation,
                ..
            } => Ok(lookup_state(object.as_deref(), *obligation)),
            CacheEntryState::Busy { .. } => Err(HostError::generic("cache_get_state")),
        })
    }

    fn cache_get_body(&self, entry: &CacheHandle) -> HostResult<Option<BodyHandle>> {
        let cell = self.with_cache(entry, "cache_get_body", |state| match state {
            CacheEntryState::Ready {
                stream_back: Some(mirror),
                ..
            } => Ok(Some(Arc::clone(mirror))),
            CacheEntryState::Ready {
                object: Some(object),
                ..
            } => Ok(Some(BodyCell::complete(
                Arc::clone(&self.signal),
                object.body.clone(),
            ))),
            _ => Ok(None),
        })?;
        cell.map(|cell| self.insert_body(cell, "cache_get_body"))
            .transpose()
    }

    fn cache_get_user_metadata(&self, entry: &CacheHandle) -> HostResult<Bytes> {
        Ok(self
            .cache_object(entry, "cache_get_user_metadata", |o| {
                Some(o.user_metadata.clone())
            })?
            .unwrap_or_default())
    }

    fn cache_get_age_ns(&self, entry: &CacheHandle) -> HostResult<Option<u64>> {
        self.cache_object(entry, "cache_get_age_ns", |o| {
            u64::try_from(o.age().as_nanos()).ok()
        })
    }

    fn cache_get_hits(&self, entry: &CacheHandle) -> HostResult<Option<u64>> {
        self.cache_object(entry, "cache_get_hits", |o| Some(o.hits()))
    }

    fn cache_get_length(&self, entry: &CacheHandle) -> HostResult<Option<u64>> {
        self.cache_object(entry, "cache_get_length", |o| o.length)
    }

    fn cache_get_max_age_ns(&self, entry: &CacheHandle) -> HostResult<Option<u64>> {
        self.cache_object(entry, "cache_get_max_age_ns", |o| {
            u64::try_from(o.max_age.as_nanos()).ok()
        })
    }

    fn cache_get_stale_while_revalidate_ns(
        &self,
        entry: &CacheHandle,
    ) -> HostResult<Option<u64>> {
        self.cache_object(entry, "cache_get_stale_while_revalidate_ns", |o| {
            u64::try_from(o.stale_while_revalidate.as_nanos()).ok()
        })
    }

    fn backend_register_dynamic(
        &self,
        name: &str,
        target: &str,
        config: &BackendConfig,
    ) -> HostResult<()> {
        const OPERATION: &str = "backend_register_dynamic";
        if !self.policy.dynamic_enabled {
            return Err(HostError::unsupported(OPERATION));
        }
        if !self.policy.is_target_allowed(target) || self.find_backend(name).is_some() {
            return Err(HostError::invalid_argument(OPERATION));
        }
        let factory = self
            .origin_factory
            .as_ref()
            .ok_or(HostError::unsupported(OPERATION))?;
        let origin = factory(target, config)?;

        let mut backend = Backend::new(name, target, origin).with_config(config.clone());
        backend.dynamic = true;
        debug!(request_id = %self.request_id, backend = name, target, "Registered dynamic backend");
        self.tables
            .lock()
            .dynamic_backends
            .insert(name.to_string(), backend);
        Ok(())
    }

    fn backend_exists(&self, name: &str) -> HostResult<bool> {
        Ok(self.find_backend(name).is_some())
    }

    fn backend_health(&self, name: &str) -> HostResult<BackendHealth> {
        self.find_backend(name)
            .map(|b| b.health)
            .ok_or(HostError::invalid_argument("backend_health"))
    }

    fn log_endpoint_get(&self, name: &str) -> HostResult<()> {
        self.logs.check(name)
    }

    fn log_write(&self, endpoint: &str, message: &str) -> HostResult<()> {
        self.logs.write(endpoint, message)
    }
}

impl Session {
    fn deliver(
        &self,
        head: Head,
        body: mpsc::UnboundedReceiver<Bytes>,
        operation: &'static str,
    ) -> HostResult<()> {
        let responder = self
            .downstream
            .lock()
            .responder
            .take()
            .ok_or(HostError::generic(operation))?;
        debug!(request_id = %self.request_id, status = head.status, "Downstream response sent");
        let response = DownstreamResponse {
            status: head.status,
            headers: framed(head.headers, head.framing),
            body,
        };
        if responder.send(response).is_err() {
            debug!(request_id = %self.request_id, "Downstream receiver dropped");
        }
        Ok(())
    }
}

/// With automatic framing the transport computes length headers itself.
fn framed(mut headers: Vec<(String, String)>, mode: FramingHeadersMode) -> Vec<(String, String)> {
    if mode == FramingHeadersMode::Automatic {
        headers.retain(|(name, _)| {
            !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("transfer-encoding")
        });
    }
    headers
}
