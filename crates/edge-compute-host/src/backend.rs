//! Named backends and the origins that answer them.
//!
//! - [`Origin`]: something that answers outbound requests, asynchronously
//! - [`Reply`]: the one-shot completion an origin fulfils
//! - [`BackendRegistry`]: backends shared by every session
//! - [`StaticOrigin`], [`FnOrigin`], [`DelayedOrigin`]: in-process origins
//!
//! The HTTP origin lives in [`crate::http_outbound`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use edge_compute_common::{HostError, SendErrorDetail};

use crate::ready::ReadySignal;
use crate::types::{BackendConfig, BackendHealth, CacheOverride};

/// An outbound request as seen by an origin.
#[derive(Debug, Clone, Default)]
pub struct OriginRequest {
    pub backend: String,
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub cache_override: CacheOverride,
}

impl OriginRequest {
    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// An origin's answer.
#[derive(Debug, Clone, Default)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub(crate) type SendOutcome = Result<OriginResponse, SendErrorDetail>;

/// Completion slot of one outbound send.
#[derive(Debug)]
pub(crate) struct PendingSlot {
    outcome: Mutex<Option<SendOutcome>>,
    signal: Arc<ReadySignal>,
}

impl PendingSlot {
    pub(crate) fn new(signal: Arc<ReadySignal>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            signal,
        })
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.outcome.lock().is_some()
    }

    pub(crate) fn take(&self) -> Option<SendOutcome> {
        self.outcome.lock().take()
    }

    fn fill(&self, outcome: SendOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.signal.notify();
    }
}

/// Completion handle given to an [`Origin`].
///
/// Dropping it unanswered completes the send with an internal error, so a
/// buggy origin cannot leave an exchange waiting forever.
pub struct Reply {
    slot: Option<Arc<PendingSlot>>,
}

impl Reply {
    pub(crate) fn new(slot: Arc<PendingSlot>) -> Self {
        Self { slot: Some(slot) }
    }

    pub fn send(mut self, outcome: Result<OriginResponse, SendErrorDetail>) {
        if let Some(slot) = self.slot.take() {
            slot.fill(outcome);
        }
    }

    pub fn respond(self, response: OriginResponse) {
        self.send(Ok(response));
    }

    pub fn fail(self, detail: SendErrorDetail) {
        self.send(Err(detail));
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Err(SendErrorDetail::InternalError));
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("answered", &self.slot.is_none())
            .finish()
    }
}

/// Answers outbound requests sent to a backend.
///
/// `dispatch` must not block for the duration of the exchange; long work
/// belongs on another thread or task, completing through `reply`.
pub trait Origin: Send + Sync {
    fn dispatch(&self, request: OriginRequest, reply: Reply);
}

/// Answers every request with the same response.
#[derive(Debug, Clone)]
pub struct StaticOrigin {
    response: OriginResponse,
}

impl StaticOrigin {
    pub fn new(response: OriginResponse) -> Self {
        Self { response }
    }

    pub fn text(status: u16, body: &'static str) -> Self {
        Self::new(OriginResponse::new(status, body))
    }
}

impl Origin for StaticOrigin {
    fn dispatch(&self, _request: OriginRequest, reply: Reply) {
        reply.respond(self.response.clone());
    }
}

/// Answers each request by calling a function.
pub struct FnOrigin<F>(F);

impl<F> FnOrigin<F>
where
    F: Fn(&OriginRequest) -> Result<OriginResponse, SendErrorDetail> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Origin for FnOrigin<F>
where
    F: Fn(&OriginRequest) -> Result<OriginResponse, SendErrorDetail> + Send + Sync,
{
    fn dispatch(&self, request: OriginRequest, reply: Reply) {
        reply.send((self.0)(&request));
    }
}

/// Delays another origin's answer on a background thread.
pub struct DelayedOrigin {
    inner: Arc<dyn Origin>,
    delay: Duration,
}

impl DelayedOrigin {
    pub fn new(inner: Arc<dyn Origin>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl Origin for DelayedOrigin {
    fn dispatch(&self, request: OriginRequest, reply: Reply) {
        let inner = Arc::clone(&self.inner);
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            inner.dispatch(request, reply);
        });
    }
}

/// Builds origins for backends registered at run time.
pub type OriginFactory =
    Arc<dyn Fn(&str, &BackendConfig) -> Result<Arc<dyn Origin>, HostError> + Send + Sync>;

/// A named backend.
#[derive(Clone)]
pub struct Backend {
    pub name: String,
    /// Where requests go, as configured (URL or `host:port`).
    pub target: String,
    pub config: BackendConfig,
    pub health: BackendHealth,
    pub dynamic: bool,
    origin: Arc<dyn Origin>,
}

impl Backend {
    pub fn new(name: impl Into<String>, target: impl Into<String>, origin: Arc<dyn Origin>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            config: BackendConfig::default(),
            health: BackendHealth::Unknown,
            dynamic: false,
            origin,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: BackendConfig) -> Self {
        self.config = config;
        self
    }

    pub fn origin(&self) -> &Arc<dyn Origin> {
        &self.origin
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("health", &self.health)
            .field("dynamic", &self.dynamic)
            .finish_non_exhaustive()
    }
}

/// Backends shared by every session.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a backend.
    pub fn register(&self, backend: Backend) -> Option<Backend> {
        tracing::debug!(backend = %backend.name, target = %backend.target, "Registered backend");
        self.backends.write().insert(backend.name.clone(), backend)
    }

    pub fn remove(&self, name: &str) -> Option<Backend> {
        self.backends.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Backend> {
        self.backends.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.read().contains_key(name)
    }

    /// Record a health check result. Returns `false` for unknown backends.
    pub fn set_health(&self, name: &str, health: BackendHealth) -> bool {
        match self.backends.write().get_mut(name) {
            Some(backend) => {
                backend.health = health;
                true
            }
            None => false,
        }
    }

    /// Registered backends, sorted by name.
    pub fn list(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.backends.read().values().cloned().collect();
        backends.sort_by(|a, b| a.name.cmp(&b.name));
        backends
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Arc<PendingSlot> {
        PendingSlot::new(ReadySignal::new())
    }

    #[test]
    fn test_static_origin_replies_immediately() {
        let slot = slot();
        StaticOrigin::text(200, "hi").dispatch(OriginRequest::default(), Reply::new(slot.clone()));

        let response = slot.take().unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"hi"));
    }

    #[test]
    fn test_fn_origin_sees_request() {
        let origin = FnOrigin::new(|request: &OriginRequest| {
            Ok(OriginResponse::new(201, request.uri.clone()))
        });
        let slot = slot();
        let request = OriginRequest {
            uri: "http://example.com/x".into(),
            ..Default::default()
        };
        origin.dispatch(request, Reply::new(slot.clone()));

        assert_eq!(slot.take().unwrap().unwrap().body, "http://example.com/x");
    }

    #[test]
    fn test_dropped_reply_fails_send() {
        let slot = slot();
        drop(Reply::new(slot.clone()));

        assert_eq!(slot.take().unwrap().unwrap_err(), SendErrorDetail::InternalError);
    }

    #[test]
    fn test_delayed_origin_completes_later() {
        let signal = ReadySignal::new();
        let slot = PendingSlot::new(Arc::clone(&signal));
        let origin = DelayedOrigin::new(
            Arc::new(StaticOrigin::text(200, "late")),
            Duration::from_millis(10),
        );

        let seen = signal.generation();
        origin.dispatch(OriginRequest::default(), Reply::new(slot.clone()));
        assert!(!slot.is_ready());

        assert!(signal.wait_past_for(seen, Duration::from_secs(5)));
        assert!(slot.is_ready());
    }

    #[test]
    fn test_registry_register_and_health() {
        let registry = BackendRegistry::new();
        registry.register(Backend::new(
            "origin",
            "http://127.0.0.1:9000",
            Arc::new(StaticOrigin::text(200, "")),
        ));

        assert!(registry.contains("origin"));
        assert_eq!(registry.get("origin").unwrap().health, BackendHealth::Unknown);

        assert!(registry.set_health("origin", BackendHealth::Healthy));
        assert_eq!(registry.get("origin").unwrap().health, BackendHealth::Healthy);
        assert!(!registry.set_health("missing", BackendHealth::Healthy));

        assert!(registry.remove("origin").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let response = OriginResponse::new(200, "").with_header("Content-Type", "text/plain");
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.header("x-missing"), None);
    }
}
