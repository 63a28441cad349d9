//! Per-exchange context.
//!
//! [`ExchangeContext`] holds everything one exchange shares: the host, the
//! runtime configuration, the event loop and the request id. It is created
//! when the exchange starts and dropped once the response is delivered and
//! the event loop has ended.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use edge_compute_common::{RuntimeConfig, ScriptError};
use edge_compute_host::Host;

use crate::event_loop::EventLoop;

/// Counters collected over one exchange.
#[derive(Debug, Clone, Default)]
pub struct ExchangeMetrics {
    /// Host tasks run by the event loop.
    pub tasks_run: u64,

    /// Total exchange duration.
    pub duration: Option<Duration>,
}

/// State shared by everything running in one exchange.
pub struct ExchangeContext {
    host: Rc<dyn Host>,
    config: RuntimeConfig,
    event_loop: EventLoop,
    request_id: String,
    metrics: RefCell<ExchangeMetrics>,
    start_time: Instant,
}

impl ExchangeContext {
    /// Create a context with a fresh request id.
    pub fn new(host: Rc<dyn Host>, config: RuntimeConfig) -> Rc<Self> {
        Self::with_request_id(host, config, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_request_id(
        host: Rc<dyn Host>,
        config: RuntimeConfig,
        request_id: impl Into<String>,
    ) -> Rc<Self> {
        let event_loop = EventLoop::new(&config.dispatch);
        Rc::new(Self {
            host,
            config,
            event_loop,
            request_id: request_id.into(),
            metrics: RefCell::new(ExchangeMetrics::default()),
            start_time: Instant::now(),
        })
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    /// An owned reference to the host, for continuations.
    pub fn shared_host(&self) -> Rc<dyn Host> {
        Rc::clone(&self.host)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Backend used when a request names none.
    pub fn default_backend(&self) -> Option<&str> {
        self.config.dispatch.default_backend.as_deref()
    }

    pub fn allow_dynamic_backends(&self) -> bool {
        self.config.dispatch.allow_dynamic_backends
    }

    /// Schedule a continuation on the exchange's event loop.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.event_loop.spawn(future);
    }

    pub fn set_timeout(&self, delay: Duration, callback: impl FnOnce() + 'static) -> u32 {
        self.event_loop.set_timeout(delay, callback)
    }

    pub fn set_interval(&self, period: Duration, callback: impl FnMut() + 'static) -> u32 {
        self.event_loop.set_interval(period, callback)
    }

    pub fn clear_timer(&self, id: u32) {
        self.event_loop.clear_timer(id);
    }

    /// Write `message` to the named log endpoint.
    pub fn log(&self, endpoint: &str, message: &str) -> Result<(), ScriptError> {
        self.host.log_endpoint_get(endpoint)?;
        self.host.log_write(endpoint, message)?;
        Ok(())
    }

    /// Get elapsed time since the exchange started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn metrics(&self) -> ExchangeMetrics {
        self.metrics.borrow().clone()
    }

    /// Finalize metrics after the exchange.
    pub fn finalize_metrics(&self) {
        let mut metrics = self.metrics.borrow_mut();
        metrics.tasks_run = self.event_loop.tasks_run();
        metrics.duration = Some(self.start_time.elapsed());
        debug!(
            request_id = %self.request_id,
            tasks_run = metrics.tasks_run,
            "Exchange metrics finalized"
        );
    }
}

impl fmt::Debug for ExchangeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeContext")
            .field("request_id", &self.request_id)
            .field("event_loop", &self.event_loop)
            .finish_non_exhaustive()
    }
}
