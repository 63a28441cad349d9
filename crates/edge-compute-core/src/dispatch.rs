//! Exchange dispatch.
//!
//! [`dispatch`] drives one exchange from start to finish:
//!
//! 1. Take the downstream request and build the [`FetchEvent`]
//! 2. Run the handler synchronously
//! 3. Run the event loop while the event is active
//! 4. Send the fallback error response if nothing was sent
//! 5. Drop leftover continuations and collect metrics

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use edge_compute_common::{RuntimeConfig, RuntimeError, ScriptError};
use edge_compute_host::Host;

use crate::context::{ExchangeContext, ExchangeMetrics};
use crate::exchange::{ExchangeState, FetchEvent};

/// Handles the fetch event of each exchange.
pub trait FetchHandler {
    /// Called once per exchange, synchronously. Errors end up as the
    /// fallback error response unless a response already started.
    fn handle(&self, event: &FetchEvent) -> Result<(), ScriptError>;
}

impl<F> FetchHandler for F
where
    F: Fn(&FetchEvent) -> Result<(), ScriptError>,
{
    fn handle(&self, event: &FetchEvent) -> Result<(), ScriptError> {
        self(event)
    }
}

/// What happened during one exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub request_id: String,
    /// Final state of the exchange.
    pub state: ExchangeState,
    pub metrics: ExchangeMetrics,
}

impl ExchangeOutcome {
    /// Returns `true` if the handler's own response was delivered.
    pub fn is_success(&self) -> bool {
        self.state == ExchangeState::ResponseDone
    }

    /// Returns `true` if the fallback error response was sent.
    pub fn is_error(&self) -> bool {
        self.state == ExchangeState::RespondedWithError
    }
}

/// Run one exchange on `cx` with `handler`.
///
/// # Errors
///
/// Returns an error if the downstream request can't be taken or the event
/// loop fails. A response is still sent in the latter case.
#[instrument(skip_all, fields(request_id = %cx.request_id()))]
pub fn dispatch(
    cx: &Rc<ExchangeContext>,
    handler: &dyn FetchHandler,
) -> Result<ExchangeOutcome, RuntimeError> {
    let event = FetchEvent::new(cx)?;
    info!(
        method = %event.request().method(),
        url = %event.request().url(),
        "Exchange started"
    );

    event.set_dispatching(true);
    let handled = handler.handle(&event);
    event.set_dispatching(false);
    if let Err(e) = handled {
        warn!(error = %e, "Fetch handler failed");
        event.respond_with_error();
    }

    let looped = cx.event_loop().run(cx, || event.is_active());
    if let Err(e) = &looped {
        error!(error = %e, "Event loop failed");
    }
    if !event.response_started() {
        warn!(state = %event.state(), "Exchange ended without a response");
        event.respond_with_error();
    }

    cx.event_loop().clear();
    cx.finalize_metrics();
    looped?;

    let outcome = ExchangeOutcome {
        request_id: cx.request_id().to_string(),
        state: event.state(),
        metrics: cx.metrics(),
    };
    info!(
        state = %outcome.state,
        tasks_run = outcome.metrics.tasks_run,
        duration_ms = outcome.metrics.duration.map_or(0, |d| d.as_millis()),
        "Exchange finished"
    );
    Ok(outcome)
}

/// Runs exchanges with a shared handler and configuration.
///
/// The dispatcher is `Send + Sync` and can be shared across threads; each
/// call to [`Dispatcher::run`] builds its own single-threaded context.
pub struct Dispatcher {
    handler: Arc<dyn FetchHandler + Send + Sync>,
    config: RuntimeConfig,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn FetchHandler + Send + Sync>, config: RuntimeConfig) -> Self {
        Self { handler, config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run one exchange against `host` under `request_id`.
    ///
    /// # Errors
    ///
    /// See [`dispatch`].
    pub fn run(
        &self,
        host: Rc<dyn Host>,
        request_id: impl Into<String>,
    ) -> Result<ExchangeOutcome, RuntimeError> {
        let cx = ExchangeContext::with_request_id(host, self.config.clone(), request_id);
        dispatch(&cx, self.handler.as_ref())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{Response, ResponseInit};
    use edge_compute_host::{DownstreamRequest, Session};

    fn context() -> (
        Rc<ExchangeContext>,
        tokio::sync::oneshot::Receiver<edge_compute_host::DownstreamResponse>,
    ) {
        let (session, response) =
            Session::builder(DownstreamRequest::get("http://localhost/")).build();
        (
            ExchangeContext::new(Rc::new(session), RuntimeConfig::default()),
            response,
        )
    }

    #[test]
    fn test_handler_response() {
        let (cx, mut response) = context();
        let handler = |event: &FetchEvent| {
            let cx = Rc::clone(event.context());
            event.respond_with(async move {
                Response::new(&cx, Some("hello".into()), ResponseInit::with_status(201))
            })
        };

        let outcome = dispatch(&cx, &handler).unwrap();
        assert!(outcome.is_success());

        let mut response = response.try_recv().unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(&response.body_now()[..], b"hello");
    }

    #[test]
    fn test_handler_error_sends_500() {
        let (cx, mut response) = context();
        let handler = |_: &FetchEvent| -> Result<(), ScriptError> { Err(ScriptError::thrown("boom")) };

        let outcome = dispatch(&cx, &handler).unwrap();
        assert!(outcome.is_error());
        assert_eq!(response.try_recv().unwrap().status, 500);
    }

    #[test]
    fn test_no_response_sends_500() {
        let (cx, mut response) = context();
        let handler = |_: &FetchEvent| -> Result<(), ScriptError> { Ok(()) };

        let outcome = dispatch(&cx, &handler).unwrap();
        assert_eq!(outcome.state, ExchangeState::RespondedWithError);
        assert_eq!(response.try_recv().unwrap().status, 500);
    }

    #[test]
    fn test_dispatcher_uses_request_id() {
        let dispatcher = Dispatcher::new(
            Arc::new(|event: &FetchEvent| {
                let cx = Rc::clone(event.context());
                event.respond_with(async move { Response::new(&cx, None, ResponseInit::default()) })
            }),
            RuntimeConfig::default(),
        );
        let (session, _response) =
            Session::builder(DownstreamRequest::get("http://localhost/")).build();

        let outcome = dispatcher.run(Rc::new(session), "req-1").unwrap();
        assert_eq!(outcome.request_id, "req-1");
        assert!(outcome.is_success());
    }
}
