//! The inbound exchange and its state machine.
//!
//! A [`FetchEvent`] tracks whether and how the downstream response has been
//! produced. States only move forward:
//!
//! ```text
//! Unhandled ─▶ WaitToRespond ─▶ ResponseStreaming ─▶ ResponseDone
//!     │              │                 ╰──────────────────▲
//!     │              ╰────────────────────────────────────┤
//!     ╰──────────────┴──────▶ RespondedWithError           │
//! ```
//!
//! The exchange stays active while the handler runs, while a `respond_with`
//! or `wait_until` future is outstanding, and while a response body is being
//! streamed.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use edge_compute_common::ScriptError;
use edge_compute_host::HostResult;

use crate::body::pump_into_body;
use crate::context::ExchangeContext;
use crate::request::Request;
use crate::response::Response;

/// Progress of the downstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExchangeState {
    /// No response has been promised yet.
    Unhandled,
    /// `respond_with` was called; its future has not produced a response.
    WaitToRespond,
    /// The head is sent and the body is being streamed.
    ResponseStreaming,
    ResponseDone,
    /// The fallback error response was sent.
    RespondedWithError,
}

impl ExchangeState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unhandled => "unhandled",
            Self::WaitToRespond => "wait_to_respond",
            Self::ResponseStreaming => "response_streaming",
            Self::ResponseDone => "response_done",
            Self::RespondedWithError => "responded_with_error",
        }
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct EventInner {
    cx: Rc<ExchangeContext>,
    request: Request,
    state: Cell<ExchangeState>,
    dispatching: Cell<bool>,
    keep_alive: Cell<usize>,
}

/// The event a handler receives for one inbound exchange.
#[derive(Clone)]
pub struct FetchEvent {
    inner: Rc<EventInner>,
}

impl FetchEvent {
    /// Take the downstream request and create the event for it.
    pub(crate) fn new(cx: &Rc<ExchangeContext>) -> Result<Self, ScriptError> {
        let request = Request::downstream(cx)?;
        Ok(Self {
            inner: Rc::new(EventInner {
                cx: Rc::clone(cx),
                request,
                state: Cell::new(ExchangeState::Unhandled),
                dispatching: Cell::new(false),
                keep_alive: Cell::new(0),
            }),
        })
    }

    /// The downstream request.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn context(&self) -> &Rc<ExchangeContext> {
        &self.inner.cx
    }

    pub fn state(&self) -> ExchangeState {
        self.inner.state.get()
    }

    pub fn client_address(&self) -> Result<Option<IpAddr>, ScriptError> {
        Ok(self.inner.cx.host().downstream_client_addr()?)
    }

    pub fn server_address(&self) -> Result<Option<IpAddr>, ScriptError> {
        Ok(self.inner.cx.host().downstream_server_addr()?)
    }

    /// Number of outstanding `respond_with`/`wait_until` futures.
    pub fn keep_alive(&self) -> usize {
        self.inner.keep_alive.get()
    }

    pub(crate) fn set_dispatching(&self, dispatching: bool) {
        self.inner.dispatching.set(dispatching);
    }

    /// True while the handler runs, a keep-alive is held, or the response
    /// body is streaming.
    pub fn is_active(&self) -> bool {
        self.inner.dispatching.get()
            || self.inner.keep_alive.get() > 0
            || self.state() == ExchangeState::ResponseStreaming
    }

    /// True once a response head went out.
    pub fn response_started(&self) -> bool {
        !matches!(
            self.state(),
            ExchangeState::Unhandled | ExchangeState::WaitToRespond
        )
    }

    fn set_state(&self, state: ExchangeState) {
        let current = self.state();
        if state <= current {
            return;
        }
        debug!(
            request_id = %self.inner.cx.request_id(),
            from = %current,
            to = %state,
            "Exchange state changed"
        );
        self.inner.state.set(state);
    }

    fn hold(&self) {
        self.inner.keep_alive.set(self.inner.keep_alive.get() + 1);
    }

    fn release(&self) {
        self.inner
            .keep_alive
            .set(self.inner.keep_alive.get().saturating_sub(1));
    }

    /// Respond with the response `response` produces.
    ///
    /// # Errors
    ///
    /// TypeError when called outside the handler, or a second time.
    pub fn respond_with(
        &self,
        response: impl Future<Output = Result<Response, ScriptError>> + 'static,
    ) -> Result<(), ScriptError> {
        if !self.inner.dispatching.get() {
            return Err(ScriptError::type_error(
                "FetchEvent#respondWith must be called synchronously from within a FetchEvent \
                 handler",
            ));
        }
        if self.state() != ExchangeState::Unhandled {
            return Err(ScriptError::type_error(
                "FetchEvent#respondWith can't be called twice on the same event",
            ));
        }
        self.hold();
        self.set_state(ExchangeState::WaitToRespond);

        let event = self.clone();
        self.inner.cx.spawn(async move {
            match response.await {
                Err(e) => {
                    warn!(
                        request_id = %event.inner.cx.request_id(),
                        error = %e,
                        "respondWith future rejected"
                    );
                    event.respond_with_error();
                }
                Ok(response) if event.state() == ExchangeState::WaitToRespond => {
                    if let Err(e) = event.send_response(&response) {
                        error!(
                            request_id = %event.inner.cx.request_id(),
                            error = %e,
                            "Failed to send response"
                        );
                        event.respond_with_error();
                    }
                }
                Ok(_) => {}
            }
            event.release();
        });
        Ok(())
    }

    /// Keep the exchange alive until `future` settles.
    ///
    /// # Errors
    ///
    /// TypeError when the exchange is no longer active.
    pub fn wait_until<T: 'static>(
        &self,
        future: impl Future<Output = Result<T, ScriptError>> + 'static,
    ) -> Result<(), ScriptError> {
        if !self.is_active() {
            return Err(ScriptError::type_error(
                "FetchEvent#waitUntil called on inactive event",
            ));
        }
        self.hold();
        let event = self.clone();
        self.inner.cx.spawn(async move {
            if let Err(e) = future.await {
                debug!(
                    request_id = %event.inner.cx.request_id(),
                    error = %e,
                    "waitUntil future rejected"
                );
            }
            event.release();
        });
        Ok(())
    }

    /// Send an empty 500 response. Only possible before a response started;
    /// later calls do nothing.
    pub fn respond_with_error(&self) {
        if self.response_started() {
            return;
        }
        self.set_state(ExchangeState::RespondedWithError);
        error!(
            request_id = %self.inner.cx.request_id(),
            "Responding with an internal error"
        );
        if let Err(e) = self.send_error_response() {
            error!(
                request_id = %self.inner.cx.request_id(),
                error = %e,
                "Failed to send the error response"
            );
        }
    }

    fn send_error_response(&self) -> HostResult<()> {
        let host = self.inner.cx.host();
        let response = host.resp_new()?;
        host.resp_status_set(&response, 500)?;
        let body = host.body_new()?;
        host.resp_send_downstream(response, body)
    }

    /// Send `response` downstream, streaming its body if it is a stream.
    fn send_response(&self, response: &Response) -> Result<(), ScriptError> {
        let cx = &self.inner.cx;
        response.sync_for_send()?;
        let reader = response.object().maybe_stream_body(cx.host())?;
        let head = response.take_handle();
        let body = response.object().body_slot();

        let Some(reader) = reader else {
            let body = body.borrow_mut().take();
            cx.host().resp_send_downstream(head, body)?;
            self.set_state(ExchangeState::ResponseDone);
            info!(
                request_id = %cx.request_id(),
                status = response.status(),
                "Response sent"
            );
            return Ok(());
        };

        cx.host()
            .resp_send_downstream_streaming(head, &body.borrow())?;
        self.set_state(ExchangeState::ResponseStreaming);
        info!(
            request_id = %cx.request_id(),
            status = response.status(),
            "Response streaming"
        );
        let event = self.clone();
        pump_into_body(cx, reader, body)?.on_settled(move |result| {
            if let Err(e) = result {
                warn!(
                    request_id = %event.inner.cx.request_id(),
                    error = %e,
                    "Response body stream errored"
                );
            }
            event.set_state(ExchangeState::ResponseDone);
        });
        Ok(())
    }
}

impl fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchEvent")
            .field("state", &self.state())
            .field("dispatching", &self.inner.dispatching.get())
            .field("keep_alive", &self.inner.keep_alive.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseInit;
    use edge_compute_common::RuntimeConfig;
    use edge_compute_host::{DownstreamRequest, Session};

    fn event() -> (FetchEvent, tokio::sync::oneshot::Receiver<edge_compute_host::DownstreamResponse>) {
        let (session, response) = Session::builder(DownstreamRequest::get("http://localhost/")).build();
        let cx = ExchangeContext::new(Rc::new(session), RuntimeConfig::default());
        (FetchEvent::new(&cx).unwrap(), response)
    }

    #[test]
    fn test_state_order() {
        assert!(ExchangeState::Unhandled < ExchangeState::WaitToRespond);
        assert!(ExchangeState::WaitToRespond < ExchangeState::ResponseStreaming);
        assert!(ExchangeState::ResponseStreaming < ExchangeState::ResponseDone);
        assert!(ExchangeState::ResponseDone < ExchangeState::RespondedWithError);
    }

    #[test]
    fn test_respond_with_outside_dispatch() {
        let (event, _response) = event();
        let cx = Rc::clone(event.context());
        let err = event
            .respond_with(async move { Response::new(&cx, None, ResponseInit::default()) })
            .unwrap_err();

        assert!(err.message().contains("must be called synchronously"));
        assert_eq!(event.state(), ExchangeState::Unhandled);
    }

    #[test]
    fn test_respond_with_twice() {
        let (event, _response) = event();
        event.set_dispatching(true);
        let cx = Rc::clone(event.context());
        event
            .respond_with(async move { Response::new(&cx, None, ResponseInit::default()) })
            .unwrap();
        let cx = Rc::clone(event.context());
        let err = event
            .respond_with(async move { Response::new(&cx, None, ResponseInit::default()) })
            .unwrap_err();

        assert_eq!(
            err,
            ScriptError::type_error("FetchEvent#respondWith can't be called twice on the same event")
        );
        assert_eq!(event.state(), ExchangeState::WaitToRespond);
        assert_eq!(event.keep_alive(), 1);
    }

    #[test]
    fn test_respond_with_error_is_terminal() {
        let (event, mut response) = event();
        event.respond_with_error();
        event.respond_with_error();

        assert_eq!(event.state(), ExchangeState::RespondedWithError);
        assert!(event.response_started());
        assert_eq!(response.try_recv().unwrap().status, 500);
    }

    #[test]
    fn test_wait_until_on_inactive_event() {
        let (event, _response) = event();
        let err = event.wait_until(async { Ok(()) }).unwrap_err();
        assert_eq!(
            err,
            ScriptError::type_error("FetchEvent#waitUntil called on inactive event")
        );
    }

    #[test]
    fn test_state_never_moves_back() {
        let (event, _response) = event();
        event.set_state(ExchangeState::ResponseDone);
        event.set_state(ExchangeState::WaitToRespond);
        assert_eq!(event.state(), ExchangeState::ResponseDone);
    }
}
