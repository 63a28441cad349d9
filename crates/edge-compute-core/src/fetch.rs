//! Outbound requests.
//!
//! [`fetch`] sends a request to a backend without waiting: the send is
//! started on the host right away and a [`PendingRequestTask`] settles the
//! returned promise once the host signals the response is in.

use std::rc::Rc;

use tracing::{debug, warn};
use url::Url;

use edge_compute_common::{HostError, ScriptError};
use edge_compute_host::{AsyncItemHandle, BackendConfig};

use crate::body::pump_into_body;
use crate::context::ExchangeContext;
use crate::event_loop::AsyncTask;
use crate::promise::Promise;
use crate::request::{Request, RequestInit};
use crate::response::Response;

/// Send `request` and resolve with the backend's response.
///
/// Problems found before sending reject the promise rather than failing the
/// call. The request's head and body are spent either way.
pub fn fetch(cx: &Rc<ExchangeContext>, request: &Request) -> Promise<Response> {
    if let Err(e) = start_send(cx, request) {
        return Promise::rejected(e);
    }
    let done = Promise::new();
    let task = PendingRequestTask {
        request: request.clone(),
        done: done.clone(),
    };
    match cx.event_loop().queue_task(Box::new(task)) {
        Ok(()) => done,
        Err(e) => Promise::rejected(e.into()),
    }
}

/// Build a request for `url` and [`fetch`] it.
pub fn fetch_url(cx: &Rc<ExchangeContext>, url: &str, init: RequestInit) -> Promise<Response> {
    match Request::new(cx, url, init) {
        Ok(request) => fetch(cx, &request),
        Err(e) => Promise::rejected(e),
    }
}

/// Pick the backend for `request`: its own, then one derived from its URL
/// when dynamic backends are allowed, then the default.
fn resolve_backend(cx: &ExchangeContext, request: &Request) -> Result<String, ScriptError> {
    if let Some(backend) = request.backend() {
        return Ok(backend);
    }
    if cx.allow_dynamic_backends() {
        if let Some(backend) = dynamic_backend(cx, &request.url())? {
            return Ok(backend);
        }
    }
    if let Some(backend) = cx.default_backend() {
        return Ok(backend.to_string());
    }
    Err(ScriptError::type_error(format!(
        "No backend specified for request with url {}. Must provide a `backend` property on the \
         `init` object passed to either `new Request()` or `fetch`",
        request.url()
    )))
}

/// Register (once) a backend named after the URL's authority.
fn dynamic_backend(cx: &ExchangeContext, url: &str) -> Result<Option<String>, ScriptError> {
    let Ok(url) = Url::parse(url) else {
        return Ok(None);
    };
    let Some(host_name) = url.host_str() else {
        return Ok(None);
    };
    let name = match url.port() {
        Some(port) => format!("{host_name}:{port}"),
        None => host_name.to_string(),
    };

    let host = cx.host();
    if !host.backend_exists(&name)? {
        let config = BackendConfig {
            use_ssl: url.scheme() == "https",
            ..BackendConfig::default()
        };
        host.backend_register_dynamic(&name, &url.origin().ascii_serialization(), &config)?;
        debug!(request_id = %cx.request_id(), backend = %name, "Registered dynamic backend");
    }
    Ok(Some(name))
}

fn send_error(backend: &str, error: HostError) -> ScriptError {
    if error.is_generic() || error.is_invalid_argument() {
        ScriptError::backend_does_not_exist(backend)
    } else {
        error.into()
    }
}

/// Sync the request to its host head and hand it to the host. A body that
/// is a stream is sent in streaming mode and pumped afterwards.
fn start_send(cx: &Rc<ExchangeContext>, request: &Request) -> Result<(), ScriptError> {
    let backend = resolve_backend(cx, request)?;
    request.sync_for_send()?;
    let reader = request.object().maybe_stream_body(cx.host())?;

    let host = cx.host();
    let head = request.with_data_mut(|data| data.handle.take());
    let body = request.object().body_slot();
    let sent = match reader {
        None => {
            let body = body.borrow_mut().take();
            host.req_send_async(head, body, &backend)
        }
        Some(_) => host.req_send_async_streaming(head, &body.borrow(), &backend),
    };
    let pending = sent.map_err(|e| send_error(&backend, e))?;
    debug!(
        request_id = %cx.request_id(),
        backend = %backend,
        url = %request.url(),
        streaming = reader.is_some(),
        "Request sent"
    );
    request.with_data_mut(|data| data.pending = pending);

    if let Some(reader) = reader {
        let request_id = cx.request_id().to_string();
        pump_into_body(cx, reader, body)?.on_settled(move |result| {
            if let Err(e) = result {
                warn!(request_id = %request_id, error = %e, "Streaming request body failed");
            }
        });
    }
    Ok(())
}

/// Waits for an outbound send and settles the fetch promise.
struct PendingRequestTask {
    request: Request,
    done: Promise<Response>,
}

impl AsyncTask for PendingRequestTask {
    fn handle(&self) -> AsyncItemHandle {
        self.request.with_data_mut(|data| data.pending.async_item())
    }

    fn run(self: Box<Self>, cx: &Rc<ExchangeContext>) {
        let pending = self.request.with_data_mut(|data| data.pending.take());
        let result = match cx.host().pending_req_wait(pending) {
            Ok(upstream) => Response::from_upstream(cx, upstream, self.request.url()),
            Err(e) => {
                debug!(request_id = %cx.request_id(), error = %e, "Send failed");
                Err(e.into())
            }
        };
        self.done.settle(result);
    }

    fn name(&self) -> &'static str {
        "pending_request"
    }
}
