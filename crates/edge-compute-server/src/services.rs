//! Built-in services.
//!
//! Each [`ServiceKind`] maps to a fetch handler:
//!
//! - `proxy`: forward the request to the service's backend and stream the
//!   response back untouched
//! - `echo`: send the request body back through an identity pipeline
//! - `uppercase`: forward like `proxy`, piping the response body through an
//!   upper-casing transform
//! - `gzip`: forward like `proxy`, compressing a response body the origin
//!   did not already encode

use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;

use edge_compute_common::{RuntimeError, ScriptError, ServiceEntry, ServiceKind};
use edge_compute_core::{
    BodyInit, CompressionFormat, CompressionStream, FetchEvent, FetchHandler, Request,
    RequestInit, Response, ResponseInit, TransformStream, fetch,
};

/// Handler shared by every exchange of a service.
pub type SharedHandler = Arc<dyn FetchHandler + Send + Sync>;

/// Build the handler for `entry`.
///
/// # Errors
///
/// Returns an error if the service forwards but names no backend.
pub fn service_handler(entry: &ServiceEntry) -> Result<SharedHandler, RuntimeError> {
    let backend = || {
        entry.backend.clone().ok_or_else(|| {
            RuntimeError::invalid_config(format!(
                "Service '{}' of kind {:?} needs a backend",
                entry.id, entry.kind
            ))
        })
    };

    let handler: SharedHandler = match entry.kind {
        ServiceKind::Proxy => {
            let backend = backend()?;
            Arc::new(move |event: &FetchEvent| proxy(event, &backend))
        }
        ServiceKind::Echo => Arc::new(echo),
        ServiceKind::Uppercase => {
            let backend = backend()?;
            Arc::new(move |event: &FetchEvent| uppercase(event, &backend))
        }
        ServiceKind::Gzip => {
            let backend = backend()?;
            Arc::new(move |event: &FetchEvent| gzip(event, &backend))
        }
    };
    Ok(handler)
}

/// The downstream request, retargeted at `backend`.
fn forwarded(event: &FetchEvent, backend: &str) -> Result<Request, ScriptError> {
    Request::from_request(
        event.context(),
        event.request(),
        RequestInit::default().backend(backend),
    )
}

fn proxy(event: &FetchEvent, backend: &str) -> Result<(), ScriptError> {
    let cx = Rc::clone(event.context());
    let request = forwarded(event, backend)?;
    event.respond_with(async move { fetch(&cx, &request).await })
}

fn echo(event: &FetchEvent) -> Result<(), ScriptError> {
    let cx = event.context();
    let request = event.request();

    let mut headers = edge_compute_core::Headers::new();
    if let Some(content_type) = request.header("content-type")? {
        headers.set("content-type", &content_type)?;
    }
    let init = ResponseInit {
        headers: Some(headers),
        ..ResponseInit::default()
    };

    let body = match request.body() {
        Some(body) => {
            let identity = TransformStream::identity();
            Some(BodyInit::Stream(body.pipe_through(cx, &identity)?))
        }
        None => None,
    };
    let response = Response::new(cx, body, init)?;
    event.respond_with(async move { Ok(response) })
}

fn uppercase(event: &FetchEvent, backend: &str) -> Result<(), ScriptError> {
    let cx = Rc::clone(event.context());
    let request = forwarded(event, backend)?;
    event.respond_with(async move {
        let upstream = fetch(&cx, &request).await?;
        let status = upstream.status();

        let mut headers = upstream.headers()?;
        headers.delete("content-length")?;
        let body = match upstream.body() {
            Some(body) if !matches!(status, 101 | 204 | 205 | 304) => {
                let upper = TransformStream::from_fn(|chunk: Bytes| {
                    Ok(Bytes::from(chunk.to_ascii_uppercase()))
                });
                Some(BodyInit::Stream(body.pipe_through(&cx, &upper)?))
            }
            _ => None,
        };

        let init = ResponseInit {
            status: Some(status),
            status_text: Some(upstream.status_text()),
            headers: Some(headers),
            ..ResponseInit::default()
        };
        Response::new(&cx, body, init)
    })
}

fn gzip(event: &FetchEvent, backend: &str) -> Result<(), ScriptError> {
    let cx = Rc::clone(event.context());
    let request = forwarded(event, backend)?;
    event.respond_with(async move {
        let upstream = fetch(&cx, &request).await?;
        if upstream.has_header("content-encoding")? {
            return Ok(upstream);
        }
        let status = upstream.status();

        let mut headers = upstream.headers()?;
        let body = match upstream.body() {
            Some(body) if !matches!(status, 101 | 204 | 205 | 304) => {
                headers.delete("content-length")?;
                headers.set("content-encoding", CompressionFormat::Gzip.as_str())?;
                let compressor = CompressionStream::new(CompressionFormat::Gzip);
                let _piped = body.pipe_to(&cx, &compressor.writable())?;
                Some(BodyInit::Stream(compressor.readable()))
            }
            _ => None,
        };

        let init = ResponseInit {
            status: Some(status),
            status_text: Some(upstream.status_text()),
            headers: Some(headers),
            ..ResponseInit::default()
        };
        Response::new(&cx, body, init)
    })
}
