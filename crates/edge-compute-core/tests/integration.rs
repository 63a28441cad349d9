//! Integration tests for edge-compute-core.
//!
//! These tests run whole exchanges against an in-process host session:
//! - Body reads and single consumption
//! - Transform pipelines feeding a streamed response
//! - The one-append fast path for identity pipelines
//! - Exchange state, keep-alive and the fallback error response
//! - Outbound fetch and host-ready task ordering
//! - Cache transactions

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use edge_compute_common::{ReasonCode, RuntimeConfig, ScriptError, StreamConfig};
use edge_compute_core::{
    BodyInit, CoreCache, ExchangeContext, ExchangeState, FetchEvent, Headers, Promise, Request,
    RequestInit, Response, ResponseInit, TransformStream, dispatch, fetch_url,
};
use edge_compute_host::{
    Backend, BackendRegistry, CacheLookupOptions, CacheStore, DelayedOrigin, DownstreamRequest,
    DownstreamResponse, Host, Session, StaticOrigin,
};
use tokio::sync::oneshot;

fn session(request: DownstreamRequest) -> (Rc<Session>, oneshot::Receiver<DownstreamResponse>) {
    let backends = Arc::new(BackendRegistry::new());
    backends.register(Backend::new(
        "fast",
        "http://fast.test",
        Arc::new(StaticOrigin::text(200, "fast")),
    ));
    backends.register(Backend::new(
        "slow",
        "http://slow.test",
        Arc::new(DelayedOrigin::new(
            Arc::new(StaticOrigin::text(200, "slow")),
            Duration::from_millis(50),
        )),
    ));
    let (session, response) = Session::builder(request).backends(backends).build();
    (Rc::new(session), response)
}

fn context(session: &Rc<Session>, config: RuntimeConfig) -> Rc<ExchangeContext> {
    let host: Rc<dyn Host> = session.clone();
    ExchangeContext::new(host, config)
}

fn run(cx: &Rc<ExchangeContext>) {
    cx.event_loop().run(cx, || true).unwrap();
}

fn respond(event: &FetchEvent, body: Option<BodyInit>) -> Result<(), ScriptError> {
    let cx = Rc::clone(event.context());
    event.respond_with(async move { Response::new(&cx, body, ResponseInit::default()) })
}

// ============================================================================
// Test: Body Reads
// ============================================================================

#[test]
fn test_body_read_in_chunks() {
    let (session, _response) =
        session(DownstreamRequest::new("POST", "http://localhost/").with_body("abc"));
    let config = RuntimeConfig {
        streams: StreamConfig {
            read_chunk_size: 2,
            ..StreamConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let cx = context(&session, config);
    let request = Request::downstream(&cx).unwrap();
    let reader = request.body().unwrap().get_reader().unwrap();

    let mut chunks = Vec::new();
    loop {
        let read = reader.read();
        run(&cx);
        match read.result().unwrap().unwrap() {
            Some(chunk) => chunks.push(chunk),
            None => break,
        }
    }

    assert_eq!(chunks, vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")]);
    assert_eq!(session.stats().body_reads(), 3);
    assert!(request.body_used());
}

#[test]
fn test_body_consumed_once() {
    let (session, _response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());
    let response = Response::new(&cx, Some("once".into()), ResponseInit::default()).unwrap();

    let first = response.text();
    let second = response.text();
    run(&cx);

    assert_eq!(first.result().unwrap().unwrap(), "once");
    let err = second.result().unwrap().unwrap_err();
    assert_eq!(err, ScriptError::type_error("Body has already been consumed"));
}

// ============================================================================
// Test: Transform Pipelines
// ============================================================================

#[test]
fn test_transform_pipeline_streams_in_order() {
    let (session, response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());

    let handler = |event: &FetchEvent| {
        let upper = TransformStream::from_fn(|chunk: Bytes| Ok(Bytes::from(chunk.to_ascii_uppercase())));
        let writer = upper.writable().get_writer()?;
        respond(event, Some(BodyInit::Stream(upper.readable())))?;
        event.wait_until(async move {
            writer.write("one ").await?;
            writer.write("two ").await?;
            writer.write("three").await?;
            writer.close().await
        })
    };

    let outcome = dispatch(&cx, &handler).unwrap();
    assert_eq!(outcome.state, ExchangeState::ResponseDone);

    let mut response = response.blocking_recv().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body_now()[..], b"ONE TWO THREE");
}

#[test]
fn test_transform_error_truncates_response() {
    let (session, response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());

    let handler = |event: &FetchEvent| {
        let checked = TransformStream::from_fn(|chunk: Bytes| {
            if &chunk[..] == b"bad" {
                Err(ScriptError::type_error("bad chunk"))
            } else {
                Ok(chunk)
            }
        });
        let writer = checked.writable().get_writer()?;
        respond(event, Some(BodyInit::Stream(checked.readable())))?;
        event.wait_until(async move {
            writer.write("good").await?;
            writer.write("bad").await?;
            writer.write("never").await?;
            writer.close().await
        })
    };

    let outcome = dispatch(&cx, &handler).unwrap();
    assert_eq!(outcome.state, ExchangeState::ResponseDone);

    let mut response = response.blocking_recv().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body_now()[..], b"good");
}

#[test]
fn test_identity_pipeline_appends_once() {
    let (session, response) =
        session(DownstreamRequest::new("POST", "http://localhost/").with_body("payload"));
    let cx = context(&session, RuntimeConfig::default());

    let handler = |event: &FetchEvent| {
        let cx = event.context();
        let identity = TransformStream::identity();
        let body = event
            .request()
            .body()
            .ok_or_else(|| ScriptError::type_error("missing body"))?;
        let readable = body.pipe_through(cx, &identity)?;
        let response = Response::new(cx, Some(BodyInit::Stream(readable)), ResponseInit::default())?;
        event.respond_with(async move { Ok(response) })
    };

    let outcome = dispatch(&cx, &handler).unwrap();
    assert_eq!(outcome.state, ExchangeState::ResponseDone);
    assert_eq!(session.stats().body_appends(), 1);
    assert_eq!(session.stats().body_reads(), 0);

    let mut response = response.blocking_recv().unwrap();
    assert_eq!(&response.body_now()[..], b"payload");
}

// ============================================================================
// Test: Exchange State
// ============================================================================

#[test]
fn test_second_respond_with_rejected() {
    let (session, response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());
    let seen = Rc::new(RefCell::new(Vec::new()));

    let states = Rc::clone(&seen);
    let handler = move |event: &FetchEvent| {
        states.borrow_mut().push(event.state());
        respond(event, Some("first".into()))?;
        states.borrow_mut().push(event.state());
        let err = respond(event, Some("second".into())).unwrap_err();
        assert!(err.message().contains("can't be called twice"));
        Ok(())
    };

    let outcome = dispatch(&cx, &handler).unwrap();
    assert_eq!(
        *seen.borrow(),
        vec![ExchangeState::Unhandled, ExchangeState::WaitToRespond]
    );
    assert_eq!(outcome.state, ExchangeState::ResponseDone);

    let mut response = response.blocking_recv().unwrap();
    assert_eq!(&response.body_now()[..], b"first");
}

#[test]
fn test_error_response_sent_once() {
    let (session, response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());

    let handler = |event: &FetchEvent| {
        event.respond_with_error();
        event.respond_with_error();
        assert_eq!(event.state(), ExchangeState::RespondedWithError);
        assert!(respond(event, None).is_err());
        Ok(())
    };

    let outcome = dispatch(&cx, &handler).unwrap();
    assert!(outcome.is_error());
    assert_eq!(response.blocking_recv().unwrap().status, 500);
}

#[test]
fn test_rejected_response_future_sends_500() {
    let (session, response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());

    let handler = |event: &FetchEvent| {
        event.respond_with(async { Err(ScriptError::thrown("handler gave up")) })
    };

    let outcome = dispatch(&cx, &handler).unwrap();
    assert_eq!(outcome.state, ExchangeState::RespondedWithError);
    assert_eq!(response.blocking_recv().unwrap().status, 500);
}

#[test]
fn test_wait_until_keeps_exchange_alive() {
    let (session, _response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());
    let flushed = Rc::new(RefCell::new(false));

    let done = Rc::clone(&flushed);
    let handler = move |event: &FetchEvent| {
        respond(event, None)?;
        let timer: Promise<()> = Promise::new();
        let fire = timer.clone();
        event
            .context()
            .set_timeout(Duration::from_millis(20), move || {
                fire.resolve(());
            });
        let done = Rc::clone(&done);
        event.wait_until(async move {
            timer.await?;
            *done.borrow_mut() = true;
            Ok(())
        })
    };

    let outcome = dispatch(&cx, &handler).unwrap();
    assert!(outcome.is_success());
    assert!(*flushed.borrow());
}

#[test]
fn test_wait_until_without_response_delays_fallback() {
    let (session, response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());
    let response = Rc::new(RefCell::new(response));
    let sent_early = Rc::new(RefCell::new(None));

    let (rx, seen) = (Rc::clone(&response), Rc::clone(&sent_early));
    let handler = move |event: &FetchEvent| {
        let timer: Promise<()> = Promise::new();
        let fire = timer.clone();
        event
            .context()
            .set_timeout(Duration::from_millis(20), move || {
                fire.resolve(());
            });
        let (rx, seen) = (Rc::clone(&rx), Rc::clone(&seen));
        event.wait_until(async move {
            timer.await?;
            *seen.borrow_mut() = Some(rx.borrow_mut().try_recv().is_ok());
            Ok(())
        })
    };

    let outcome = dispatch(&cx, &handler).unwrap();
    assert_eq!(outcome.state, ExchangeState::RespondedWithError);
    assert_eq!(*sent_early.borrow(), Some(false), "fallback waited for the promise");
    assert_eq!(response.borrow_mut().try_recv().unwrap().status, 500);
}

// ============================================================================
// Test: Framing
// ============================================================================

fn send_with_content_length(declared: &'static str) -> DownstreamResponse {
    let (session, response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());

    let handler = move |event: &FetchEvent| {
        let cx = Rc::clone(event.context());
        event.respond_with(async move {
            let init = ResponseInit {
                headers: Some(Headers::from_pairs([("content-length", declared)])?),
                manual_framing_headers: Some(true),
                ..ResponseInit::default()
            };
            Response::new(&cx, Some("hello".into()), init)
        })
    };

    assert!(dispatch(&cx, &handler).unwrap().is_success());
    response.blocking_recv().unwrap()
}

#[test]
fn test_manual_framing_with_matching_length() {
    let response = send_with_content_length("5");
    assert_eq!(response.header("content-length"), Some("5"));
}

#[test]
fn test_manual_framing_with_wrong_length_falls_back() {
    let mut response = send_with_content_length("3");
    assert_eq!(response.header("content-length"), None);
    assert_eq!(response.body_now(), Bytes::from_static(b"hello"));
}

// ============================================================================
// Test: Fetch
// ============================================================================

#[test]
fn test_unregistered_backend() {
    let (session, response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());
    let reason = Rc::new(RefCell::new(None));

    let seen = Rc::clone(&reason);
    let handler = move |event: &FetchEvent| {
        let cx = Rc::clone(event.context());
        let seen = Rc::clone(&seen);
        event.respond_with(async move {
            let upstream = fetch_url(
                &cx,
                "http://nowhere.test/",
                RequestInit::default().backend("nowhere"),
            );
            match upstream.await {
                Ok(response) => Ok(response),
                Err(e) => {
                    *seen.borrow_mut() = e.reason();
                    Response::new(&cx, Some(e.message().to_string().into()), ResponseInit::with_status(502))
                }
            }
        })
    };

    dispatch(&cx, &handler).unwrap();
    assert_eq!(*reason.borrow(), Some(ReasonCode::BackendDoesNotExist));
    assert_eq!(response.blocking_recv().unwrap().status, 502);
}

#[test]
fn test_tasks_run_in_ready_order() {
    let (session, _response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());
    let order = Rc::new(RefCell::new(Vec::new()));

    for backend in ["slow", "fast"] {
        let url = format!("http://{backend}.test/");
        let order = Rc::clone(&order);
        fetch_url(&cx, &url, RequestInit::default().backend(backend)).on_settled(move |result| {
            assert!(result.is_ok());
            order.borrow_mut().push(backend);
        });
    }
    run(&cx);

    assert_eq!(*order.borrow(), vec!["fast", "slow"]);
}

#[test]
fn test_proxy_upstream_body() {
    let (session, response) = session(DownstreamRequest::get("http://localhost/"));
    let cx = context(&session, RuntimeConfig::default());

    let handler = |event: &FetchEvent| {
        let cx = Rc::clone(event.context());
        event.respond_with(async move {
            fetch_url(&cx, "http://fast.test/", RequestInit::default().backend("fast")).await
        })
    };

    let outcome = dispatch(&cx, &handler).unwrap();
    assert!(outcome.is_success());

    let mut response = response.blocking_recv().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body_now()[..], b"fast");
}

// ============================================================================
// Test: Headers
// ============================================================================

#[test]
fn test_header_canonicalization() {
    let mut headers = Headers::from_pairs([("Content-Type", "  text/plain\t")]).unwrap();
    assert_eq!(headers.get("content-type").unwrap().as_deref(), Some("text/plain"));

    headers.append("X-Tag", "a").unwrap();
    headers.append("x-tag", "b").unwrap();
    assert_eq!(headers.get("X-TAG").unwrap().as_deref(), Some("a, b"));

    assert!(headers.set("bad name", "v").unwrap_err().is_type_error());
    assert!(headers.set("x-ok", "line\r\nbreak").unwrap_err().is_type_error());
}

#[test]
fn test_request_headers_reach_host() {
    let (session, _response) = session(
        DownstreamRequest::get("http://localhost/").with_header("X-Forwarded-For", "10.0.0.1"),
    );
    let cx = context(&session, RuntimeConfig::default());
    let request = Request::downstream(&cx).unwrap();

    assert_eq!(
        request.header("x-forwarded-for").unwrap().as_deref(),
        Some("10.0.0.1")
    );
    request.set_header("X-Edge", "on").unwrap();
    assert!(request.has_header("x-edge").unwrap());
}

// ============================================================================
// Test: Cache Transactions
// ============================================================================

#[test]
fn test_dropped_transaction_is_cancelled() {
    let cache = Arc::new(CacheStore::new(None));
    let lookup = |cache: &Arc<CacheStore>| {
        let (session, _response) = Session::builder(DownstreamRequest::get("http://localhost/"))
            .cache(Arc::clone(cache))
            .build();
        let cx = ExchangeContext::new(Rc::new(session), RuntimeConfig::default());
        let pending = CoreCache::transaction_lookup(&cx, "key", &CacheLookupOptions::default());
        run(&cx);
        let state = pending.result().unwrap().unwrap().state().unwrap();
        drop(pending);
        state
    };

    let first = lookup(&cache);
    assert!(first.must_insert_or_update());

    // The first transaction was dropped unresolved, so the obligation passes on
    // instead of leaving the key busy.
    let second = lookup(&cache);
    assert!(second.must_insert_or_update());
    assert!(!second.is_found());
}
