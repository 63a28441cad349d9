//! Bodies of requests, responses and cache entries.
//!
//! Every exchange object owns a host body handle. As long as nobody asks for
//! a stream, the handle is what gets sent, appended or moved. Asking for the
//! body as a stream wraps the handle in a [`NativeSource`]; a body given as a
//! stream is kept as that stream and pumped into the handle when the object
//! is sent.
//!
//! A body is consumed at most once. Reading it, sending it or handing its
//! handle to another object marks it used.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};
use url::form_urlencoded;

use edge_compute_common::ScriptError;
use edge_compute_host::{BodyHandle, FramingHeadersMode, Host, HostResult, MessageRef};

use crate::cache::CacheEntryData;
use crate::context::ExchangeContext;
use crate::headers::Headers;
use crate::promise::Promise;
use crate::request::RequestData;
use crate::response::ResponseData;
use crate::streams::{
    NativeSink, NativeSource, ReadableStream, ReadableStreamReader, SharedBody, pump, shared_body,
};

/// Content type added for text bodies.
pub const TEXT_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";

/// Content type added for URL-encoded form bodies.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded;charset=UTF-8";

const UNUSABLE_STREAM: &str = "Can't use a ReadableStream that's locked or has ever been read \
                               from or canceled as a Request or Response body.";
pub(crate) const CONSUMED_BODY: &str = "Body has already been consumed";
const LOCKED_BODY: &str = "The ReadableStream body is already locked and can't be consumed";

/// A value accepted as a request or response body.
#[derive(Debug, Clone)]
pub enum BodyInit {
    /// Raw bytes, sent as they are with no content type.
    Bytes(Bytes),
    /// UTF-8 text.
    Text(String),
    /// URL-encoded form pairs.
    Form(Vec<(String, String)>),
    /// A stream, read when the object is sent or consumed.
    Stream(ReadableStream),
}

impl From<Bytes> for BodyInit {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for BodyInit {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<&'static [u8]> for BodyInit {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for BodyInit {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for BodyInit {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<ReadableStream> for BodyInit {
    fn from(stream: ReadableStream) -> Self {
        Self::Stream(stream)
    }
}

/// State every exchange object shares, whatever its kind.
pub(crate) struct BodyState {
    handle: SharedBody,
    has_body: bool,
    used: bool,
    stream: Option<ReadableStream>,
    url: String,
    /// Reified on first access; `None` means the host handle is current.
    headers: Option<Headers>,
}

/// What an exchange object is, with the data only that kind carries.
pub(crate) enum ExchangeKind {
    Request(RequestData),
    Response(ResponseData),
    CacheEntry(CacheEntryData),
}

/// A request, response or cache entry: a body plus its kind's data.
pub(crate) struct ExchangeObject {
    body: RefCell<BodyState>,
    kind: RefCell<ExchangeKind>,
}

impl ExchangeObject {
    /// An object without a body that owns `handle` for when it gets one.
    pub(crate) fn new(kind: ExchangeKind, handle: BodyHandle, url: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            body: RefCell::new(BodyState {
                handle: shared_body(handle),
                has_body: false,
                used: false,
                stream: None,
                url: url.into(),
                headers: None,
            }),
            kind: RefCell::new(kind),
        })
    }

    pub(crate) fn kind(&self) -> Ref<'_, ExchangeKind> {
        self.kind.borrow()
    }

    pub(crate) fn kind_mut(&self) -> RefMut<'_, ExchangeKind> {
        self.kind.borrow_mut()
    }

    /// The body handle slot. Streams over the body share it.
    pub(crate) fn body_slot(&self) -> SharedBody {
        Rc::clone(&self.body.borrow().handle)
    }

    pub(crate) fn url(&self) -> String {
        self.body.borrow().url.clone()
    }

    pub(crate) fn has_body(&self) -> bool {
        self.body.borrow().has_body
    }

    pub(crate) fn set_has_body(&self, has_body: bool) {
        self.body.borrow_mut().has_body = has_body;
    }

    /// True once the body was consumed or handed off, or its stream was
    /// read from.
    pub(crate) fn body_used(&self) -> bool {
        let body = self.body.borrow();
        body.used || body.stream.as_ref().is_some_and(ReadableStream::is_disturbed)
    }

    /// Run `f` on the host head this object's headers live on.
    pub(crate) fn with_message<R>(&self, f: impl FnOnce(MessageRef<'_>) -> R) -> Option<R> {
        match &*self.kind.borrow() {
            ExchangeKind::Request(data) => Some(f(MessageRef::Request(&data.handle))),
            ExchangeKind::Response(data) => Some(f(MessageRef::Response(&data.handle))),
            ExchangeKind::CacheEntry(_) => None,
        }
    }

    pub(crate) fn set_headers(&self, headers: Headers) {
        self.body.borrow_mut().headers = Some(headers);
    }

    /// Run `f` on the header collection, reifying it from the host first.
    pub(crate) fn with_headers<R>(
        &self,
        host: &dyn Host,
        f: impl FnOnce(&mut Headers) -> Result<R, ScriptError>,
    ) -> Result<R, ScriptError> {
        self.reify_headers(host)?;
        let mut body = self.body.borrow_mut();
        f(body.headers.get_or_insert_with(Headers::new))
    }

    fn reify_headers(&self, host: &dyn Host) -> HostResult<()> {
        if self.body.borrow().headers.is_some() {
            return Ok(());
        }
        let headers = match self.with_message(|message| Headers::read_from(host, message)) {
            Some(read) => read?,
            None => Headers::new(),
        };
        self.body.borrow_mut().headers = Some(headers);
        Ok(())
    }

    /// Write reified headers back to the host head. Headers nobody touched
    /// are only cached, so they stay readable once the head is sent.
    pub(crate) fn sync_headers(&self, host: &dyn Host) -> HostResult<()> {
        if self.body.borrow().headers.is_none() {
            return self.reify_headers(host);
        }
        let body = self.body.borrow();
        let Some(headers) = body.headers.as_ref() else {
            return Ok(());
        };
        self.with_message(|message| headers.write_to(host, message))
            .unwrap_or(Ok(()))
    }

    /// The framing mode to send with. Manual framing whose `content-length`
    /// disagrees with the host body's known length falls back to automatic.
    pub(crate) fn checked_framing(
        &self,
        host: &dyn Host,
        mode: FramingHeadersMode,
    ) -> Result<FramingHeadersMode, ScriptError> {
        if mode != FramingHeadersMode::ManuallyFromHeaders || self.stream().is_some() {
            return Ok(mode);
        }
        let Some(declared) = self.with_headers(host, |headers| headers.get("content-length"))?
        else {
            return Ok(mode);
        };
        let known = {
            let slot = self.body_slot();
            let handle = slot.borrow();
            if !handle.is_valid() {
                return Ok(mode);
            }
            host.body_known_length(&handle)?
        };
        match known {
            Some(known) if declared.trim().parse::<u64>().ok() != Some(known) => {
                warn!(
                    declared = %declared,
                    known,
                    "content-length does not match the body, using automatic framing"
                );
                Ok(FramingHeadersMode::Automatic)
            }
            _ => Ok(mode),
        }
    }

    /// Install `init` as this object's body.
    ///
    /// Buffers land in a complete host body right away and add their content
    /// type unless one is already set. A stream is kept for later; if it is
    /// the readable end of a pipeline, this object becomes the pipeline's
    /// owner so a native body piped into it can be appended in one step.
    pub(crate) fn extract_body(
        self: &Rc<Self>,
        host: &dyn Host,
        init: BodyInit,
    ) -> Result<(), ScriptError> {
        let (bytes, content_type) = match init {
            BodyInit::Stream(stream) => {
                if stream.is_unusable() {
                    return Err(ScriptError::type_error(UNUSABLE_STREAM));
                }
                if let Some(pipeline) = stream.transform() {
                    if !pipeline.used_as_mixin() {
                        pipeline.set_owner(self);
                    }
                }
                let mut body = self.body.borrow_mut();
                body.stream = Some(stream);
                body.has_body = true;
                return Ok(());
            }
            BodyInit::Bytes(bytes) => (bytes, None),
            BodyInit::Text(text) => (Bytes::from(text), Some(TEXT_CONTENT_TYPE)),
            BodyInit::Form(pairs) => {
                let encoded = form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(&pairs)
                    .finish();
                (Bytes::from(encoded), Some(FORM_CONTENT_TYPE))
            }
        };

        let complete = host.body_from_bytes(bytes)?;
        let previous = std::mem::replace(&mut *self.body_slot().borrow_mut(), complete);
        if previous.is_valid() {
            host.body_close(previous)?;
        }
        if let Some(content_type) = content_type {
            self.with_headers(host, |headers| headers.maybe_add("content-type", content_type))?;
        }
        self.set_has_body(true);
        Ok(())
    }

    /// The body as a stream, wrapping the host body on first access.
    ///
    /// A host body that has already moved elsewhere yields a stream that
    /// is errored with the reuse error.
    pub(crate) fn body_stream(&self, cx: &Rc<ExchangeContext>) -> Option<ReadableStream> {
        let mut body = self.body.borrow_mut();
        if !body.has_body {
            return None;
        }
        if body.stream.is_none() {
            if body.used || !body.handle.borrow().is_valid() {
                return Some(ReadableStream::errored(ScriptError::type_error(
                    CONSUMED_BODY,
                )));
            }
            let stream = NativeSource::stream(cx, Rc::clone(&body.handle));
            body.stream = Some(stream);
        }
        body.stream.clone()
    }

    /// The body stream, if one was given or has been materialized.
    pub(crate) fn stream(&self) -> Option<ReadableStream> {
        self.body.borrow().stream.clone()
    }

    /// Hand this object's body to `to`, which has none yet. A body stream
    /// moves as the stream; a bare host body moves as the handle.
    pub(crate) fn transfer_body(
        &self,
        host: &dyn Host,
        to: &Rc<ExchangeObject>,
    ) -> Result<(), ScriptError> {
        match self.stream() {
            Some(stream) => {
                to.extract_body(host, BodyInit::Stream(stream))?;
                self.body.borrow_mut().used = true;
                Ok(())
            }
            None => Self::move_body_handle(host, self, to),
        }
    }

    /// Mark the body used, locking its stream if there is one.
    pub(crate) fn mark_body_used(&self) -> Result<(), ScriptError> {
        let stream = {
            let mut body = self.body.borrow_mut();
            body.used = true;
            body.stream.clone()
        };
        if let Some(stream) = stream {
            stream
                .lock()
                .map_err(|_| ScriptError::type_error(LOCKED_BODY))?;
        }
        Ok(())
    }

    /// Give `from`'s body handle to `to`, closing the handle `to` had.
    pub(crate) fn move_body_handle(
        host: &dyn Host,
        from: &ExchangeObject,
        to: &ExchangeObject,
    ) -> Result<(), ScriptError> {
        let moved = from.body_slot().borrow_mut().take();
        let previous = std::mem::replace(&mut *to.body_slot().borrow_mut(), moved);
        from.body.borrow_mut().used = true;
        to.set_has_body(true);
        if previous.is_valid() {
            host.body_close(previous)?;
        }
        Ok(())
    }

    /// Append `src`'s body to `dest`'s on the host side.
    pub(crate) fn append_body(
        host: &dyn Host,
        dest: &ExchangeObject,
        src: &ExchangeObject,
    ) -> Result<(), ScriptError> {
        let moved = src.body_slot().borrow_mut().take();
        src.body.borrow_mut().used = true;
        host.body_append(&dest.body_slot().borrow(), moved)?;
        dest.set_has_body(true);
        Ok(())
    }

    /// Read the whole body. Chunks come from queued reads, so the promise
    /// settles from the event loop.
    pub(crate) fn consume_body(&self, cx: &Rc<ExchangeContext>) -> Promise<Bytes> {
        if self.body_used() {
            return Promise::rejected(ScriptError::type_error(CONSUMED_BODY));
        }
        let Some(stream) = self.body_stream(cx) else {
            return Promise::resolved(Bytes::new());
        };
        if let Some(pipeline) = stream.transform() {
            pipeline.clear_owner();
        }
        let Ok(mut reader) = stream.get_reader() else {
            return Promise::rejected(ScriptError::type_error(LOCKED_BODY));
        };
        self.body.borrow_mut().used = true;

        let done = Promise::new();
        let settle = done.clone();
        cx.spawn(async move {
            let mut buf = BytesMut::new();
            let result = loop {
                match reader.read().await {
                    Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                    Ok(None) => break Ok(buf.freeze()),
                    Err(e) => break Err(e),
                }
            };
            reader.release_lock();
            trace!(ok = result.is_ok(), "Body consumed");
            settle.settle(result);
        });
        done
    }

    pub(crate) fn text(&self, cx: &Rc<ExchangeContext>) -> Promise<String> {
        self.consume_body(cx)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub(crate) fn json(&self, cx: &Rc<ExchangeContext>) -> Promise<serde_json::Value> {
        self.consume_body(cx).then(|read| {
            Promise::settled(read.and_then(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| ScriptError::thrown(format!("SyntaxError: {e}")))
            }))
        })
    }

    /// Split the body in two for a clone: this object keeps one branch and
    /// the other is returned. A host body being read by the split gets a
    /// fresh handle here.
    pub(crate) fn tee_body(
        &self,
        cx: &Rc<ExchangeContext>,
    ) -> Result<Option<ReadableStream>, ScriptError> {
        let Some(stream) = self.body_stream(cx) else {
            return Ok(None);
        };
        if let Some(pipeline) = stream.transform() {
            pipeline.clear_owner();
        }
        let reads_handle = stream.native_source().is_some();
        let (mine, theirs) = stream.tee()?;
        let fresh = if reads_handle {
            Some(shared_body(cx.host().body_new()?))
        } else {
            None
        };

        let mut body = self.body.borrow_mut();
        body.stream = Some(mine);
        if let Some(fresh) = fresh {
            body.handle = fresh;
        }
        Ok(Some(theirs))
    }

    /// Decide how to send this body.
    ///
    /// `None` means the host body handle already holds it (a native stream's
    /// handle is moved here first). `Some(reader)` means the caller must
    /// send in streaming mode and pump the reader into the handle.
    pub(crate) fn maybe_stream_body(
        &self,
        host: &dyn Host,
    ) -> Result<Option<ReadableStreamReader>, ScriptError> {
        let stream = self.body.borrow().stream.clone();
        let Some(stream) = stream else {
            self.body.borrow_mut().used = true;
            return Ok(None);
        };
        if stream.is_unusable() {
            return Err(ScriptError::type_error(UNUSABLE_STREAM));
        }

        if let Some(source) = stream.native_source() {
            let slot = self.body_slot();
            if !Rc::ptr_eq(source.body(), &slot) {
                let moved = source.body().borrow_mut().take();
                let previous = std::mem::replace(&mut *slot.borrow_mut(), moved);
                if previous.is_valid() {
                    host.body_close(previous)?;
                }
            }
            self.mark_body_used()?;
            return Ok(None);
        }
        if stream.is_closed() {
            self.mark_body_used()?;
            return Ok(None);
        }

        let reader = stream.get_reader()?;
        self.body.borrow_mut().used = true;
        Ok(Some(reader))
    }
}

impl fmt::Debug for ExchangeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.borrow();
        let kind = match &*self.kind.borrow() {
            ExchangeKind::Request(_) => "request",
            ExchangeKind::Response(_) => "response",
            ExchangeKind::CacheEntry(_) => "cache_entry",
        };
        f.debug_struct("ExchangeObject")
            .field("kind", &kind)
            .field("handle", &*body.handle.borrow())
            .field("has_body", &body.has_body)
            .field("used", &body.used)
            .finish_non_exhaustive()
    }
}

/// Pump `reader` into `body` until the stream ends, then close the body.
/// A stream error abandons the body instead.
pub(crate) fn pump_into_body(
    cx: &Rc<ExchangeContext>,
    reader: ReadableStreamReader,
    body: SharedBody,
) -> Result<Promise<()>, ScriptError> {
    let writer = NativeSink::stream(cx, body).get_writer()?;
    let done = Promise::new();
    let settle = done.clone();
    cx.spawn(async move {
        settle.settle(pump(reader, writer).await);
    });
    Ok(done)
}

/// Body accessors shared by every exchange object wrapper. The wrapper must
/// have `object()` and `context()`.
macro_rules! body_accessors {
    ($ty:ty) => {
        impl $ty {
            /// The body as a stream, or `None` when there is no body.
            pub fn body(&self) -> Option<$crate::streams::ReadableStream> {
                self.object().body_stream(self.context())
            }

            pub fn has_body(&self) -> bool {
                self.object().has_body()
            }

            pub fn body_used(&self) -> bool {
                self.object().body_used()
            }

            /// Read the whole body as bytes.
            pub fn array_buffer(&self) -> $crate::promise::Promise<::bytes::Bytes> {
                self.object().consume_body(self.context())
            }

            /// Read the whole body as UTF-8, replacing invalid sequences.
            pub fn text(&self) -> $crate::promise::Promise<String> {
                self.object().text(self.context())
            }

            pub fn json(&self) -> $crate::promise::Promise<::serde_json::Value> {
                self.object().json(self.context())
            }
        }
    };
}

/// Header accessors shared by requests and responses. The wrapper must have
/// `object()` and `context()`.
macro_rules! header_accessors {
    ($ty:ty) => {
        impl $ty {
            /// All values of `name` joined with `", "`.
            pub fn header(&self, name: &str) -> Result<Option<String>, ScriptError> {
                let host = self.context().host();
                self.object().with_headers(host, |headers| headers.get(name))
            }

            /// A snapshot of every header.
            pub fn headers(&self) -> Result<$crate::headers::Headers, ScriptError> {
                let host = self.context().host();
                self.object().with_headers(host, |headers| Ok(headers.clone()))
            }

            pub fn has_header(&self, name: &str) -> Result<bool, ScriptError> {
                let host = self.context().host();
                self.object().with_headers(host, |headers| headers.has(name))
            }

            pub fn set_header(&self, name: &str, value: &str) -> Result<(), ScriptError> {
                let host = self.context().host();
                self.object().with_headers(host, |headers| headers.set(name, value))
            }

            pub fn append_header(&self, name: &str, value: &str) -> Result<(), ScriptError> {
                let host = self.context().host();
                self.object().with_headers(host, |headers| headers.append(name, value))
            }

            pub fn delete_header(&self, name: &str) -> Result<(), ScriptError> {
                let host = self.context().host();
                self.object().with_headers(host, |headers| headers.delete(name))
            }
        }
    };
}

pub(crate) use {body_accessors, header_accessors};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{Response, ResponseInit};
    use crate::streams::{FnTransformer, TransformStream};
    use edge_compute_common::RuntimeConfig;
    use edge_compute_host::{DownstreamRequest, Session};

    fn context() -> Rc<ExchangeContext> {
        let (session, _response) = Session::builder(DownstreamRequest::get("http://example.com/")).build();
        ExchangeContext::new(Rc::new(session), RuntimeConfig::default())
    }

    fn run(cx: &Rc<ExchangeContext>) {
        cx.event_loop().run(cx, || true).unwrap();
    }

    #[test]
    fn test_text_body_sets_content_type() {
        let cx = context();
        let response = Response::new(&cx, Some("hello".into()), ResponseInit::default()).unwrap();

        assert_eq!(
            response.header("Content-Type").unwrap().as_deref(),
            Some(TEXT_CONTENT_TYPE)
        );
        let text = response.text();
        run(&cx);
        assert_eq!(text.result().unwrap().unwrap(), "hello");
    }

    #[test]
    fn test_form_body_is_url_encoded() {
        let cx = context();
        let form = BodyInit::Form(vec![
            ("a".to_string(), "1 2".to_string()),
            ("b".to_string(), "&".to_string()),
        ]);
        let response = Response::new(&cx, Some(form), ResponseInit::default()).unwrap();

        assert_eq!(
            response.header("content-type").unwrap().as_deref(),
            Some(FORM_CONTENT_TYPE)
        );
        let text = response.text();
        run(&cx);
        assert_eq!(text.result().unwrap().unwrap(), "a=1+2&b=%26");
    }

    #[test]
    fn test_explicit_content_type_is_kept() {
        let cx = context();
        let mut headers = Headers::new();
        headers.set("content-type", "text/html").unwrap();
        let init = ResponseInit {
            headers: Some(headers),
            ..ResponseInit::default()
        };
        let response = Response::new(&cx, Some("<p>".into()), init).unwrap();

        assert_eq!(
            response.header("content-type").unwrap().as_deref(),
            Some("text/html")
        );
    }

    #[test]
    fn test_no_body_reads_empty() {
        let cx = context();
        let response = Response::new(&cx, None, ResponseInit::default()).unwrap();

        assert!(response.body().is_none());
        let bytes = response.array_buffer();
        assert!(bytes.result().unwrap().unwrap().is_empty());
        assert!(!response.body_used());
    }

    #[test]
    fn test_second_read_is_rejected() {
        let cx = context();
        let response = Response::new(&cx, Some("once".into()), ResponseInit::default()).unwrap();

        let first = response.text();
        let second = response.text();
        run(&cx);

        assert_eq!(first.result().unwrap().unwrap(), "once");
        assert_eq!(
            second.result().unwrap().unwrap_err(),
            ScriptError::type_error("Body has already been consumed")
        );
        assert!(response.body_used());
    }

    #[test]
    fn test_json_parse_error() {
        let cx = context();
        let response = Response::new(&cx, Some("{not json".into()), ResponseInit::default()).unwrap();

        let json = response.json();
        run(&cx);
        let err = json.result().unwrap().unwrap_err();
        assert!(err.message().starts_with("SyntaxError"));
    }

    #[test]
    fn test_locked_stream_is_not_a_body() {
        let cx = context();
        let stream = ReadableStream::from_chunks(["x"]);
        let _reader = stream.get_reader().unwrap();

        let err = Response::new(&cx, Some(stream.into()), ResponseInit::default()).unwrap_err();
        assert_eq!(err, ScriptError::type_error(UNUSABLE_STREAM));
    }

    #[test]
    fn test_pipeline_readable_records_owner() {
        let cx = context();
        let pipeline = TransformStream::identity();
        let response =
            Response::new(&cx, Some(pipeline.readable().into()), ResponseInit::default()).unwrap();

        let owner = pipeline.readable().transform().unwrap().owner().unwrap();
        assert!(Rc::ptr_eq(&owner, response.object()));
    }

    #[test]
    fn test_mixin_readable_records_no_owner() {
        let cx = context();
        let pipeline = TransformStream::mixin(FnTransformer::new(Ok));
        let _response =
            Response::new(&cx, Some(pipeline.readable().into()), ResponseInit::default()).unwrap();

        assert!(pipeline.readable().transform().unwrap().owner().is_none());
    }

    #[test]
    fn test_mark_used_locks_stream() {
        let cx = context();
        let response = Response::new(&cx, Some("x".into()), ResponseInit::default()).unwrap();
        let stream = response.body().unwrap();

        response.object().mark_body_used().unwrap();
        assert!(stream.is_locked());
        assert_eq!(
            response.object().mark_body_used().unwrap_err(),
            ScriptError::type_error(LOCKED_BODY)
        );
    }
}
