//! Streams over host bodies.
//!
//! [`NativeSource`] turns a host body into a pull-driven stream source; no
//! I/O starts until a consumer pulls, and every read is a queued
//! [`AsyncTask`] rather than an inline host call. [`NativeSink`] writes a
//! stream into a host body.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tracing::{debug, trace};

use edge_compute_common::ScriptError;
use edge_compute_host::{AsyncItemHandle, BodyHandle};

use super::readable::{ReadableController, ReadableStream, Source, UnderlyingSource};
use super::transform::TransformInner;
use super::writable::{Sink, UnderlyingSink, WritableController, WritableStream};
use crate::body::CONSUMED_BODY;
use crate::context::ExchangeContext;
use crate::event_loop::AsyncTask;
use crate::promise::Promise;

/// A body handle slot shared by an exchange object and the streams over it.
///
/// Moving the body elsewhere leaves the invalid handle behind for every
/// holder.
pub(crate) type SharedBody = Rc<RefCell<BodyHandle>>;

pub(crate) fn shared_body(handle: BodyHandle) -> SharedBody {
    Rc::new(RefCell::new(handle))
}

/// Stream source reading a host body.
pub struct NativeSource {
    body: SharedBody,
    cx: Weak<ExchangeContext>,
    chunk_size: usize,
    /// Identity pipeline this stream is being piped into.
    piped_to: RefCell<Option<Rc<TransformInner>>>,
}

impl NativeSource {
    /// A stream over `body` with the configured body high-water mark.
    pub(crate) fn stream(cx: &Rc<ExchangeContext>, body: SharedBody) -> ReadableStream {
        let streams = &cx.config().streams;
        let source = Rc::new(Self {
            body,
            cx: Rc::downgrade(cx),
            chunk_size: streams.read_chunk_size.max(1),
            piped_to: RefCell::new(None),
        });
        let stream = ReadableStream::unstarted(Source::Native(source), streams.body_high_water_mark);
        stream.start();
        stream
    }

    pub(crate) fn body(&self) -> &SharedBody {
        &self.body
    }

    pub(crate) fn set_piped_to(&self, pipeline: Rc<TransformInner>) {
        *self.piped_to.borrow_mut() = Some(pipeline);
    }

    /// Move the whole body into the body of the exchange object that took
    /// the piped pipeline's readable end, if there is one.
    fn try_append_to_owner(&self, cx: &ExchangeContext, controller: &ReadableController) -> bool {
        let Some(owner) = self
            .piped_to
            .borrow()
            .as_ref()
            .and_then(|pipeline| pipeline.owner())
        else {
            return false;
        };
        let src = self.body.borrow_mut().take();
        let dest = owner.body_slot();
        let appended = cx.host().body_append(&dest.borrow(), src);
        match appended {
            Ok(()) => {
                debug!(
                    request_id = %cx.request_id(),
                    handle = dest.borrow().as_u32(),
                    "Moved body with a single append"
                );
                let _ = controller.close();
            }
            Err(e) => controller.error(e.into()),
        }
        true
    }
}

impl UnderlyingSource for NativeSource {
    fn pull(&self, controller: &ReadableController) -> Promise<()> {
        let Some(cx) = self.cx.upgrade() else {
            return Promise::rejected(ScriptError::type_error("The exchange has ended"));
        };
        if !self.body.borrow().is_valid() {
            controller.error(ScriptError::type_error(CONSUMED_BODY));
            return Promise::resolved(());
        }
        if self.try_append_to_owner(&cx, controller) {
            return Promise::resolved(());
        }

        let done = Promise::new();
        let task = BodyReadTask {
            body: Rc::clone(&self.body),
            controller: controller.clone(),
            chunk_size: self.chunk_size,
            done: done.clone(),
        };
        match cx.event_loop().queue_task(Box::new(task)) {
            Ok(()) => done,
            Err(e) => Promise::rejected(e.into()),
        }
    }
}

/// One pending read of a host body.
struct BodyReadTask {
    body: SharedBody,
    controller: ReadableController,
    chunk_size: usize,
    done: Promise<()>,
}

impl AsyncTask for BodyReadTask {
    fn handle(&self) -> AsyncItemHandle {
        self.body.borrow().async_item()
    }

    fn run(self: Box<Self>, cx: &Rc<ExchangeContext>) {
        let read = {
            let body = self.body.borrow();
            if body.is_valid() {
                cx.host().body_read(&body, self.chunk_size)
            } else {
                Ok(Bytes::new())
            }
        };
        match read {
            Err(e) => self.controller.error(e.into()),
            Ok(chunk) if chunk.is_empty() => {
                trace!(request_id = %cx.request_id(), "Body read reached end");
                let _ = self.controller.close();
            }
            Ok(chunk) => {
                trace!(request_id = %cx.request_id(), len = chunk.len(), "Body read");
                let _ = self.controller.enqueue(chunk);
            }
        }
        self.done.resolve(());
    }

    fn name(&self) -> &'static str {
        "body_read"
    }
}

/// Stream sink writing into a host body.
pub struct NativeSink {
    body: SharedBody,
    cx: Weak<ExchangeContext>,
}

impl NativeSink {
    /// A writable stream over `body`. Closing the stream closes the body.
    pub(crate) fn stream(cx: &Rc<ExchangeContext>, body: SharedBody) -> WritableStream {
        let sink = Rc::new(Self {
            body,
            cx: Rc::downgrade(cx),
        });
        let stream = WritableStream::unstarted(
            Sink::Native(sink),
            cx.config().streams.transform_writable_high_water_mark,
        );
        stream.start();
        stream
    }

    fn context(&self) -> Result<Rc<ExchangeContext>, ScriptError> {
        self.cx
            .upgrade()
            .ok_or_else(|| ScriptError::type_error("The exchange has ended"))
    }
}

impl UnderlyingSink for NativeSink {
    fn write(&self, chunk: Bytes, _controller: &WritableController) -> Promise<()> {
        let written = self
            .context()
            .and_then(|cx| Ok(self.body.borrow().write_all(cx.host(), &chunk)?));
        Promise::settled(written)
    }

    fn close(&self) -> Promise<()> {
        let closed = self.context().and_then(|cx| {
            let body = self.body.borrow_mut().take();
            Ok(cx.host().body_close(body)?)
        });
        Promise::settled(closed)
    }

    fn abort(&self, _reason: &ScriptError) -> Promise<()> {
        let abandoned = self.context().and_then(|cx| {
            let body = self.body.borrow_mut().take();
            Ok(cx.host().body_abandon(body)?)
        });
        Promise::settled(abandoned)
    }
}
