//! Transform pipelines.
//!
//! A [`TransformStream`] is a writable end and a readable end joined by a
//! [`Transformer`]. Each chunk written is handed to the transformer, which
//! enqueues zero or more chunks on the readable end. Writes wait while the
//! readable end has backpressure.
//!
//! An identity pipeline (no transformer) whose writable end is fed straight
//! from a host body and whose readable end became a message body lets the
//! body be moved with a single host append instead of being read chunk by
//! chunk; see [`super::native`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tracing::trace;

use edge_compute_common::ScriptError;

use super::readable::{ReadableController, ReadableInner, ReadableStream, Source, UnderlyingSource};
use super::writable::{Sink, UnderlyingSink, WritableController, WritableInner, WritableStream};
use crate::body::ExchangeObject;
use crate::promise::Promise;

/// Per-chunk logic of a transform pipeline.
///
/// Called with the pipeline's state unborrowed; the controller may be used
/// freely, including to error or terminate the pipeline.
pub trait Transformer {
    fn start(&mut self, controller: &TransformController) -> Result<(), ScriptError> {
        let _ = controller;
        Ok(())
    }

    /// Defaults to passing the chunk through.
    fn transform(&mut self, chunk: Bytes, controller: &TransformController) -> Result<(), ScriptError> {
        controller.enqueue(chunk)
    }

    /// The writable end closed.
    fn flush(&mut self, controller: &TransformController) -> Result<(), ScriptError> {
        let _ = controller;
        Ok(())
    }
}

/// A transformer that maps each chunk to one output chunk.
pub struct FnTransformer<F> {
    map: F,
}

impl<F> FnTransformer<F>
where
    F: FnMut(Bytes) -> Result<Bytes, ScriptError>,
{
    pub fn new(map: F) -> Self {
        Self { map }
    }
}

impl<F> Transformer for FnTransformer<F>
where
    F: FnMut(Bytes) -> Result<Bytes, ScriptError>,
{
    fn transform(&mut self, chunk: Bytes, controller: &TransformController) -> Result<(), ScriptError> {
        let mapped = (self.map)(chunk)?;
        controller.enqueue(mapped)
    }
}

/// Shared state of a pipeline. Both ends hold it strongly; it holds them
/// weakly.
pub(crate) struct TransformInner {
    this: Weak<TransformInner>,
    readable: RefCell<Weak<ReadableInner>>,
    writable: RefCell<Weak<WritableInner>>,
    transformer: RefCell<Option<Box<dyn Transformer>>>,
    identity: bool,
    /// Set once the transformer has been dropped for good.
    cleared: Cell<bool>,
    backpressure: Cell<bool>,
    backpressure_change: RefCell<Promise<()>>,
    /// The exchange object whose body the readable end became.
    owner: RefCell<Weak<ExchangeObject>>,
    used_as_mixin: Cell<bool>,
}

impl TransformInner {
    fn controller(&self) -> TransformController {
        TransformController {
            inner: self.this.clone(),
        }
    }

    fn readable(&self) -> Option<Rc<ReadableInner>> {
        self.readable.borrow().upgrade()
    }

    fn writable(&self) -> Option<Rc<WritableInner>> {
        self.writable.borrow().upgrade()
    }

    pub(crate) fn is_identity(&self) -> bool {
        self.identity
    }

    pub(crate) fn owner(&self) -> Option<Rc<ExchangeObject>> {
        self.owner.borrow().upgrade()
    }

    pub(crate) fn set_owner(&self, owner: &Rc<ExchangeObject>) {
        *self.owner.borrow_mut() = Rc::downgrade(owner);
    }

    /// Forget the owner; the readable end is then read chunk by chunk.
    pub(crate) fn clear_owner(&self) {
        *self.owner.borrow_mut() = Weak::new();
    }

    pub(crate) fn used_as_mixin(&self) -> bool {
        self.used_as_mixin.get()
    }

    pub(crate) fn set_used_as_mixin(&self) {
        self.used_as_mixin.set(true);
    }

    /// Returns the promise settled by the next change.
    fn set_backpressure(&self, backpressure: bool) -> Promise<()> {
        self.backpressure.set(backpressure);
        let next = Promise::new();
        let previous = self.backpressure_change.replace(next.clone());
        previous.resolve(());
        next
    }

    fn clear_algorithms(&self) {
        self.cleared.set(true);
        self.transformer.borrow_mut().take();
    }

    pub(crate) fn enqueue(&self, chunk: Bytes) -> Result<(), ScriptError> {
        let Some(readable) = self.readable().filter(|r| r.can_close_or_enqueue()) else {
            return Err(ScriptError::type_error(
                "TransformStream: readable stream is closed or errored",
            ));
        };
        if let Err(e) = readable.enqueue(chunk) {
            self.error_writable_and_unblock_write(e.clone());
            return Err(readable.stored_error().unwrap_or(e));
        }
        let backpressure = !readable.should_pull();
        if backpressure && !self.backpressure.get() {
            let _ = self.set_backpressure(true);
        }
        Ok(())
    }

    /// Error both ends.
    pub(crate) fn error(&self, error: ScriptError) {
        if let Some(readable) = self.readable() {
            readable.error(error.clone());
        }
        self.error_writable_and_unblock_write(error);
    }

    fn error_writable_and_unblock_write(&self, error: ScriptError) {
        trace!(error = %error, "Transform pipeline errored");
        self.clear_algorithms();
        if let Some(writable) = self.writable() {
            writable.error_if_needed(error);
        }
        if self.backpressure.get() {
            let _ = self.set_backpressure(false);
        }
    }

    /// Close the readable end and error the writable end.
    pub(crate) fn terminate(&self) {
        if let Some(readable) = self.readable() {
            if readable.can_close_or_enqueue() {
                let _ = readable.close();
            }
        }
        self.error_writable_and_unblock_write(ScriptError::type_error(
            "The TransformStream has been terminated",
        ));
    }

    fn perform_transform(&self, chunk: Bytes) -> Promise<()> {
        let taken = self.transformer.borrow_mut().take();
        let result = match taken {
            Some(mut transformer) => {
                let result = transformer.transform(chunk, &self.controller());
                if !self.cleared.get() {
                    *self.transformer.borrow_mut() = Some(transformer);
                }
                result
            }
            None if self.identity && !self.cleared.get() => self.enqueue(chunk),
            None => {
                return Promise::rejected(ScriptError::type_error(
                    "TransformStream: the pipeline has been closed",
                ));
            }
        };
        match result {
            Ok(()) => Promise::resolved(()),
            Err(e) => {
                self.error(e.clone());
                Promise::rejected(e)
            }
        }
    }
}

impl UnderlyingSink for TransformInner {
    fn write(&self, chunk: Bytes, _controller: &WritableController) -> Promise<()> {
        if !self.backpressure.get() {
            return self.perform_transform(chunk);
        }
        let this = self.this.clone();
        let change = self.backpressure_change.borrow().clone();
        change.then(move |_| {
            let Some(inner) = this.upgrade() else {
                return Promise::resolved(());
            };
            if let Some(e) = inner.writable().and_then(|w| w.erroring_error()) {
                return Promise::rejected(e);
            }
            inner.perform_transform(chunk)
        })
    }

    fn close(&self) -> Promise<()> {
        let taken = self.transformer.borrow_mut().take();
        self.clear_algorithms();
        let flushed = match taken {
            Some(mut transformer) => transformer.flush(&self.controller()),
            None => Ok(()),
        };
        if let Err(e) = flushed {
            self.error(e.clone());
            return Promise::rejected(e);
        }
        match self.readable() {
            Some(readable) => {
                if let Some(e) = readable.stored_error() {
                    return Promise::rejected(e);
                }
                if readable.can_close_or_enqueue() {
                    let _ = readable.close();
                }
                Promise::resolved(())
            }
            None => Promise::resolved(()),
        }
    }

    fn abort(&self, reason: &ScriptError) -> Promise<()> {
        self.error(reason.clone());
        Promise::resolved(())
    }
}

impl UnderlyingSource for TransformInner {
    fn pull(&self, _controller: &ReadableController) -> Promise<()> {
        self.set_backpressure(false)
    }

    fn cancel(&self, reason: &ScriptError) -> Promise<()> {
        self.error_writable_and_unblock_write(reason.clone());
        Promise::resolved(())
    }
}

/// The transformer's handle on its pipeline.
#[derive(Clone)]
pub struct TransformController {
    inner: Weak<TransformInner>,
}

impl TransformController {
    fn inner(&self) -> Result<Rc<TransformInner>, ScriptError> {
        self.inner
            .upgrade()
            .ok_or_else(|| ScriptError::type_error("TransformStream is gone"))
    }

    /// Emit a chunk on the readable end.
    pub fn enqueue(&self, chunk: impl Into<Bytes>) -> Result<(), ScriptError> {
        self.inner()?.enqueue(chunk.into())
    }

    pub fn error(&self, error: ScriptError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.error(error);
        }
    }

    pub fn terminate(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.terminate();
        }
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.inner.upgrade()?.readable()?.desired_size()
    }
}

/// A writable end and a readable end joined by a [`Transformer`].
#[derive(Clone)]
pub struct TransformStream {
    inner: Rc<TransformInner>,
    readable: ReadableStream,
    writable: WritableStream,
}

impl TransformStream {
    /// A pass-through pipeline with default high-water marks.
    pub fn identity() -> Self {
        Self::build(None, 1, 0)
    }

    pub fn new(transformer: impl Transformer + 'static) -> Self {
        Self::build(Some(Box::new(transformer)), 1, 0)
    }

    /// A pipeline owned by another builtin that wraps it. Its readable end
    /// never records an owning exchange object.
    pub fn mixin(transformer: impl Transformer + 'static) -> Self {
        let stream = Self::new(transformer);
        stream.inner.set_used_as_mixin();
        stream
    }

    /// A pipeline that maps every chunk through `map`.
    pub fn from_fn(map: impl FnMut(Bytes) -> Result<Bytes, ScriptError> + 'static) -> Self {
        Self::new(FnTransformer { map })
    }

    /// A pipeline with explicit high-water marks for each end.
    pub fn with_strategy(
        transformer: Option<Box<dyn Transformer>>,
        writable_high_water_mark: usize,
        readable_high_water_mark: usize,
    ) -> Self {
        Self::build(transformer, writable_high_water_mark, readable_high_water_mark)
    }

    fn build(
        transformer: Option<Box<dyn Transformer>>,
        writable_high_water_mark: usize,
        readable_high_water_mark: usize,
    ) -> Self {
        let identity = transformer.is_none();
        let inner = Rc::new_cyclic(|this| TransformInner {
            this: this.clone(),
            readable: RefCell::new(Weak::new()),
            writable: RefCell::new(Weak::new()),
            transformer: RefCell::new(transformer),
            identity,
            cleared: Cell::new(false),
            backpressure: Cell::new(false),
            backpressure_change: RefCell::new(Promise::new()),
            owner: RefCell::new(Weak::new()),
            used_as_mixin: Cell::new(false),
        });
        let readable = ReadableStream::unstarted(
            Source::Transform(Rc::clone(&inner)),
            readable_high_water_mark,
        );
        let writable =
            WritableStream::unstarted(Sink::Transform(Rc::clone(&inner)), writable_high_water_mark);
        *inner.readable.borrow_mut() = readable.downgrade();
        *inner.writable.borrow_mut() = Rc::downgrade(writable.inner());
        let _ = inner.set_backpressure(true);

        let taken = inner.transformer.borrow_mut().take();
        if let Some(mut transformer) = taken {
            let started = transformer.start(&inner.controller());
            if !inner.cleared.get() {
                *inner.transformer.borrow_mut() = Some(transformer);
            }
            if let Err(e) = started {
                inner.error(e);
            }
        }
        readable.start();
        writable.start();

        Self {
            inner,
            readable,
            writable,
        }
    }

    pub fn readable(&self) -> ReadableStream {
        self.readable.clone()
    }

    pub fn writable(&self) -> WritableStream {
        self.writable.clone()
    }

    pub fn is_used_as_mixin(&self) -> bool {
        self.inner.used_as_mixin()
    }
}

impl fmt::Debug for TransformStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStream")
            .field("identity", &self.inner.identity)
            .field("backpressure", &self.inner.backpressure.get())
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}
