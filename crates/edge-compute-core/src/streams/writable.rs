//! Writable streams.
//!
//! Writes are queued and handed to the underlying sink one at a time, in
//! order. The stream reports backpressure once queued plus in-flight writes
//! reach its high-water mark; [`WritableStreamWriter::ready`] is pending for
//! as long as that lasts.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tracing::trace;

use edge_compute_common::ScriptError;

use super::native::NativeSink;
use super::transform::TransformInner;
use crate::promise::Promise;

/// Where a writable stream's chunks go.
pub trait UnderlyingSink {
    fn start(&self, controller: &WritableController) -> Result<(), ScriptError> {
        let _ = controller;
        Ok(())
    }

    /// Consume one chunk. The next write waits for the returned promise; a
    /// rejection errors the stream.
    fn write(&self, chunk: Bytes, controller: &WritableController) -> Promise<()>;

    /// Every queued write has completed and no more will come.
    fn close(&self) -> Promise<()> {
        Promise::resolved(())
    }

    fn abort(&self, reason: &ScriptError) -> Promise<()> {
        let _ = reason;
        Promise::resolved(())
    }
}

#[derive(Clone)]
pub(crate) enum Sink {
    Native(Rc<NativeSink>),
    Transform(Rc<TransformInner>),
    Other(Rc<dyn UnderlyingSink>),
}

impl Sink {
    fn as_dyn(&self) -> Rc<dyn UnderlyingSink> {
        match self {
            Self::Native(sink) => Rc::clone(sink) as Rc<dyn UnderlyingSink>,
            Self::Transform(inner) => Rc::clone(inner) as Rc<dyn UnderlyingSink>,
            Self::Other(sink) => Rc::clone(sink),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Writable,
    Erroring(ScriptError),
    Errored(ScriptError),
    Closed,
}

struct WritableState {
    status: Status,
    queue: VecDeque<(Bytes, Promise<()>)>,
    in_flight_write: Option<Promise<()>>,
    close_request: Option<Promise<()>>,
    in_flight_close: Option<Promise<()>>,
    pending_abort: Option<(Promise<()>, ScriptError)>,
    high_water_mark: usize,
    backpressure: bool,
    ready: Promise<()>,
    locked: bool,
    started: bool,
}

impl WritableState {
    #[allow(clippy::cast_possible_wrap)]
    fn desired_size(&self) -> Option<isize> {
        match self.status {
            Status::Errored(_) | Status::Erroring(_) => None,
            Status::Closed => Some(0),
            Status::Writable => {
                let outstanding = self.queue.len() + usize::from(self.in_flight_write.is_some());
                Some(self.high_water_mark as isize - outstanding as isize)
            }
        }
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }
}

enum Step {
    Write(Bytes, Promise<()>),
    Close(Promise<()>),
    FinishErroring,
}

pub(crate) struct WritableInner {
    state: RefCell<WritableState>,
    sink: RefCell<Option<Sink>>,
}

impl WritableInner {
    fn controller(self: &Rc<Self>) -> WritableController {
        WritableController {
            stream: Rc::downgrade(self),
        }
    }

    fn sink(&self) -> Option<Rc<dyn UnderlyingSink>> {
        self.sink.borrow().as_ref().map(Sink::as_dyn)
    }

    /// The error a writable that is erroring or errored holds.
    pub(crate) fn erroring_error(&self) -> Option<ScriptError> {
        match &self.state.borrow().status {
            Status::Erroring(e) | Status::Errored(e) => Some(e.clone()),
            _ => None,
        }
    }

    fn update_backpressure(&self) {
        let release = {
            let mut state = self.state.borrow_mut();
            if state.status != Status::Writable || state.close_queued_or_in_flight() {
                return;
            }
            let backpressure = state.desired_size().is_some_and(|d| d <= 0);
            if backpressure == state.backpressure {
                return;
            }
            state.backpressure = backpressure;
            if backpressure {
                state.ready = Promise::new();
                None
            } else {
                Some(state.ready.clone())
            }
        };
        if let Some(ready) = release {
            ready.resolve(());
        }
    }

    fn write(self: &Rc<Self>, chunk: Bytes) -> Promise<()> {
        let written = {
            let mut state = self.state.borrow_mut();
            match &state.status {
                Status::Erroring(e) | Status::Errored(e) => return Promise::rejected(e.clone()),
                Status::Closed => {
                    return Promise::rejected(ScriptError::type_error(
                        "Can't write to a closed WritableStream",
                    ));
                }
                Status::Writable if state.close_queued_or_in_flight() => {
                    return Promise::rejected(ScriptError::type_error(
                        "Can't write to a closing WritableStream",
                    ));
                }
                Status::Writable => {}
            }
            let written = Promise::new();
            state.queue.push_back((chunk, written.clone()));
            written
        };
        self.update_backpressure();
        self.advance();
        written
    }

    fn close(self: &Rc<Self>) -> Promise<()> {
        let (closed, release) = {
            let mut state = self.state.borrow_mut();
            match &state.status {
                Status::Closed | Status::Errored(_) => {
                    return Promise::rejected(ScriptError::type_error(
                        "Can't close a WritableStream that is closed or errored",
                    ));
                }
                _ if state.close_queued_or_in_flight() => {
                    return Promise::rejected(ScriptError::type_error(
                        "WritableStream is already closing",
                    ));
                }
                _ => {}
            }
            let closed = Promise::new();
            state.close_request = Some(closed.clone());
            let release = (state.backpressure && state.status == Status::Writable)
                .then(|| state.ready.clone());
            state.backpressure = false;
            (closed, release)
        };
        if let Some(ready) = release {
            ready.resolve(());
        }
        self.advance();
        closed
    }

    fn abort(self: &Rc<Self>, reason: ScriptError) -> Promise<()> {
        {
            let mut state = self.state.borrow_mut();
            match &state.status {
                Status::Closed | Status::Errored(_) => return Promise::resolved(()),
                Status::Erroring(_) => {
                    return state
                        .pending_abort
                        .as_ref()
                        .map_or_else(|| Promise::resolved(()), |(p, _)| p.clone());
                }
                Status::Writable => {}
            }
        }
        let aborted = Promise::new();
        self.state.borrow_mut().pending_abort = Some((aborted.clone(), reason.clone()));
        self.start_erroring(reason);
        aborted
    }

    /// Error the stream from the sink's side. Does nothing unless writable.
    pub(crate) fn error_if_needed(self: &Rc<Self>, error: ScriptError) {
        if self.state.borrow().status == Status::Writable {
            self.start_erroring(error);
        }
    }

    fn start_erroring(self: &Rc<Self>, error: ScriptError) {
        let (ready, started) = {
            let mut state = self.state.borrow_mut();
            trace!(error = %error, "Writable stream erroring");
            state.status = Status::Erroring(error.clone());
            let ready = std::mem::replace(&mut state.ready, Promise::rejected(error.clone()));
            (ready, state.started)
        };
        ready.reject(error);
        if started && !self.state.borrow().has_operation_in_flight() {
            self.finish_erroring();
        }
    }

    fn finish_erroring(self: &Rc<Self>) {
        let (error, queued, close_request, abort) = {
            let mut state = self.state.borrow_mut();
            let Status::Erroring(error) = &state.status else {
                return;
            };
            let error = error.clone();
            state.status = Status::Errored(error.clone());
            (
                error,
                std::mem::take(&mut state.queue),
                state.close_request.take(),
                state.pending_abort.take(),
            )
        };
        for (_, written) in queued {
            written.reject(error.clone());
        }
        if let Some(closed) = close_request {
            closed.reject(error.clone());
        }
        if let Some((aborted, reason)) = abort {
            match self.sink() {
                Some(sink) => sink.abort(&reason).forward_to(&aborted),
                None => {
                    aborted.resolve(());
                }
            }
        }
    }

    /// Hand the next queued write or the close to the sink, if idle.
    fn advance(self: &Rc<Self>) {
        let step = {
            let mut state = self.state.borrow_mut();
            if !state.started || state.has_operation_in_flight() {
                return;
            }
            if matches!(state.status, Status::Erroring(_)) {
                Step::FinishErroring
            } else if let Some((chunk, written)) = state.queue.pop_front() {
                state.in_flight_write = Some(written.clone());
                Step::Write(chunk, written)
            } else if let Some(closed) = state.close_request.take() {
                state.in_flight_close = Some(closed.clone());
                Step::Close(closed)
            } else {
                return;
            }
        };
        let Some(sink) = self.sink() else {
            return;
        };
        let stream = Rc::downgrade(self);
        match step {
            Step::FinishErroring => self.finish_erroring(),
            Step::Write(chunk, written) => {
                sink.write(chunk, &self.controller()).on_settled(move |result| {
                    if let Some(stream) = stream.upgrade() {
                        stream.write_finished(&written, result);
                    }
                });
            }
            Step::Close(closed) => {
                sink.close().on_settled(move |result| {
                    if let Some(stream) = stream.upgrade() {
                        stream.close_finished(&closed, result);
                    }
                });
            }
        }
    }

    fn write_finished(self: &Rc<Self>, written: &Promise<()>, result: &Result<(), ScriptError>) {
        self.state.borrow_mut().in_flight_write = None;
        match result {
            Ok(()) => {
                written.resolve(());
                let erroring = matches!(self.state.borrow().status, Status::Erroring(_));
                if erroring {
                    self.finish_erroring();
                } else {
                    self.update_backpressure();
                    self.advance();
                }
            }
            Err(e) => {
                written.reject(e.clone());
                if self.state.borrow().status == Status::Writable {
                    self.start_erroring(e.clone());
                } else {
                    self.finish_erroring();
                }
            }
        }
    }

    fn close_finished(&self, closed: &Promise<()>, result: &Result<(), ScriptError>) {
        let abort = {
            let mut state = self.state.borrow_mut();
            state.in_flight_close = None;
            state.status = match result {
                Ok(()) => Status::Closed,
                Err(e) => Status::Errored(e.clone()),
            };
            state.pending_abort.take()
        };
        closed.settle(result.clone());
        if let Some((aborted, _)) = abort {
            aborted.settle(result.clone());
        }
    }

    fn release(&self) {
        self.state.borrow_mut().locked = false;
    }
}

/// The sink's handle on its stream.
#[derive(Clone)]
pub struct WritableController {
    stream: Weak<WritableInner>,
}

impl WritableController {
    /// Error the stream; pending and later writes reject with `error`.
    pub fn error(&self, error: ScriptError) {
        if let Some(stream) = self.stream.upgrade() {
            stream.error_if_needed(error);
        }
    }
}

/// A writable byte stream.
#[derive(Clone)]
pub struct WritableStream {
    inner: Rc<WritableInner>,
}

impl WritableStream {
    pub fn new(sink: impl UnderlyingSink + 'static, high_water_mark: usize) -> Self {
        let stream = Self::unstarted(Sink::Other(Rc::new(sink)), high_water_mark);
        stream.start();
        stream
    }

    pub(crate) fn unstarted(sink: Sink, high_water_mark: usize) -> Self {
        Self {
            inner: Rc::new(WritableInner {
                state: RefCell::new(WritableState {
                    status: Status::Writable,
                    queue: VecDeque::new(),
                    in_flight_write: None,
                    close_request: None,
                    in_flight_close: None,
                    pending_abort: None,
                    high_water_mark,
                    backpressure: high_water_mark == 0,
                    ready: if high_water_mark == 0 {
                        Promise::new()
                    } else {
                        Promise::resolved(())
                    },
                    locked: false,
                    started: false,
                }),
                sink: RefCell::new(Some(sink)),
            }),
        }
    }

    pub(crate) fn start(&self) {
        if let Some(sink) = self.inner.sink() {
            if let Err(e) = sink.start(&self.inner.controller()) {
                self.inner.start_erroring(e);
            }
        }
        self.inner.state.borrow_mut().started = true;
        self.inner.advance();
    }

    pub(crate) fn inner(&self) -> &Rc<WritableInner> {
        &self.inner
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.borrow().locked
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().status == Status::Closed
    }

    pub fn is_errored(&self) -> bool {
        matches!(self.inner.state.borrow().status, Status::Errored(_))
    }

    pub fn stored_error(&self) -> Option<ScriptError> {
        self.inner.erroring_error()
    }

    pub fn get_writer(&self) -> Result<WritableStreamWriter, ScriptError> {
        let mut state = self.inner.state.borrow_mut();
        if state.locked {
            return Err(ScriptError::type_error(
                "Can't lock an already locked WritableStream",
            ));
        }
        state.locked = true;
        Ok(WritableStreamWriter {
            stream: Some(self.clone()),
        })
    }

    pub fn abort(&self, reason: ScriptError) -> Promise<()> {
        if self.is_locked() {
            return Promise::rejected(ScriptError::type_error(
                "Can't abort a locked WritableStream",
            ));
        }
        self.inner.abort(reason)
    }

    pub fn close(&self) -> Promise<()> {
        if self.is_locked() {
            return Promise::rejected(ScriptError::type_error(
                "Can't close a locked WritableStream",
            ));
        }
        self.inner.close()
    }

    /// The transform pipeline this stream is the writable end of, if any.
    pub(crate) fn transform(&self) -> Option<Rc<TransformInner>> {
        match self.inner.sink.borrow().as_ref() {
            Some(Sink::Transform(inner)) => Some(Rc::clone(inner)),
            _ => None,
        }
    }
}

impl fmt::Debug for WritableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("WritableStream")
            .field("status", &state.status)
            .field("queued", &state.queue.len())
            .field("locked", &state.locked)
            .finish_non_exhaustive()
    }
}

/// Exclusive writer of a [`WritableStream`].
pub struct WritableStreamWriter {
    stream: Option<WritableStream>,
}

impl WritableStreamWriter {
    fn released() -> ScriptError {
        ScriptError::type_error("Writer was released")
    }

    pub fn write(&self, chunk: impl Into<Bytes>) -> Promise<()> {
        match &self.stream {
            Some(stream) => stream.inner.write(chunk.into()),
            None => Promise::rejected(Self::released()),
        }
    }

    pub fn close(&self) -> Promise<()> {
        match &self.stream {
            Some(stream) => stream.inner.close(),
            None => Promise::rejected(Self::released()),
        }
    }

    pub fn abort(&self, reason: ScriptError) -> Promise<()> {
        match &self.stream {
            Some(stream) => stream.inner.abort(reason),
            None => Promise::rejected(Self::released()),
        }
    }

    /// Fulfilled while the stream has room for more writes.
    pub fn ready(&self) -> Promise<()> {
        match &self.stream {
            Some(stream) => stream.inner.state.borrow().ready.clone(),
            None => Promise::rejected(Self::released()),
        }
    }

    /// `None` once the stream is erroring or errored.
    pub fn desired_size(&self) -> Option<isize> {
        self.stream
            .as_ref()
            .and_then(|stream| stream.inner.state.borrow().desired_size())
    }

    pub fn release_lock(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.inner.release();
        }
    }
}

impl fmt::Debug for WritableStreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamWriter")
            .field("released", &self.stream.is_none())
            .finish()
    }
}
