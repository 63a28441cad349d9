//! Readable streams.
//!
//! A [`ReadableStream`] pulls byte chunks from an underlying source into a
//! queue and hands them to exactly one reader at a time. Pulls happen only
//! while the queue is below its high-water mark or a read is waiting, so a
//! stream with a high-water mark of zero never starts I/O by itself.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tracing::trace;

use edge_compute_common::ScriptError;

use super::native::NativeSource;
use super::transform::TransformInner;
use crate::promise::Promise;

/// Where a readable stream's chunks come from.
///
/// Methods run with no stream state borrowed, so they may call back into
/// the controller.
pub trait UnderlyingSource {
    /// Called once when the stream is set up.
    fn start(&self, controller: &ReadableController) -> Result<(), ScriptError> {
        let _ = controller;
        Ok(())
    }

    /// Produce more chunks. The stream does not pull again until the
    /// returned promise settles; a rejection errors the stream.
    fn pull(&self, controller: &ReadableController) -> Promise<()>;

    /// The consumer lost interest.
    fn cancel(&self, reason: &ScriptError) -> Promise<()> {
        let _ = reason;
        Promise::resolved(())
    }
}

/// The sources the crate gives special treatment, and everything else.
#[derive(Clone)]
pub(crate) enum Source {
    Native(Rc<NativeSource>),
    Transform(Rc<TransformInner>),
    Other(Rc<dyn UnderlyingSource>),
}

impl Source {
    fn as_dyn(&self) -> Rc<dyn UnderlyingSource> {
        match self {
            Self::Native(source) => Rc::clone(source) as Rc<dyn UnderlyingSource>,
            Self::Transform(inner) => Rc::clone(inner) as Rc<dyn UnderlyingSource>,
            Self::Other(source) => Rc::clone(source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Readable,
    Closed,
    Errored(ScriptError),
}

struct ReadableState {
    status: Status,
    queue: VecDeque<Bytes>,
    high_water_mark: usize,
    close_requested: bool,
    locked: bool,
    disturbed: bool,
    pending_reads: VecDeque<Promise<Option<Bytes>>>,
    started: bool,
    pulling: bool,
    pull_again: bool,
}

impl ReadableState {
    fn can_close_or_enqueue(&self) -> bool {
        self.status == Status::Readable && !self.close_requested
    }

    #[allow(clippy::cast_possible_wrap)]
    fn desired_size(&self) -> Option<isize> {
        match self.status {
            Status::Errored(_) => None,
            Status::Closed => Some(0),
            Status::Readable => Some(self.high_water_mark as isize - self.queue.len() as isize),
        }
    }

    fn should_pull(&self) -> bool {
        self.started
            && self.can_close_or_enqueue()
            && (!self.pending_reads.is_empty() || self.desired_size().is_some_and(|d| d > 0))
    }
}

pub(crate) struct ReadableInner {
    state: RefCell<ReadableState>,
    source: RefCell<Option<Source>>,
}

impl ReadableInner {
    fn controller(self: &Rc<Self>) -> ReadableController {
        ReadableController {
            stream: Rc::downgrade(self),
        }
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.state.borrow().can_close_or_enqueue()
    }

    pub(crate) fn should_pull(&self) -> bool {
        self.state.borrow().should_pull()
    }

    pub(crate) fn desired_size(&self) -> Option<isize> {
        self.state.borrow().desired_size()
    }

    pub(crate) fn stored_error(&self) -> Option<ScriptError> {
        match &self.state.borrow().status {
            Status::Errored(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub(crate) fn enqueue(self: &Rc<Self>, chunk: Bytes) -> Result<(), ScriptError> {
        let waiting = {
            let mut state = self.state.borrow_mut();
            if !state.can_close_or_enqueue() {
                return Err(ScriptError::type_error(
                    "ReadableStream: can't enqueue into a stream that is closed or errored",
                ));
            }
            state.pending_reads.pop_front()
        };
        match waiting {
            Some(read) => {
                read.resolve(Some(chunk));
            }
            None => self.state.borrow_mut().queue.push_back(chunk),
        }
        self.call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<(), ScriptError> {
        let reads = {
            let mut state = self.state.borrow_mut();
            if !state.can_close_or_enqueue() {
                return Err(ScriptError::type_error(
                    "ReadableStream: can't close a stream that is closed or errored",
                ));
            }
            state.close_requested = true;
            if state.queue.is_empty() {
                state.status = Status::Closed;
                std::mem::take(&mut state.pending_reads)
            } else {
                VecDeque::new()
            }
        };
        for read in reads {
            read.resolve(None);
        }
        Ok(())
    }

    /// Error the stream. Does nothing unless it is readable.
    pub(crate) fn error(&self, error: ScriptError) {
        let reads = {
            let mut state = self.state.borrow_mut();
            if state.status != Status::Readable {
                return;
            }
            trace!(error = %error, "Readable stream errored");
            state.status = Status::Errored(error.clone());
            state.queue.clear();
            std::mem::take(&mut state.pending_reads)
        };
        for read in reads {
            read.reject(error.clone());
        }
    }

    fn read(self: &Rc<Self>) -> Promise<Option<Bytes>> {
        let immediate = {
            let mut state = self.state.borrow_mut();
            state.disturbed = true;
            match &state.status {
                Status::Closed => Some(Ok(None)),
                Status::Errored(e) => Some(Err(e.clone())),
                Status::Readable => match state.queue.pop_front() {
                    Some(chunk) => {
                        if state.close_requested && state.queue.is_empty() {
                            state.status = Status::Closed;
                        }
                        Some(Ok(Some(chunk)))
                    }
                    None => None,
                },
            }
        };
        match immediate {
            Some(result) => {
                self.call_pull_if_needed();
                Promise::settled(result)
            }
            None => {
                let read = Promise::new();
                self.state.borrow_mut().pending_reads.push_back(read.clone());
                self.call_pull_if_needed();
                read
            }
        }
    }

    fn cancel(self: &Rc<Self>, reason: ScriptError) -> Promise<()> {
        let reads = {
            let mut state = self.state.borrow_mut();
            state.disturbed = true;
            match &state.status {
                Status::Closed => return Promise::resolved(()),
                Status::Errored(e) => return Promise::rejected(e.clone()),
                Status::Readable => {}
            }
            state.status = Status::Closed;
            state.queue.clear();
            std::mem::take(&mut state.pending_reads)
        };
        for read in reads {
            read.resolve(None);
        }
        let source = self.source.borrow().as_ref().map(Source::as_dyn);
        match source {
            Some(source) => source.cancel(&reason),
            None => Promise::resolved(()),
        }
    }

    pub(crate) fn call_pull_if_needed(self: &Rc<Self>) {
        let source = {
            let mut state = self.state.borrow_mut();
            if !state.should_pull() {
                return;
            }
            if state.pulling {
                state.pull_again = true;
                return;
            }
            state.pulling = true;
            self.source.borrow().as_ref().map(Source::as_dyn)
        };
        let Some(source) = source else {
            self.state.borrow_mut().pulling = false;
            return;
        };

        let pulled = source.pull(&self.controller());
        let stream = Rc::downgrade(self);
        pulled.on_settled(move |result| {
            let Some(stream) = stream.upgrade() else {
                return;
            };
            match result {
                Ok(()) => {
                    let again = {
                        let mut state = stream.state.borrow_mut();
                        state.pulling = false;
                        std::mem::take(&mut state.pull_again)
                    };
                    if again {
                        stream.call_pull_if_needed();
                    }
                }
                Err(e) => {
                    stream.state.borrow_mut().pulling = false;
                    stream.error(e.clone());
                }
            }
        });
    }

    fn release(&self) {
        let reads = {
            let mut state = self.state.borrow_mut();
            state.locked = false;
            std::mem::take(&mut state.pending_reads)
        };
        for read in reads {
            read.reject(ScriptError::type_error("Reader was released"));
        }
    }
}

/// The source's handle on its stream.
#[derive(Clone)]
pub struct ReadableController {
    stream: Weak<ReadableInner>,
}

impl ReadableController {
    fn stream(&self) -> Result<Rc<ReadableInner>, ScriptError> {
        self.stream
            .upgrade()
            .ok_or_else(|| ScriptError::type_error("ReadableStream is gone"))
    }

    pub fn enqueue(&self, chunk: Bytes) -> Result<(), ScriptError> {
        self.stream()?.enqueue(chunk)
    }

    pub fn close(&self) -> Result<(), ScriptError> {
        self.stream()?.close()
    }

    pub fn error(&self, error: ScriptError) {
        if let Some(stream) = self.stream.upgrade() {
            stream.error(error);
        }
    }

    /// `None` once the stream has errored.
    pub fn desired_size(&self) -> Option<isize> {
        self.stream.upgrade()?.state.borrow().desired_size()
    }

    pub fn can_close_or_enqueue(&self) -> bool {
        self.stream
            .upgrade()
            .is_some_and(|stream| stream.can_close_or_enqueue())
    }
}

/// A readable byte stream.
#[derive(Clone)]
pub struct ReadableStream {
    inner: Rc<ReadableInner>,
}

impl ReadableStream {
    /// A stream over `source`. A source whose `start` fails yields an
    /// errored stream.
    pub fn new(source: impl UnderlyingSource + 'static, high_water_mark: usize) -> Self {
        let stream = Self::unstarted(Source::Other(Rc::new(source)), high_water_mark);
        stream.start();
        stream
    }

    /// A stream that yields `chunks` and closes.
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let stream = Self::unstarted(Source::Other(Rc::new(ChunkSource)), 0);
        {
            let mut state = stream.inner.state.borrow_mut();
            state.queue.extend(chunks.into_iter().map(Into::into));
            state.close_requested = true;
            if state.queue.is_empty() {
                state.status = Status::Closed;
            }
        }
        stream.start();
        stream
    }

    /// A stream that is already errored with `error`.
    pub(crate) fn errored(error: ScriptError) -> Self {
        let stream = Self::unstarted(Source::Other(Rc::new(ChunkSource)), 0);
        stream.inner.error(error);
        stream
    }

    /// Create the stream without running the source's `start`.
    pub(crate) fn unstarted(source: Source, high_water_mark: usize) -> Self {
        Self {
            inner: Rc::new(ReadableInner {
                state: RefCell::new(ReadableState {
                    status: Status::Readable,
                    queue: VecDeque::new(),
                    high_water_mark,
                    close_requested: false,
                    locked: false,
                    disturbed: false,
                    pending_reads: VecDeque::new(),
                    started: false,
                    pulling: false,
                    pull_again: false,
                }),
                source: RefCell::new(Some(source)),
            }),
        }
    }

    pub(crate) fn start(&self) {
        let source = self.inner.source.borrow().as_ref().map(Source::as_dyn);
        if let Some(source) = source {
            if let Err(e) = source.start(&self.inner.controller()) {
                self.inner.error(e);
                return;
            }
        }
        self.inner.state.borrow_mut().started = true;
        self.inner.call_pull_if_needed();
    }

    pub(crate) fn inner(&self) -> &Rc<ReadableInner> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<ReadableInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn controller(&self) -> ReadableController {
        self.inner.controller()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.borrow().locked
    }

    /// Whether anything was ever read from, or cancelled on, the stream.
    pub fn is_disturbed(&self) -> bool {
        self.inner.state.borrow().disturbed
    }

    pub fn is_readable(&self) -> bool {
        self.inner.state.borrow().status == Status::Readable
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().status == Status::Closed
    }

    pub fn is_errored(&self) -> bool {
        matches!(self.inner.state.borrow().status, Status::Errored(_))
    }

    pub fn stored_error(&self) -> Option<ScriptError> {
        self.inner.stored_error()
    }

    /// Locked or disturbed streams can't become a message body.
    pub fn is_unusable(&self) -> bool {
        let state = self.inner.state.borrow();
        state.locked || state.disturbed
    }

    pub fn get_reader(&self) -> Result<ReadableStreamReader, ScriptError> {
        self.lock()?;
        Ok(ReadableStreamReader {
            stream: Some(self.clone()),
        })
    }

    /// Lock the stream without handing out a reader.
    pub(crate) fn lock(&self) -> Result<(), ScriptError> {
        let mut state = self.inner.state.borrow_mut();
        if state.locked {
            return Err(ScriptError::type_error(
                "Can't lock an already locked ReadableStream",
            ));
        }
        state.locked = true;
        Ok(())
    }

    pub fn cancel(&self, reason: ScriptError) -> Promise<()> {
        if self.is_locked() {
            return Promise::rejected(ScriptError::type_error(
                "Can't cancel a locked ReadableStream",
            ));
        }
        self.inner.cancel(reason)
    }

    /// Split into two streams that each see every chunk. Locks this stream.
    pub fn tee(&self) -> Result<(ReadableStream, ReadableStream), ScriptError> {
        let reader = self.get_reader()?;
        let tee = Rc::new(TeeState {
            reader: RefCell::new(reader),
            reading: Cell::new(false),
            branches: RefCell::new([None, None]),
            canceled: [Cell::new(false), Cell::new(false)],
        });
        let first = Self::unstarted(
            Source::Other(Rc::new(TeeBranch {
                tee: Rc::clone(&tee),
                index: 0,
            })),
            0,
        );
        let second = Self::unstarted(
            Source::Other(Rc::new(TeeBranch {
                tee: Rc::clone(&tee),
                index: 1,
            })),
            0,
        );
        *tee.branches.borrow_mut() = [Some(first.controller()), Some(second.controller())];
        first.start();
        second.start();
        Ok((first, second))
    }

    /// The native body source feeding this stream, if any.
    pub(crate) fn native_source(&self) -> Option<Rc<NativeSource>> {
        match self.inner.source.borrow().as_ref() {
            Some(Source::Native(source)) => Some(Rc::clone(source)),
            _ => None,
        }
    }

    /// The transform pipeline this stream is the readable end of, if any.
    pub(crate) fn transform(&self) -> Option<Rc<TransformInner>> {
        match self.inner.source.borrow().as_ref() {
            Some(Source::Transform(inner)) => Some(Rc::clone(inner)),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &ReadableStream) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("ReadableStream")
            .field("status", &state.status)
            .field("queued", &state.queue.len())
            .field("locked", &state.locked)
            .field("disturbed", &state.disturbed)
            .finish_non_exhaustive()
    }
}

/// Exclusive reader of a [`ReadableStream`].
///
/// The lock is held until [`release_lock`](Self::release_lock); dropping the
/// reader keeps the stream locked.
pub struct ReadableStreamReader {
    stream: Option<ReadableStream>,
}

impl ReadableStreamReader {
    /// The next chunk, or `None` once the stream is closed.
    pub fn read(&self) -> Promise<Option<Bytes>> {
        match &self.stream {
            Some(stream) => stream.inner.read(),
            None => Promise::rejected(ScriptError::type_error("Reader was released")),
        }
    }

    pub fn cancel(&self, reason: ScriptError) -> Promise<()> {
        match &self.stream {
            Some(stream) => stream.inner.cancel(reason),
            None => Promise::rejected(ScriptError::type_error("Reader was released")),
        }
    }

    pub fn release_lock(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.inner.release();
        }
    }

    pub fn stream(&self) -> Option<&ReadableStream> {
        self.stream.as_ref()
    }
}

impl fmt::Debug for ReadableStreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamReader")
            .field("released", &self.stream.is_none())
            .finish()
    }
}

/// Source of a stream whose chunks were all queued up front.
struct ChunkSource;

impl UnderlyingSource for ChunkSource {
    fn pull(&self, _controller: &ReadableController) -> Promise<()> {
        Promise::resolved(())
    }
}

struct TeeState {
    reader: RefCell<ReadableStreamReader>,
    reading: Cell<bool>,
    branches: RefCell<[Option<ReadableController>; 2]>,
    canceled: [Cell<bool>; 2],
}

impl TeeState {
    fn live_branches(&self) -> Vec<ReadableController> {
        self.branches
            .borrow()
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.canceled[*i].get())
            .filter_map(|(_, b)| b.clone())
            .collect()
    }
}

struct TeeBranch {
    tee: Rc<TeeState>,
    index: usize,
}

impl UnderlyingSource for TeeBranch {
    fn pull(&self, _controller: &ReadableController) -> Promise<()> {
        if self.tee.reading.replace(true) {
            return Promise::resolved(());
        }
        let read = self.tee.reader.borrow().read();
        let tee = Rc::clone(&self.tee);
        read.on_settled(move |result| {
            tee.reading.set(false);
            for branch in tee.live_branches() {
                match result {
                    Ok(Some(chunk)) => {
                        let _ = branch.enqueue(chunk.clone());
                    }
                    Ok(None) => {
                        let _ = branch.close();
                    }
                    Err(e) => branch.error(e.clone()),
                }
            }
        });
        Promise::resolved(())
    }

    fn cancel(&self, reason: &ScriptError) -> Promise<()> {
        self.tee.canceled[self.index].set(true);
        if self.tee.canceled.iter().all(Cell::get) {
            return self.tee.reader.borrow().cancel(reason.clone());
        }
        Promise::resolved(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields `count` numbered chunks, one per pull.
    struct Counter {
        next: Cell<u32>,
        count: u32,
        pulls: Rc<Cell<u32>>,
    }

    impl UnderlyingSource for Counter {
        fn pull(&self, controller: &ReadableController) -> Promise<()> {
            self.pulls.set(self.pulls.get() + 1);
            let n = self.next.get();
            if n == self.count {
                controller.close().unwrap();
            } else {
                self.next.set(n + 1);
                controller.enqueue(Bytes::from(n.to_string())).unwrap();
            }
            Promise::resolved(())
        }
    }

    fn counter(count: u32, high_water_mark: usize) -> (ReadableStream, Rc<Cell<u32>>) {
        let pulls = Rc::new(Cell::new(0));
        let stream = ReadableStream::new(
            Counter {
                next: Cell::new(0),
                count,
                pulls: Rc::clone(&pulls),
            },
            high_water_mark,
        );
        (stream, pulls)
    }

    fn chunk(promise: &Promise<Option<Bytes>>) -> Option<Bytes> {
        promise.result().unwrap().unwrap()
    }

    #[test]
    fn test_zero_high_water_mark_does_not_pull_eagerly() {
        let (stream, pulls) = counter(3, 0);
        assert_eq!(pulls.get(), 0);

        let reader = stream.get_reader().unwrap();
        assert_eq!(chunk(&reader.read()), Some(Bytes::from("0")));
        assert_eq!(pulls.get(), 1);
    }

    #[test]
    fn test_positive_high_water_mark_fills_queue() {
        let (_stream, pulls) = counter(10, 2);
        assert_eq!(pulls.get(), 2);
    }

    #[test]
    fn test_reads_in_order_then_done() {
        let (stream, _) = counter(2, 0);
        let reader = stream.get_reader().unwrap();
        assert_eq!(chunk(&reader.read()), Some(Bytes::from("0")));
        assert_eq!(chunk(&reader.read()), Some(Bytes::from("1")));
        assert_eq!(chunk(&reader.read()), None);
        assert!(stream.is_closed());
        assert_eq!(chunk(&reader.read()), None);
    }

    #[test]
    fn test_from_chunks() {
        let stream = ReadableStream::from_chunks(["a", "b"]);
        let reader = stream.get_reader().unwrap();
        assert_eq!(chunk(&reader.read()), Some(Bytes::from("a")));
        assert_eq!(chunk(&reader.read()), Some(Bytes::from("b")));
        assert_eq!(chunk(&reader.read()), None);
    }

    #[test]
    fn test_single_reader() {
        let (stream, _) = counter(1, 0);
        let mut reader = stream.get_reader().unwrap();
        assert!(stream.is_locked());
        assert!(stream.get_reader().unwrap_err().is_type_error());

        reader.release_lock();
        assert!(!stream.is_locked());
        assert!(reader.read().result().unwrap().is_err());
        assert!(stream.get_reader().is_ok());
    }

    #[test]
    fn test_error_rejects_pending_read() {
        let stream = ReadableStream::from_chunks(Vec::<Bytes>::new());
        assert!(stream.is_closed());

        struct Never;
        impl UnderlyingSource for Never {
            fn pull(&self, _controller: &ReadableController) -> Promise<()> {
                Promise::new()
            }
        }
        let stream = ReadableStream::new(Never, 0);
        let reader = stream.get_reader().unwrap();
        let read = reader.read();
        assert!(read.is_pending());

        stream.controller().error(ScriptError::thrown("boom"));
        assert_eq!(read.result(), Some(Err(ScriptError::thrown("boom"))));
        assert_eq!(stream.stored_error(), Some(ScriptError::thrown("boom")));
        assert!(stream.controller().enqueue(Bytes::new()).is_err());
    }

    #[test]
    fn test_cancel_disturbs_and_closes() {
        let (stream, _) = counter(5, 0);
        stream.cancel(ScriptError::thrown("enough")).result().unwrap().unwrap();
        assert!(stream.is_disturbed());
        assert!(stream.is_closed());
        assert!(stream.is_unusable());
    }

    #[test]
    fn test_tee_delivers_to_both_branches() {
        let (stream, _) = counter(2, 0);
        let (a, b) = stream.tee().unwrap();
        assert!(stream.is_locked());

        let (ra, rb) = (a.get_reader().unwrap(), b.get_reader().unwrap());
        assert_eq!(chunk(&ra.read()), Some(Bytes::from("0")));
        assert_eq!(chunk(&ra.read()), Some(Bytes::from("1")));
        assert_eq!(chunk(&rb.read()), Some(Bytes::from("0")));
        assert_eq!(chunk(&rb.read()), Some(Bytes::from("1")));
        assert_eq!(chunk(&ra.read()), None);
        assert_eq!(chunk(&rb.read()), None);
    }
}
