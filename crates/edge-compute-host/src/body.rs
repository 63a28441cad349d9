//! Host-side body buffers.
//!
//! A [`BodyCell`] is the storage behind a [`BodyHandle`](crate::BodyHandle).
//! Without sinks, writes are buffered for readers. Once a sink is attached
//! (a downstream channel, a cache commit, a streaming send, a stream-back
//! mirror) writes are forwarded to it instead, and closing the cell
//! finalizes every sink.
//!
//! A cell created from complete bytes is `ended`: readers reach the end of
//! body once the buffer drains, but the cell stays writable until it is
//! closed, so it can still be written at either end or appended to.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use edge_compute_common::{HostError, HostErrorCode};

use crate::ready::ReadySignal;
use crate::types::BodyWriteEnd;

/// Called once with the collected bytes, or `None` if the body was abandoned.
pub(crate) type OnCollected = Box<dyn FnOnce(Option<Bytes>) + Send>;

enum BodySink {
    /// Forward writes and the close.
    Mirror(Arc<BodyCell>),
    /// Forward writes only; used by append while the source is still open.
    Append(Arc<BodyCell>),
    /// Stream to a downstream consumer; dropping the sender ends the stream.
    Channel(UnboundedSender<Bytes>),
    /// Accumulate everything and hand it over on close.
    Collect { buf: BytesMut, on_close: OnCollected },
}

#[derive(Default)]
struct BodyState {
    chunks: VecDeque<Bytes>,
    /// No producer is attached; an empty buffer reads as end of body.
    ended: bool,
    closed: bool,
    abandoned: bool,
    sinks: Vec<BodySink>,
}

pub(crate) struct BodyCell {
    state: Mutex<BodyState>,
    signal: Arc<ReadySignal>,
}

impl BodyCell {
    pub(crate) fn new(signal: Arc<ReadySignal>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BodyState::default()),
            signal,
        })
    }

    /// An ended, still writable body holding `bytes`.
    pub(crate) fn complete(signal: Arc<ReadySignal>, bytes: Bytes) -> Arc<Self> {
        let cell = Self::new(signal);
        {
            let mut state = cell.state.lock();
            if !bytes.is_empty() {
                state.chunks.push_back(bytes);
            }
            state.ended = true;
        }
        cell
    }

    pub(crate) fn write(&self, bytes: &[u8], end: BodyWriteEnd) -> Result<usize, HostError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HostError::bad_handle("body_write"));
        }
        let chunk = Bytes::copy_from_slice(bytes);
        if state.sinks.is_empty() {
            match end {
                BodyWriteEnd::Back => state.chunks.push_back(chunk),
                BodyWriteEnd::Front => state.chunks.push_front(chunk),
            }
        } else {
            forward(&mut state.sinks, &chunk);
        }
        drop(state);
        self.signal.notify();
        Ok(bytes.len())
    }

    /// Take up to `max` bytes. Empty means end of body (or no data yet when
    /// the cell is still open; callers check [`is_ready`](Self::is_ready)).
    pub(crate) fn read(&self, max: usize) -> Result<Bytes, HostError> {
        let mut state = self.state.lock();
        let Some(mut chunk) = state.chunks.pop_front() else {
            if state.abandoned {
                return Err(HostError::new("body_read", HostErrorCode::HttpIncomplete));
            }
            return Ok(Bytes::new());
        };
        if chunk.len() > max {
            let rest = chunk.split_off(max);
            state.chunks.push_front(rest);
        }
        Ok(chunk)
    }

    pub(crate) fn is_ready(&self) -> bool {
        let state = self.state.lock();
        !state.chunks.is_empty() || state.ended || state.closed
    }

    pub(crate) fn known_length(&self) -> Option<u64> {
        let state = self.state.lock();
        (state.ended || state.closed).then(|| state.chunks.iter().map(|c| c.len() as u64).sum())
    }

    /// Drain whatever is buffered.
    pub(crate) fn take_buffered(&self) -> Bytes {
        let mut state = self.state.lock();
        concat(state.chunks.drain(..))
    }

    /// Move `src`'s contents to the end of this body. If `src` still has a
    /// producer, its later writes follow.
    pub(crate) fn append_from(self: &Arc<Self>, src: &BodyCell) -> Result<(), HostError> {
        let mut src_state = src.state.lock();
        let chunks: Vec<Bytes> = src_state.chunks.drain(..).collect();
        if !src_state.closed && !src_state.ended {
            src_state.sinks.push(BodySink::Append(Arc::clone(self)));
        }
        drop(src_state);

        for chunk in chunks {
            self.write(&chunk, BodyWriteEnd::Back)?;
        }
        Ok(())
    }

    /// Forward everything, including the close, to `mirror`.
    pub(crate) fn attach_mirror(&self, mirror: Arc<BodyCell>) {
        let mut state = self.state.lock();
        for chunk in &state.chunks {
            mirror.push_forwarded(chunk);
        }
        if state.closed {
            let abandoned = state.abandoned;
            drop(state);
            mirror.finish(abandoned);
        } else {
            state.sinks.push(BodySink::Mirror(mirror));
        }
    }

    /// Stream buffered and future writes into `tx`.
    pub(crate) fn attach_channel(&self, tx: UnboundedSender<Bytes>) {
        let mut state = self.state.lock();
        for chunk in state.chunks.drain(..) {
            let _ = tx.send(chunk);
        }
        if !state.closed {
            state.sinks.push(BodySink::Channel(tx));
        }
    }

    /// Collect buffered and future writes, calling `on_close` on close.
    pub(crate) fn attach_collector(&self, on_close: OnCollected) {
        let mut state = self.state.lock();
        let mut buf = BytesMut::new();
        for chunk in state.chunks.drain(..) {
            buf.extend_from_slice(&chunk);
        }
        if state.closed {
            let abandoned = state.abandoned;
            drop(state);
            on_close((!abandoned).then(|| buf.freeze()));
        } else {
            state.sinks.push(BodySink::Collect { buf, on_close });
        }
    }

    pub(crate) fn close(&self) {
        self.finish(false);
    }

    pub(crate) fn abandon(&self) {
        self.finish(true);
    }

    fn finish(&self, abandoned: bool) {
        let sinks = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.abandoned = abandoned;
            std::mem::take(&mut state.sinks)
        };

        for sink in sinks {
            match sink {
                BodySink::Mirror(mirror) => mirror.finish(abandoned),
                BodySink::Append(_) | BodySink::Channel(_) => {}
                BodySink::Collect { buf, on_close } => {
                    on_close((!abandoned).then(|| buf.freeze()));
                }
            }
        }
        self.signal.notify();
    }

    fn push_forwarded(&self, chunk: &Bytes) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.sinks.is_empty() {
            state.chunks.push_back(chunk.clone());
        } else {
            forward(&mut state.sinks, chunk);
        }
        drop(state);
        self.signal.notify();
    }
}

fn forward(sinks: &mut [BodySink], chunk: &Bytes) {
    for sink in sinks {
        match sink {
            BodySink::Mirror(cell) | BodySink::Append(cell) => cell.push_forwarded(chunk),
            BodySink::Channel(tx) => {
                let _ = tx.send(chunk.clone());
            }
            BodySink::Collect { buf, .. } => buf.extend_from_slice(chunk),
        }
    }
}

pub(crate) fn concat(chunks: impl IntoIterator<Item = Bytes>) -> Bytes {
    let mut chunks = chunks.into_iter();
    let Some(first) = chunks.next() else {
        return Bytes::new();
    };
    let Some(second) = chunks.next() else {
        return first;
    };
    let mut buf = BytesMut::with_capacity(first.len() + second.len());
    buf.extend_from_slice(&first);
    buf.extend_from_slice(&second);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

impl fmt::Debug for BodyCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BodyCell")
            .field("buffered_chunks", &state.chunks.len())
            .field("closed", &state.closed)
            .field("sinks", &state.sinks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell() -> Arc<BodyCell> {
        BodyCell::new(ReadySignal::new())
    }

    #[test]
    fn test_read_splits_chunks() {
        let body = BodyCell::complete(ReadySignal::new(), Bytes::from_static(b"abc"));

        assert_eq!(body.read(2).unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(body.read(2).unwrap(), Bytes::from_static(b"c"));
        assert!(body.read(2).unwrap().is_empty());
    }

    #[test]
    fn test_front_write_goes_first() {
        let body = cell();
        body.write(b"world", BodyWriteEnd::Back).unwrap();
        body.write(b"hello ", BodyWriteEnd::Front).unwrap();
        body.close();

        assert_eq!(body.take_buffered(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_complete_body_accepts_writes_at_both_ends() {
        let body = BodyCell::complete(ReadySignal::new(), Bytes::from_static(b"middle"));
        body.write(b" end", BodyWriteEnd::Back).unwrap();
        body.write(b"start ", BodyWriteEnd::Front).unwrap();

        assert_eq!(body.known_length(), Some(16));
        assert_eq!(body.read(64).unwrap(), Bytes::from_static(b"start "));
        assert_eq!(body.read(64).unwrap(), Bytes::from_static(b"middle"));
        assert_eq!(body.read(64).unwrap(), Bytes::from_static(b" end"));
        assert!(body.is_ready());
        assert!(body.read(64).unwrap().is_empty());
    }

    #[test]
    fn test_append_into_complete_body() {
        let dest = BodyCell::complete(ReadySignal::new(), Bytes::from_static(b"hello "));
        let src = BodyCell::complete(ReadySignal::new(), Bytes::from_static(b"world"));

        dest.append_from(&src).unwrap();

        assert_eq!(dest.take_buffered(), Bytes::from_static(b"hello world"));
        assert!(src.take_buffered().is_empty());
    }

    #[test]
    fn test_write_after_close_fails() {
        let body = cell();
        body.close();
        assert!(body.write(b"x", BodyWriteEnd::Back).unwrap_err().is_bad_handle());
    }

    #[test]
    fn test_readiness_and_known_length() {
        let body = cell();
        assert!(!body.is_ready());
        assert_eq!(body.known_length(), None);

        body.write(b"1234", BodyWriteEnd::Back).unwrap();
        assert!(body.is_ready());

        body.close();
        assert_eq!(body.known_length(), Some(4));
    }

    #[test]
    fn test_collector_receives_everything_on_close() {
        let collected = Arc::new(Mutex::new(None));
        let body = cell();
        body.write(b"a", BodyWriteEnd::Back).unwrap();

        let sink = Arc::clone(&collected);
        body.attach_collector(Box::new(move |bytes| *sink.lock() = Some(bytes)));
        body.write(b"bc", BodyWriteEnd::Back).unwrap();
        body.close();

        assert_eq!(
            collected.lock().clone(),
            Some(Some(Bytes::from_static(b"abc")))
        );
    }

    #[test]
    fn test_collector_sees_abandon() {
        let collected = Arc::new(Mutex::new(None));
        let body = cell();
        let sink = Arc::clone(&collected);
        body.attach_collector(Box::new(move |bytes| *sink.lock() = Some(bytes)));
        body.abandon();

        assert_eq!(collected.lock().clone(), Some(None));
    }

    #[test]
    fn test_mirror_follows_writes_and_close() {
        let body = cell();
        let mirror = cell();
        body.attach_mirror(Arc::clone(&mirror));

        body.write(b"xy", BodyWriteEnd::Back).unwrap();
        assert_eq!(mirror.read(10).unwrap(), Bytes::from_static(b"xy"));

        body.close();
        assert!(mirror.is_ready());
        assert_eq!(mirror.known_length(), Some(0));
    }

    #[test]
    fn test_append_open_source_forwards_later_writes() {
        let dest = cell();
        let src = cell();
        src.write(b"one ", BodyWriteEnd::Back).unwrap();

        dest.append_from(&src).unwrap();
        src.write(b"two", BodyWriteEnd::Back).unwrap();
        src.close();

        assert_eq!(dest.take_buffered(), Bytes::from_static(b"one two"));
        assert!(!dest.is_ready());
    }

    #[test]
    fn test_channel_receives_buffered_then_live_chunks() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let body = cell();
        body.write(b"a", BodyWriteEnd::Back).unwrap();
        body.attach_channel(tx);
        body.write(b"b", BodyWriteEnd::Back).unwrap();
        body.close();

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"b"));
        assert!(rx.try_recv().is_err());
    }
}
