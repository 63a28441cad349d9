//! Piping readable streams into writable streams.

use std::rc::Rc;

use edge_compute_common::ScriptError;
use tracing::trace;

use super::readable::{ReadableStream, ReadableStreamReader};
use super::transform::TransformStream;
use super::writable::{WritableStream, WritableStreamWriter};
use crate::context::ExchangeContext;
use crate::promise::Promise;

impl ReadableStream {
    /// Pipe every chunk into `dest`, then close it.
    ///
    /// Both streams stay locked until the pipe finishes. An error on either
    /// side is carried to the other: a source error aborts `dest`, a
    /// destination error cancels the source.
    pub fn pipe_to(
        &self,
        cx: &Rc<ExchangeContext>,
        dest: &WritableStream,
    ) -> Result<Promise<()>, ScriptError> {
        if self.is_locked() {
            return Err(ScriptError::type_error(
                "pipeTo called on a ReadableStream that's already locked",
            ));
        }
        if dest.is_locked() {
            return Err(ScriptError::type_error(
                "pipeTo called on a WritableStream that's already locked",
            ));
        }
        if let (Some(source), Some(pipeline)) = (self.native_source(), dest.transform()) {
            if pipeline.is_identity() {
                source.set_piped_to(pipeline);
            }
        }

        let reader = self.get_reader()?;
        let writer = dest.get_writer()?;
        let done = Promise::new();
        let settle = done.clone();
        cx.spawn(async move {
            settle.settle(pump(reader, writer).await);
        });
        Ok(done)
    }

    /// Pipe into `transform`'s writable end and return its readable end.
    pub fn pipe_through(
        &self,
        cx: &Rc<ExchangeContext>,
        transform: &TransformStream,
    ) -> Result<ReadableStream, ScriptError> {
        if self.is_locked() {
            return Err(ScriptError::type_error(
                "pipeThrough called on a ReadableStream that's already locked",
            ));
        }
        self.pipe_to(cx, &transform.writable())?;
        Ok(transform.readable())
    }
}

/// Move chunks from `reader` to `writer` until the source closes or either
/// side fails, then release both locks.
pub(crate) async fn pump(
    mut reader: ReadableStreamReader,
    mut writer: WritableStreamWriter,
) -> Result<(), ScriptError> {
    let result = loop {
        if let Err(e) = writer.ready().await {
            let _ = reader.cancel(e.clone());
            break Err(e);
        }
        match reader.read().await {
            Ok(Some(chunk)) => {
                trace!(len = chunk.len(), "Piping chunk");
                let _ = writer.write(chunk);
            }
            Ok(None) => break writer.close().await,
            Err(e) => {
                let _ = writer.abort(e.clone()).await;
                break Err(e);
            }
        }
    };
    reader.release_lock();
    writer.release_lock();
    result
}
