//! Byte streams.
//!
//! - [`readable`]: [`ReadableStream`] and its reader
//! - [`writable`]: [`WritableStream`] and its writer
//! - [`transform`]: [`TransformStream`] pipelines
//! - [`native`]: sources and sinks over host bodies
//! - [`compression`]: gzip and deflate pipelines built on [`transform`]
//!
//! Chunks are [`bytes::Bytes`]. Every stream belongs to one exchange and is
//! only touched from its thread.

pub mod compression;
pub mod native;
mod pipe;
pub mod readable;
pub mod transform;
pub mod writable;

pub(crate) use native::{NativeSink, NativeSource, SharedBody, shared_body};
pub(crate) use pipe::pump;
pub use compression::{CompressionFormat, CompressionStream, DecompressionStream};
pub use readable::{ReadableController, ReadableStream, ReadableStreamReader, UnderlyingSource};
pub use transform::{FnTransformer, TransformController, TransformStream, Transformer};
pub use writable::{UnderlyingSink, WritableController, WritableStream, WritableStreamWriter};
