//! Streaming I/O and exchange dispatch for edge-compute.
//!
//! This crate provides what a guest handler runs against during one
//! exchange:
//! - [`ReadableStream`], [`WritableStream`], [`TransformStream`]: pull-based
//!   streams with backpressure, and native sources/sinks over host bodies
//! - [`CompressionStream`], [`DecompressionStream`]: gzip and deflate
//!   pipelines
//! - [`Request`], [`Response`], [`Headers`]: exchange objects whose bodies
//!   are either host handles or streams
//! - [`fetch`]: outbound requests through the host
//! - [`CoreCache`]: cache lookups, inserts and transactions
//! - [`EventLoop`]: the single-threaded task queue that drives it all
//! - [`dispatch`]: the per-exchange state machine around a [`FetchHandler`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Dispatcher                         │
//! │  (Shared across threads)                                │
//! │  - Fetch handler                                        │
//! │  - Runtime configuration                                │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ExchangeContext                       │
//! │  (Per-exchange, single-threaded)                        │
//! │  - Host handle table                                    │
//! │  - Event loop: host tasks, continuations, timers        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │       FetchEvent + Request/Response + Streams           │
//! │  - Exchange state machine                               │
//! │  - Bodies as host handles or streams                    │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod body;
pub mod cache;
pub mod context;
pub mod dispatch;
pub mod event_loop;
pub mod exchange;
pub mod fetch;
pub mod headers;
pub mod promise;
pub mod request;
pub mod response;
pub mod streams;

pub use body::BodyInit;
pub use cache::{CacheEntry, CoreCache, TransactionCacheEntry};
pub use context::{ExchangeContext, ExchangeMetrics};
pub use dispatch::{Dispatcher, ExchangeOutcome, FetchHandler, dispatch};
pub use event_loop::{AsyncTask, EventLoop};
pub use exchange::{ExchangeState, FetchEvent};
pub use fetch::{fetch, fetch_url};
pub use headers::Headers;
pub use promise::Promise;
pub use request::{Request, RequestInit};
pub use response::{Response, ResponseInit};
pub use streams::{
    CompressionFormat, CompressionStream, DecompressionStream, FnTransformer, ReadableStream,
    ReadableStreamReader, TransformStream, Transformer, UnderlyingSink, UnderlyingSource,
    WritableStream, WritableStreamWriter,
};
