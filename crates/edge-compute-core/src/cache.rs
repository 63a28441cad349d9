//! The core cache API.
//!
//! [`CoreCache::lookup`] reads the cache directly. [`CoreCache::transaction_lookup`]
//! may hand the caller the obligation to fill or refresh an entry; that
//! obligation lives in a [`TransactionCacheEntry`], which cancels it when
//! dropped without an insert, update or explicit cancel.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use edge_compute_common::ScriptError;
use edge_compute_host::{
    AsyncItemHandle, CacheHandle, CacheLookupOptions, CacheLookupState, CacheWriteOptions, Host,
};

use crate::body::{ExchangeKind, ExchangeObject, body_accessors};
use crate::context::ExchangeContext;
use crate::event_loop::AsyncTask;
use crate::promise::Promise;
use crate::streams::{NativeSink, WritableStream, shared_body};

/// Cache-entry-only state of an exchange object.
pub(crate) struct CacheEntryData {
    pub(crate) handle: CacheHandle,
    pub(crate) key: Bytes,
}

/// A cache lookup result.
#[derive(Clone)]
pub struct CacheEntry {
    object: Rc<ExchangeObject>,
    cx: Rc<ExchangeContext>,
}

impl CacheEntry {
    /// Wrap a ready cache handle. A found object's body becomes this
    /// entry's body.
    fn from_handle(
        cx: &Rc<ExchangeContext>,
        handle: CacheHandle,
        key: Bytes,
    ) -> Result<Self, ScriptError> {
        let body = cx.host().cache_get_body(&handle)?;
        let has_body = body.is_some();
        let data = CacheEntryData { handle, key };
        let object =
            ExchangeObject::new(ExchangeKind::CacheEntry(data), body.unwrap_or_default(), "");
        object.set_has_body(has_body);
        Ok(Self {
            object,
            cx: Rc::clone(cx),
        })
    }

    pub(crate) fn object(&self) -> &Rc<ExchangeObject> {
        &self.object
    }

    pub(crate) fn context(&self) -> &Rc<ExchangeContext> {
        &self.cx
    }

    fn with_handle<R>(&self, f: impl FnOnce(&CacheHandle) -> R) -> R {
        match &*self.object.kind() {
            ExchangeKind::CacheEntry(data) => f(&data.handle),
            _ => unreachable!("cache entry object without cache data"),
        }
    }

    pub fn key(&self) -> Bytes {
        match &*self.object.kind() {
            ExchangeKind::CacheEntry(data) => data.key.clone(),
            _ => unreachable!("cache entry object without cache data"),
        }
    }

    pub fn state(&self) -> Result<CacheLookupState, ScriptError> {
        Ok(self.with_handle(|handle| self.cx.host().cache_get_state(handle))?)
    }

    pub fn user_metadata(&self) -> Result<Bytes, ScriptError> {
        Ok(self.with_handle(|handle| self.cx.host().cache_get_user_metadata(handle))?)
    }

    pub fn age(&self) -> Result<Option<Duration>, ScriptError> {
        let age = self.with_handle(|handle| self.cx.host().cache_get_age_ns(handle))?;
        Ok(age.map(Duration::from_nanos))
    }

    pub fn hits(&self) -> Result<Option<u64>, ScriptError> {
        Ok(self.with_handle(|handle| self.cx.host().cache_get_hits(handle))?)
    }

    /// Body length, when known.
    pub fn length(&self) -> Result<Option<u64>, ScriptError> {
        Ok(self.with_handle(|handle| self.cx.host().cache_get_length(handle))?)
    }

    pub fn max_age(&self) -> Result<Option<Duration>, ScriptError> {
        let max_age = self.with_handle(|handle| self.cx.host().cache_get_max_age_ns(handle))?;
        Ok(max_age.map(Duration::from_nanos))
    }

    pub fn stale_while_revalidate(&self) -> Result<Option<Duration>, ScriptError> {
        let swr = self
            .with_handle(|handle| self.cx.host().cache_get_stale_while_revalidate_ns(handle))?;
        Ok(swr.map(Duration::from_nanos))
    }

    /// Release the lookup. Later accessor calls fail.
    pub fn close(&self) -> Result<(), ScriptError> {
        let handle = match &mut *self.object.kind_mut() {
            ExchangeKind::CacheEntry(data) => data.handle.take(),
            _ => unreachable!("cache entry object without cache data"),
        };
        if handle.is_valid() {
            self.cx.host().cache_close(handle)?;
        }
        Ok(())
    }
}

body_accessors!(CacheEntry);

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key())
            .field("object", &self.object)
            .finish()
    }
}

/// Fill in the configured default max age when an insert names none.
fn with_defaults(cx: &ExchangeContext, options: &CacheWriteOptions) -> CacheWriteOptions {
    let mut options = options.clone();
    if options.max_age.is_zero() {
        if let Some(default) = cx.config().cache.default_max_age() {
            options.max_age = default;
        }
    }
    options
}

/// Entry points of the core cache API.
pub struct CoreCache;

impl CoreCache {
    /// Look `key` up without taking part in a transaction. `None` when
    /// nothing is cached.
    pub fn lookup(
        cx: &Rc<ExchangeContext>,
        key: impl Into<Bytes>,
        options: &CacheLookupOptions,
    ) -> Result<Option<CacheEntry>, ScriptError> {
        let key = key.into();
        let handle = cx.host().cache_lookup(&key, options)?;
        let state = cx.host().cache_get_state(&handle)?;
        if !state.is_found() {
            cx.host().cache_close(handle)?;
            return Ok(None);
        }
        CacheEntry::from_handle(cx, handle, key).map(Some)
    }

    /// Insert under `key` unconditionally; the object is committed when the
    /// returned stream closes.
    pub fn insert(
        cx: &Rc<ExchangeContext>,
        key: impl Into<Bytes>,
        options: &CacheWriteOptions,
    ) -> Result<WritableStream, ScriptError> {
        let key = key.into();
        let body = cx.host().cache_insert(&key, &with_defaults(cx, options))?;
        Ok(NativeSink::stream(cx, shared_body(body)))
    }

    /// Look `key` up as part of a transaction. When another exchange holds
    /// the obligation for `key`, the promise waits until it is resolved.
    pub fn transaction_lookup(
        cx: &Rc<ExchangeContext>,
        key: impl Into<Bytes>,
        options: &CacheLookupOptions,
    ) -> Promise<TransactionCacheEntry> {
        let key = key.into();
        let handle = match cx.host().cache_transaction_lookup(&key, options) {
            Ok(handle) => handle,
            Err(e) => return Promise::rejected(e.into()),
        };
        let done = Promise::new();
        let task = CacheLookupTask {
            handle,
            key,
            done: done.clone(),
        };
        match cx.event_loop().queue_task(Box::new(task)) {
            Ok(()) => done,
            Err(e) => Promise::rejected(e.into()),
        }
    }
}

/// Waits for a transaction lookup to stop being busy.
struct CacheLookupTask {
    handle: CacheHandle,
    key: Bytes,
    done: Promise<TransactionCacheEntry>,
}

impl AsyncTask for CacheLookupTask {
    fn handle(&self) -> AsyncItemHandle {
        self.handle.async_item()
    }

    fn run(self: Box<Self>, cx: &Rc<ExchangeContext>) {
        let Self { handle, key, done } = *self;
        let entry = CacheEntry::from_handle(cx, handle, key).and_then(|entry| {
            let state = entry.state()?;
            debug!(
                request_id = %cx.request_id(),
                found = state.is_found(),
                must_insert_or_update = state.must_insert_or_update(),
                "Cache transaction lookup ready"
            );
            Ok(TransactionCacheEntry {
                inner: Rc::new(TransactionInner {
                    entry,
                    host: cx.shared_host(),
                    resolved: Cell::new(!state.must_insert_or_update()),
                }),
            })
        });
        done.settle(entry);
    }

    fn name(&self) -> &'static str {
        "cache_lookup"
    }
}

struct TransactionInner {
    entry: CacheEntry,
    host: Rc<dyn Host>,
    /// No obligation is left to cancel.
    resolved: Cell<bool>,
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        if self.resolved.get() {
            return;
        }
        let cancelled = self
            .entry
            .with_handle(|handle| self.host.cache_transaction_cancel(handle));
        match cancelled {
            Ok(()) => debug!(key = ?self.entry.key(), "Cancelled abandoned cache transaction"),
            Err(e) => warn!(error = %e, "Failed to cancel cache transaction"),
        }
    }
}

/// A transaction lookup result, possibly holding the obligation to insert
/// or update the entry.
#[derive(Clone)]
pub struct TransactionCacheEntry {
    inner: Rc<TransactionInner>,
}

impl TransactionCacheEntry {
    /// The looked-up entry.
    pub fn entry(&self) -> &CacheEntry {
        &self.inner.entry
    }

    pub fn state(&self) -> Result<CacheLookupState, ScriptError> {
        self.inner.entry.state()
    }

    fn obligated(&self, operation: &str, verb: &str) -> Result<(), ScriptError> {
        if self.inner.resolved.get() || !self.state()?.must_insert_or_update() {
            return Err(ScriptError::type_error(format!(
                "TransactionCacheEntry.{operation}: entry does not exist or is not {verb}"
            )));
        }
        Ok(())
    }

    /// Insert a new object; it is committed when the returned stream closes.
    pub fn insert(&self, options: &CacheWriteOptions) -> Result<WritableStream, ScriptError> {
        self.obligated("insert", "insertable")?;
        let cx = &self.inner.entry.cx;
        let options = with_defaults(cx, options);
        let body = self
            .inner
            .entry
            .with_handle(|handle| cx.host().cache_transaction_insert(handle, &options))?;
        self.inner.resolved.set(true);
        Ok(NativeSink::stream(cx, shared_body(body)))
    }

    /// Insert a new object and get an entry that reads it back while it is
    /// being written.
    pub fn insert_and_stream_back(
        &self,
        options: &CacheWriteOptions,
    ) -> Result<(WritableStream, CacheEntry), ScriptError> {
        self.obligated("insertAndStreamBack", "insertable")?;
        let cx = &self.inner.entry.cx;
        let options = with_defaults(cx, options);
        let (body, stream_back) = self.inner.entry.with_handle(|handle| {
            cx.host()
                .cache_transaction_insert_and_stream_back(handle, &options)
        })?;
        self.inner.resolved.set(true);
        let entry = CacheEntry::from_handle(cx, stream_back, self.inner.entry.key())?;
        Ok((NativeSink::stream(cx, shared_body(body)), entry))
    }

    /// Refresh the metadata of a found object without replacing its body.
    pub fn update(&self, options: &CacheWriteOptions) -> Result<(), ScriptError> {
        self.obligated("update", "updatable")?;
        if !self.state()?.is_found() {
            return Err(ScriptError::type_error(
                "TransactionCacheEntry.update: entry does not exist or is not updatable",
            ));
        }
        let cx = &self.inner.entry.cx;
        let options = with_defaults(cx, options);
        self.inner
            .entry
            .with_handle(|handle| cx.host().cache_transaction_update(handle, &options))?;
        self.inner.resolved.set(true);
        Ok(())
    }

    /// Give up the obligation so another exchange can take it.
    pub fn cancel(&self) -> Result<(), ScriptError> {
        if self.inner.resolved.replace(true) {
            return Ok(());
        }
        let cx = &self.inner.entry.cx;
        self.inner
            .entry
            .with_handle(|handle| cx.host().cache_transaction_cancel(handle))?;
        Ok(())
    }
}

impl fmt::Debug for TransactionCacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCacheEntry")
            .field("entry", &self.inner.entry)
            .field("resolved", &self.inner.resolved.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_compute_common::{CacheConfig, RuntimeConfig};
    use edge_compute_host::{CacheStore, DownstreamRequest, Session};
    use std::sync::Arc;

    fn context(cache: &Arc<CacheStore>, config: RuntimeConfig) -> Rc<ExchangeContext> {
        let (session, _response) = Session::builder(DownstreamRequest::get("http://localhost/"))
            .cache(Arc::clone(cache))
            .build();
        ExchangeContext::new(Rc::new(session), config)
    }

    fn run(cx: &Rc<ExchangeContext>) {
        cx.event_loop().run(cx, || true).unwrap();
    }

    fn write(cx: &Rc<ExchangeContext>, stream: &WritableStream, bytes: &'static str) {
        let writer = stream.get_writer().unwrap();
        let _ = writer.write(bytes);
        let _ = writer.close();
        run(cx);
    }

    #[test]
    fn test_lookup_miss() {
        let cache = Arc::new(CacheStore::new(None));
        let cx = context(&cache, RuntimeConfig::default());
        let entry = CoreCache::lookup(&cx, "missing", &CacheLookupOptions::default()).unwrap();
        assert!(entry.is_none());
    }

    #[test]
    fn test_insert_then_lookup() {
        let cache = Arc::new(CacheStore::new(None));
        let cx = context(&cache, RuntimeConfig::default());
        let options = CacheWriteOptions {
            max_age: Duration::from_secs(60),
            user_metadata: Bytes::from_static(b"meta"),
            ..CacheWriteOptions::default()
        };
        let stream = CoreCache::insert(&cx, "k", &options).unwrap();
        write(&cx, &stream, "cached body");

        let entry = CoreCache::lookup(&cx, "k", &CacheLookupOptions::default())
            .unwrap()
            .unwrap();
        assert!(entry.state().unwrap().is_found());
        assert_eq!(entry.user_metadata().unwrap(), Bytes::from_static(b"meta"));
        assert_eq!(entry.max_age().unwrap(), Some(Duration::from_secs(60)));

        let text = entry.text();
        run(&cx);
        assert_eq!(text.result().unwrap().unwrap(), "cached body");
    }

    #[test]
    fn test_default_max_age_applies() {
        let cache = Arc::new(CacheStore::new(None));
        let config = RuntimeConfig {
            cache: CacheConfig {
                default_max_age_secs: Some(30),
            },
            ..RuntimeConfig::default()
        };
        let cx = context(&cache, config);
        let stream = CoreCache::insert(&cx, "k", &CacheWriteOptions::default()).unwrap();
        write(&cx, &stream, "x");

        let entry = CoreCache::lookup(&cx, "k", &CacheLookupOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(entry.max_age().unwrap(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_transaction_insert() {
        let cache = Arc::new(CacheStore::new(None));
        let cx = context(&cache, RuntimeConfig::default());

        let lookup = CoreCache::transaction_lookup(&cx, "t", &CacheLookupOptions::default());
        run(&cx);
        let tx = lookup.result().unwrap().unwrap();
        assert!(tx.state().unwrap().must_insert_or_update());

        let options = CacheWriteOptions {
            max_age: Duration::from_secs(10),
            ..CacheWriteOptions::default()
        };
        let stream = tx.insert(&options).unwrap();
        write(&cx, &stream, "fresh");

        assert!(CoreCache::lookup(&cx, "t", &CacheLookupOptions::default())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_update_of_missing_entry_fails() {
        let cache = Arc::new(CacheStore::new(None));
        let cx = context(&cache, RuntimeConfig::default());

        let lookup = CoreCache::transaction_lookup(&cx, "u", &CacheLookupOptions::default());
        run(&cx);
        let tx = lookup.result().unwrap().unwrap();
        let err = tx.update(&CacheWriteOptions::default()).unwrap_err();
        assert_eq!(
            err,
            ScriptError::type_error(
                "TransactionCacheEntry.update: entry does not exist or is not updatable"
            )
        );
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let cache = Arc::new(CacheStore::new(None));
        let cx = context(&cache, RuntimeConfig::default());

        let lookup = CoreCache::transaction_lookup(&cx, "c", &CacheLookupOptions::default());
        run(&cx);
        let tx = lookup.result().unwrap().unwrap();
        tx.cancel().unwrap();
        tx.cancel().unwrap();
        assert!(tx.insert(&CacheWriteOptions::default()).is_err());
    }
}
