//! In-memory cache store shared by sessions.
//!
//! Objects are immutable once committed. A transactional lookup that finds
//! nothing fresh is handed the obligation to insert or update; concurrent
//! transactional lookups for the same key stay busy until that obligation
//! is resolved, unless a usable (stale-while-revalidate) object exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::types::{CacheLookupState, CacheWriteOptions};

/// A committed cache object.
#[derive(Debug)]
pub(crate) struct CachedObject {
    pub(crate) body: Bytes,
    pub(crate) user_metadata: Bytes,
    pub(crate) length: Option<u64>,
    pub(crate) max_age: Duration,
    pub(crate) stale_while_revalidate: Duration,
    pub(crate) surrogate_keys: Vec<String>,
    initial_age: Duration,
    inserted: Instant,
    hits: AtomicU64,
}

impl CachedObject {
    pub(crate) fn new(body: Bytes, options: &CacheWriteOptions) -> Self {
        Self {
            length: options.length.or(Some(body.len() as u64)),
            body,
            user_metadata: options.user_metadata.clone(),
            max_age: options.max_age,
            stale_while_revalidate: options.stale_while_revalidate,
            surrogate_keys: options.surrogate_keys.clone(),
            initial_age: options.initial_age,
            inserted: Instant::now(),
            hits: AtomicU64::new(0),
        }
    }

    /// Same body, new metadata, age restarted.
    fn revalidated(&self, options: &CacheWriteOptions) -> Self {
        let mut object = Self::new(self.body.clone(), options);
        object.length = self.length;
        object.hits = AtomicU64::new(self.hits.load(Ordering::Relaxed));
        object
    }

    pub(crate) fn age(&self) -> Duration {
        self.initial_age + self.inserted.elapsed()
    }

    pub(crate) fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn is_stale(&self) -> bool {
        self.age() >= self.max_age
    }

    fn is_usable(&self) -> bool {
        self.age() < self.max_age + self.stale_while_revalidate
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Lookup state bits for `object`, plus the obligation flag.
pub(crate) fn lookup_state(object: Option<&CachedObject>, obligation: bool) -> CacheLookupState {
    let mut bits = 0;
    if let Some(object) = object {
        bits |= CacheLookupState::FOUND;
        if object.is_usable() {
            bits |= CacheLookupState::USABLE;
        }
        if object.is_stale() {
            bits |= CacheLookupState::STALE;
        }
    }
    if obligation {
        bits |= CacheLookupState::MUST_INSERT_OR_UPDATE;
    }
    CacheLookupState::from_bits(bits)
}

/// Outcome of starting a transactional lookup.
#[derive(Debug)]
pub(crate) enum TransactionStart {
    /// Someone else must insert first; try again later.
    Busy,
    Resolved {
        object: Option<Arc<CachedObject>>,
        obligation: bool,
    },
}

#[derive(Debug, Default)]
struct Slot {
    object: Option<Arc<CachedObject>>,
    /// Token of the transaction that must insert or update.
    obligation: Option<u64>,
}

/// Cache objects by key.
#[derive(Debug)]
pub struct CacheStore {
    slots: Mutex<HashMap<Vec<u8>, Slot>>,
    next_token: AtomicU64,
    default_max_age: Option<Duration>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CacheStore {
    /// A store applying `default_max_age` to writes that give no max age.
    pub fn new(default_max_age: Option<Duration>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            default_max_age,
        }
    }

    /// Number of keys holding an object.
    pub fn len(&self) -> usize {
        self.slots.lock().values().filter(|s| s.object.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every object carrying `surrogate_key`. Returns how many went.
    pub fn purge_surrogate_key(&self, surrogate_key: &str) -> usize {
        let mut slots = self.slots.lock();
        let mut purged = 0;
        for slot in slots.values_mut() {
            if slot
                .object
                .as_ref()
                .is_some_and(|o| o.surrogate_keys.iter().any(|k| k == surrogate_key))
            {
                slot.object = None;
                purged += 1;
            }
        }
        purged
    }

    pub(crate) fn new_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn lookup(&self, key: &[u8]) -> Option<Arc<CachedObject>> {
        let slots = self.slots.lock();
        let object = slots.get(key)?.object.clone()?;
        object.record_hit();
        Some(object)
    }

    pub(crate) fn begin_transaction(&self, key: &[u8], token: u64) -> TransactionStart {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_vec()).or_default();
        let object = slot.object.clone();

        let needs_write = object.as_ref().is_none_or(|o| o.is_stale());
        let held_by_other = slot.obligation.is_some_and(|t| t != token);

        if held_by_other {
            return match object {
                Some(object) if object.is_usable() => {
                    object.record_hit();
                    TransactionStart::Resolved {
                        object: Some(object),
                        obligation: false,
                    }
                }
                _ => TransactionStart::Busy,
            };
        }

        if needs_write {
            slot.obligation = Some(token);
        }
        if let Some(object) = &object {
            object.record_hit();
        }
        TransactionStart::Resolved {
            object,
            obligation: needs_write,
        }
    }

    /// Store `body` under `key`, resolving the obligation held by `token`.
    pub(crate) fn commit(
        &self,
        key: &[u8],
        token: Option<u64>,
        body: Bytes,
        options: &CacheWriteOptions,
    ) {
        let options = self.with_defaults(options);
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_vec()).or_default();
        slot.object = Some(Arc::new(CachedObject::new(body, &options)));
        if token.is_some() && slot.obligation == token {
            slot.obligation = None;
        }
        tracing::debug!(key_len = key.len(), "Cache object committed");
    }

    /// Refresh the metadata of the current object. Returns `false` if there
    /// is nothing to update.
    pub(crate) fn update(&self, key: &[u8], token: u64, options: &CacheWriteOptions) -> bool {
        let options = self.with_defaults(options);
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        let Some(object) = &slot.object else {
            return false;
        };
        slot.object = Some(Arc::new(object.revalidated(&options)));
        if slot.obligation == Some(token) {
            slot.obligation = None;
        }
        true
    }

    /// Give up the obligation held by `token`, if any.
    pub(crate) fn release(&self, key: &[u8], token: u64) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            if slot.obligation == Some(token) {
                slot.obligation = None;
            }
        }
    }

    fn with_defaults(&self, options: &CacheWriteOptions) -> CacheWriteOptions {
        let mut options = options.clone();
        if options.max_age.is_zero() {
            if let Some(default) = self.default_max_age {
                options.max_age = default;
            }
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> CacheWriteOptions {
        CacheWriteOptions {
            max_age: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[test]
    fn test_commit_then_lookup() {
        let store = CacheStore::default();
        assert!(store.lookup(b"k").is_none());

        store.commit(b"k", None, Bytes::from_static(b"v"), &fresh());
        let object = store.lookup(b"k").unwrap();

        assert_eq!(object.body, Bytes::from_static(b"v"));
        assert_eq!(object.length, Some(1));
        assert_eq!(object.hits(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_first_transaction_gets_obligation_second_is_busy() {
        let store = CacheStore::default();
        let first = store.new_token();
        let second = store.new_token();

        assert!(matches!(
            store.begin_transaction(b"k", first),
            TransactionStart::Resolved { object: None, obligation: true }
        ));
        assert!(matches!(
            store.begin_transaction(b"k", second),
            TransactionStart::Busy
        ));

        store.commit(b"k", Some(first), Bytes::from_static(b"v"), &fresh());
        match store.begin_transaction(b"k", second) {
            TransactionStart::Resolved { object, obligation } => {
                assert!(object.is_some());
                assert!(!obligation);
            }
            TransactionStart::Busy => panic!("still busy after commit"),
        }
    }

    #[test]
    fn test_release_unblocks_waiters() {
        let store = CacheStore::default();
        let first = store.new_token();
        let second = store.new_token();

        store.begin_transaction(b"k", first);
        store.release(b"k", first);

        assert!(matches!(
            store.begin_transaction(b"k", second),
            TransactionStart::Resolved { obligation: true, .. }
        ));
    }

    #[test]
    fn test_stale_object_states() {
        let store = CacheStore::default();
        let options = CacheWriteOptions {
            max_age: Duration::from_secs(10),
            initial_age: Duration::from_secs(15),
            stale_while_revalidate: Duration::from_secs(30),
            ..Default::default()
        };
        store.commit(b"k", None, Bytes::new(), &options);

        let object = store.lookup(b"k").unwrap();
        let state = lookup_state(Some(&object), false);
        assert!(state.is_found());
        assert!(state.is_stale());
        assert!(state.is_usable());
    }

    #[test]
    fn test_update_restarts_age() {
        let store = CacheStore::default();
        let stale = CacheWriteOptions {
            max_age: Duration::from_secs(1),
            initial_age: Duration::from_secs(5),
            ..Default::default()
        };
        store.commit(b"k", None, Bytes::from_static(b"body"), &stale);

        let token = store.new_token();
        assert!(matches!(
            store.begin_transaction(b"k", token),
            TransactionStart::Resolved { obligation: true, .. }
        ));
        assert!(store.update(b"k", token, &fresh()));

        let object = store.lookup(b"k").unwrap();
        assert!(!lookup_state(Some(&object), false).is_stale());
        assert_eq!(object.body, Bytes::from_static(b"body"));
    }

    #[test]
    fn test_default_max_age_applied() {
        let store = CacheStore::new(Some(Duration::from_secs(300)));
        store.commit(b"k", None, Bytes::new(), &CacheWriteOptions::default());
        assert_eq!(store.lookup(b"k").unwrap().max_age, Duration::from_secs(300));
    }

    #[test]
    fn test_purge_surrogate_key() {
        let store = CacheStore::default();
        let tagged = CacheWriteOptions {
            surrogate_keys: vec!["products".into()],
            ..fresh()
        };
        store.commit(b"a", None, Bytes::new(), &tagged);
        store.commit(b"b", None, Bytes::new(), &fresh());

        assert_eq!(store.purge_surrogate_key("products"), 1);
        assert!(store.lookup(b"a").is_none());
        assert!(store.lookup(b"b").is_some());
    }
}
