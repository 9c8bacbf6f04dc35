//! Single-flight, flush-only cache shared by native set results, segments and aggregate row counts.
//!
//! Each key maps to a slot. The first caller to miss becomes the leader and computes the value
//! outside of any map lock; concurrent callers for the same key block on the slot until the
//! leader publishes. Failed, cancelled or panicking computations are evicted so that later
//! callers retry instead of observing a poisoned entry.

use crate::error::{NativeError, NativeResult};
use crate::executor::CancellationToken;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// How often a blocked waiter re-checks its own cancellation token.
const WAIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Callers that blocked on another caller's in-flight computation.
    pub waits: u64,
    /// Entries removed because their computation failed, was cancelled or panicked.
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug)]
enum SlotState<V> {
    Pending,
    Ready(V),
    Failed(NativeError),
    Abandoned,
}

#[derive(Debug)]
struct Slot<V> {
    state: Mutex<SlotState<V>>,
    changed: Condvar,
}

impl<V> Slot<V> {
    fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Pending),
            changed: Condvar::new(),
        })
    }

    fn publish(&self, state: SlotState<V>) {
        *self.state.lock().expect("cache slot mutex poisoned") = state;
        self.changed.notify_all();
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    waits: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug)]
pub struct SingleFlightCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Arc<Slot<V>>>,
    counters: Counters,
}

impl<K, V> Default for SingleFlightCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            counters: Counters::default(),
        }
    }
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash,
{
    fn evict(&self, key: &K, slot: &Arc<Slot<V>>) {
        if self
            .entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
        {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Evicts the leader's slot unless the computation completed normally.
struct LeaderGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
{
    cache: &'a SingleFlightCache<K, V>,
    key: &'a K,
    slot: Arc<Slot<V>>,
    completed: bool,
}

impl<K, V> Drop for LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            self.cache.evict(self.key, &self.slot);
            self.slot.publish(SlotState::Abandoned);
        }
    }
}

enum Role<V> {
    Leader(Arc<Slot<V>>),
    Waiter(Arc<Slot<V>>),
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed value for `key`, without waiting on or starting a computation.
    pub fn peek(&self, key: &K) -> Option<V> {
        let slot = self.entries.get(key).map(|s| Arc::clone(s.value()))?;
        let state = slot.state.lock().expect("cache slot mutex poisoned");
        match &*state {
            SlotState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Return the cached value for `key`, computing it at most once across concurrent callers.
    ///
    /// Waiters return the leader's error when it fails (the entry is evicted either way) and
    /// [`NativeError::Cancelled`] when their own token is cancelled while blocked.
    pub fn get_or_compute<F>(&self, key: &K, cancel: &CancellationToken, compute: F) -> NativeResult<V>
    where
        F: FnOnce() -> NativeResult<V>,
    {
        let mut compute = Some(compute);
        loop {
            match self.claim(key) {
                Role::Leader(slot) => {
                    let compute = compute.take().ok_or(NativeError::Cancelled)?;
                    return self.lead(key, slot, compute);
                }
                Role::Waiter(slot) => {
                    if let Some(result) = self.wait(&slot, cancel)? {
                        return result;
                    }
                    // The leader abandoned the slot; try to claim it.
                }
            }
        }
    }

    fn claim(&self, key: &K) -> Role<V> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => Role::Waiter(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let slot = Slot::pending();
                entry.insert(Arc::clone(&slot));
                Role::Leader(slot)
            }
        }
    }

    fn lead<F>(&self, key: &K, slot: Arc<Slot<V>>, compute: F) -> NativeResult<V>
    where
        F: FnOnce() -> NativeResult<V>,
    {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let mut guard = LeaderGuard {
            cache: self,
            key,
            slot,
            completed: false,
        };
        let result = compute();
        guard.completed = true;
        match &result {
            Ok(value) => guard.slot.publish(SlotState::Ready(value.clone())),
            Err(err) => {
                self.evict(key, &guard.slot);
                guard.slot.publish(SlotState::Failed(err.clone()));
            }
        }
        result
    }

    /// `Ok(None)` means the leader went away without publishing and the caller should retry.
    fn wait(
        &self,
        slot: &Arc<Slot<V>>,
        cancel: &CancellationToken,
    ) -> NativeResult<Option<NativeResult<V>>> {
        let mut state = slot.state.lock().expect("cache slot mutex poisoned");
        let mut waited = false;
        loop {
            match &*state {
                SlotState::Ready(value) => {
                    if !waited {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(Some(Ok(value.clone())));
                }
                SlotState::Failed(err) => return Ok(Some(Err(err.clone()))),
                SlotState::Abandoned => return Ok(None),
                SlotState::Pending => {}
            }
            cancel.check()?;
            if !waited {
                waited = true;
                self.counters.waits.fetch_add(1, Ordering::Relaxed);
                log::trace!("waiting on in-flight computation");
            }
            state = slot
                .changed
                .wait_timeout(state, WAIT_POLL)
                .expect("cache slot mutex poisoned")
                .0;
        }
    }

    /// Drop every entry. In-flight leaders still hand their result to current waiters.
    pub fn flush(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
