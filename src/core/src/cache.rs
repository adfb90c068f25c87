//! Session-scoped materialization cache.
//!
//! Builds are single-flight: the first caller for a key installs a shared
//! future and every concurrent caller awaits that same future. The shared
//! future records its own outcome, so a build finishes and is cached even if
//! the caller that started it goes away. Failed builds are never cached.
//!
//! The cache performs no I/O. Entries it drops (invalidated, stale or evicted)
//! are queued as retired and the engine asks the owning backend to discard
//! their artifacts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_exception::Result;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{BackendKind, Materialization};
use crate::layer::LayerId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub layer: LayerId,
    pub backend: BackendKind,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(layer: LayerId, backend: BackendKind, fingerprint: impl Into<String>) -> Self {
        Self {
            layer,
            backend,
            fingerprint: fingerprint.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub materialization: Materialization,
    pub created_at: DateTime<Utc>,
    /// Layer generation captured when the build started.
    pub generation: u64,
    /// Number of history entries pinning this materialization.
    pub ref_count: usize,
    pub valid: bool,
    last_used: u64,
}

type SharedBuild = Shared<BoxFuture<'static, Result<Materialization>>>;

enum Slot {
    Ready(CacheEntry),
    Building { generation: u64, build: SharedBuild },
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<CacheKey, Slot>,
    generations: HashMap<LayerId, u64>,
    retired: Vec<CacheEntry>,
    tick: u64,
    builds: u64,
}

impl CacheState {
    fn generation(&self, layer: &LayerId) -> u64 {
        self.generations.get(layer).copied().unwrap_or(0)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn retire(&mut self, mut entry: CacheEntry) {
        entry.valid = false;
        self.retired.push(entry);
    }

    /// Evicts least recently used unpinned entries until within `max_entries`.
    fn evict_over_capacity(&mut self, max_entries: usize, keep: &CacheKey) {
        loop {
            let ready = self
                .slots
                .values()
                .filter(|slot| matches!(slot, Slot::Ready(_)))
                .count();
            if ready <= max_entries {
                return;
            }
            let victim = self
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) if entry.ref_count == 0 && key != keep => {
                        Some((entry.last_used, key.clone()))
                    }
                    _ => None,
                })
                .min_by_key(|(last_used, _)| *last_used)
                .map(|(_, key)| key);
            let Some(victim) = victim else {
                return;
            };
            if let Some(Slot::Ready(entry)) = self.slots.remove(&victim) {
                debug!(
                    layer = %victim.layer,
                    backend = %victim.backend,
                    fingerprint = %victim.fingerprint,
                    "evicting materialization"
                );
                self.retire(entry);
            }
        }
    }
}

#[derive(Clone)]
pub struct MaterializationCache {
    state: Arc<Mutex<CacheState>>,
    max_entries: usize,
}

impl MaterializationCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            max_entries: max_entries.max(1),
        }
    }

    /// Current data generation of a layer.
    pub fn generation(&self, layer: &LayerId) -> u64 {
        self.state.lock().generation(layer)
    }

    /// Returns the cached materialization for `key`, or runs `builder` to make
    /// one. Concurrent callers for the same key share a single build.
    pub async fn get_or_build<F, Fut>(&self, key: CacheKey, builder: F) -> Result<Materialization>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Materialization>> + Send + 'static,
    {
        let build = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let generation = state.generation(&key.layer);
            let tick = state.next_tick();
            match state.slots.get_mut(&key) {
                Some(Slot::Ready(entry)) if entry.valid && entry.generation == generation => {
                    entry.last_used = tick;
                    debug!(
                        layer = %key.layer,
                        backend = %key.backend,
                        fingerprint = %key.fingerprint,
                        "materialization cache hit"
                    );
                    return Ok(entry.materialization.clone());
                }
                Some(Slot::Building {
                    generation: building,
                    build,
                }) if *building == generation => build.clone(),
                _ => {
                    if let Some(Slot::Ready(stale)) = state.slots.remove(&key) {
                        debug!(
                            layer = %key.layer,
                            fingerprint = %key.fingerprint,
                            "dropping stale materialization"
                        );
                        state.retire(stale);
                    }
                    state.builds += 1;
                    let build = self.shared_build(key.clone(), generation, builder());
                    state.slots.insert(
                        key.clone(),
                        Slot::Building {
                            generation,
                            build: build.clone(),
                        },
                    );
                    build
                }
            }
        };
        build.await
    }

    fn shared_build<Fut>(&self, key: CacheKey, generation: u64, fut: Fut) -> SharedBuild
    where
        Fut: Future<Output = Result<Materialization>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let max_entries = self.max_entries;
        async move {
            let result = fut.await;
            complete_build(&state, max_entries, &key, generation, &result);
            result
        }
        .boxed()
        .shared()
    }

    /// A valid, current entry for `key`, without building.
    pub fn lookup(&self, key: &CacheKey) -> Option<Materialization> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let generation = state.generation(&key.layer);
        let tick = state.next_tick();
        match state.slots.get_mut(key) {
            Some(Slot::Ready(entry)) if entry.valid && entry.generation == generation => {
                entry.last_used = tick;
                Some(entry.materialization.clone())
            }
            _ => None,
        }
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.state.lock().slots.get(key) {
            Some(Slot::Ready(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Pins an entry against eviction. Returns false if there is no entry.
    pub fn acquire(&self, key: &CacheKey) -> bool {
        match self.state.lock().slots.get_mut(key) {
            Some(Slot::Ready(entry)) => {
                entry.ref_count += 1;
                true
            }
            _ => false,
        }
    }

    pub fn release(&self, key: &CacheKey) {
        if let Some(Slot::Ready(entry)) = self.state.lock().slots.get_mut(key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Bumps the layer's generation and drops all of its entries. Builds in
    /// flight are detached; their results are retired when they finish.
    pub fn invalidate(&self, layer: &LayerId) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        *state.generations.entry(layer.clone()).or_insert(0) += 1;
        let keys: Vec<CacheKey> = state
            .slots
            .keys()
            .filter(|key| &key.layer == layer)
            .cloned()
            .collect();
        let mut dropped = 0;
        for key in keys {
            if let Some(Slot::Ready(entry)) = state.slots.remove(&key) {
                state.retire(entry);
                dropped += 1;
            }
        }
        debug!(
            layer = %layer,
            generation = state.generation(layer),
            dropped,
            "invalidated materializations"
        );
        dropped
    }

    /// Drops every entry; used at session teardown.
    pub fn clear(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut dropped = 0;
        for (_, slot) in std::mem::take(&mut state.slots) {
            if let Slot::Ready(entry) = slot {
                state.retire(entry);
                dropped += 1;
            }
        }
        dropped
    }

    /// Entries dropped since the last call, whose artifacts still exist.
    pub fn take_retired(&self) -> Vec<CacheEntry> {
        std::mem::take(&mut self.state.lock().retired)
    }

    /// Number of ready entries.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds started over the cache's lifetime.
    pub fn build_count(&self) -> u64 {
        self.state.lock().builds
    }
}

fn complete_build(
    state: &Mutex<CacheState>,
    max_entries: usize,
    key: &CacheKey,
    generation: u64,
    result: &Result<Materialization>,
) {
    let mut guard = state.lock();
    let state = &mut *guard;
    let current = matches!(
        state.slots.get(key),
        Some(Slot::Building { generation: building, .. }) if *building == generation
    );
    match result {
        Ok(materialization) => {
            let tick = state.next_tick();
            let entry = CacheEntry {
                key: key.clone(),
                materialization: materialization.clone(),
                created_at: Utc::now(),
                generation,
                ref_count: 0,
                valid: true,
                last_used: tick,
            };
            if current {
                debug!(
                    layer = %key.layer,
                    backend = %key.backend,
                    fingerprint = %key.fingerprint,
                    artifact = %materialization.artifact.name(),
                    "materialization built"
                );
                state.slots.insert(key.clone(), Slot::Ready(entry));
                state.evict_over_capacity(max_entries, key);
            } else {
                debug!(
                    layer = %key.layer,
                    fingerprint = %key.fingerprint,
                    "materialization finished after invalidation"
                );
                state.retire(entry);
            }
        }
        Err(e) => {
            if current {
                state.slots.remove(key);
            }
            debug!(
                layer = %key.layer,
                fingerprint = %key.fingerprint,
                error = %e,
                "materialization build failed"
            );
        }
    }
}
