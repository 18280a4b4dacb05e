//! Content-addressed compilation cache.
//!
//! Outputs of cacheable tasks are stored as blobs named by their BLAKE3 digest
//! under `objects/`, and an index maps each [`CacheKey`] to the outputs it
//! produced. The index is kept in memory behind a read-write lock and
//! persisted to `index.cbor` on every write.
//!
//! Lookups and materialization hold the read lock, so eviction never removes
//! an object while it is being copied out. Stores hash and copy their outputs
//! before taking the write lock; until the entry is indexed, its objects are
//! reserved so that eviction and validation leave them alone. Access times are a logical clock
//! bumped atomically under the read lock, which keeps eviction strictly LRU
//! without serializing lookups.
//!
//! The cache never fails a build on its own account: an unreadable index or a
//! damaged object turns into a miss and a note.

mod key;
mod metrics;
mod store;

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use camino::{Utf8Path, Utf8PathBuf};

pub use self::key::CacheKey;
pub use self::metrics::{CacheMetrics, MetricsSnapshot};
pub use self::store::{CacheEntry, StoredOutput};
use self::store::{IndexRecord, ObjectStore};
use crate::config::CacheConfig;
use crate::core::{ArcStr, Hash32};
use crate::diagnostics::Diagnostics;
use crate::error::CacheError;
use crate::graph::{BuildPlan, TaskId};

/// Result of a cache lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
}

/// Result of [`CompilationCache::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validation {
    /// Every entry was checked; `removed` broken entries were dropped.
    Validated { removed: usize },
    /// Nothing was written since the last validation.
    Skipped,
}

impl Display for Validation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Validation::Validated { .. } => f.write_str("validated successfully"),
            Validation::Skipped => f.write_str("validation skipped"),
        }
    }
}

struct Slot {
    entry: CacheEntry,
    last_access: AtomicU64,
}

#[derive(Default)]
struct State {
    entries: HashMap<CacheKey, Slot>,
    validated: bool,
}

impl State {
    fn size(&self) -> u64 {
        self.entries.values().map(|slot| slot.entry.size()).sum()
    }

    fn referenced(&self) -> HashSet<Hash32> {
        self.entries
            .values()
            .flat_map(|slot| slot.entry.objects())
            .collect()
    }
}

/// Objects written by stores that have not reached the index yet.
struct Reservation<'a> {
    pending: &'a Mutex<HashMap<Hash32, usize>>,
    objects: Vec<Hash32>,
}

impl Reservation<'_> {
    fn add(&mut self, object: Hash32) {
        *self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(object)
            .or_default() += 1;
        self.objects.push(object);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for object in &self.objects {
            if let Some(count) = pending.get_mut(object) {
                *count -= 1;
                if *count == 0 {
                    pending.remove(object);
                }
            }
        }
    }
}

pub struct CompilationCache {
    config: CacheConfig,
    store: ObjectStore,
    state: RwLock<State>,
    pending: Mutex<HashMap<Hash32, usize>>,
    clock: AtomicU64,
    metrics: CacheMetrics,
    notes: Mutex<Diagnostics>,
}

impl CompilationCache {
    /// Opens the cache at `config.path`, creating it if needed.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let store = ObjectStore::open(&config.path)?;
        let mut notes = Diagnostics::new();
        let mut state = State::default();
        let mut clock = 0;

        match store.read_index() {
            Ok(Some(index)) => {
                clock = index.clock;
                state.validated = index.validated;
                for record in index.records {
                    clock = clock.max(record.last_access);
                    state.entries.insert(
                        record.entry.key,
                        Slot {
                            entry: record.entry,
                            last_access: AtomicU64::new(record.last_access),
                        },
                    );
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("cache index at '{}' is unreadable: {err}", store.root());
                notes.note(
                    None,
                    format!(
                        "cache index at '{}' is unreadable, starting with an empty cache",
                        store.root()
                    ),
                );
            }
        }

        tracing::debug!(
            "opened cache at '{}' with {} entries",
            store.root(),
            state.entries.len()
        );

        Ok(Self {
            config,
            store,
            state: RwLock::new(state),
            pending: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(clock),
            metrics: CacheMetrics::default(),
            notes: Mutex::new(notes),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn root(&self) -> &Utf8Path {
        self.store.root()
    }

    /// Key of a planned task under this cache's scope.
    pub fn key(&self, plan: &BuildPlan, id: TaskId) -> io::Result<CacheKey> {
        CacheKey::for_task(plan, id, &self.config.scope)
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self) -> Reservation<'_> {
        Reservation {
            pending: &self.pending,
            objects: Vec::new(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn note(&self, target: Option<&ArcStr>, message: String) {
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .note(target, message);
    }

    fn remark(&self, target: Option<&ArcStr>, message: impl FnOnce() -> String) {
        if self.config.remarks {
            self.note(target, message());
        }
    }

    fn lookup_locked(&self, state: &State, key: &CacheKey) -> Lookup {
        let Some(slot) = state.entries.get(key) else {
            return Lookup::Miss;
        };

        for output in &slot.entry.outputs {
            if let Err(problem) = self.store.check(output, false) {
                tracing::warn!("cache entry {key} is damaged: {problem}");
                self.note(None, format!("cache entry {key} is damaged: {problem}"));
                return Lookup::Miss;
            }
        }

        slot.last_access.store(self.tick(), Ordering::Relaxed);
        Lookup::Hit(slot.entry.clone())
    }

    /// Looks `key` up without touching the outputs.
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let state = self.read();
        self.lookup_locked(&state, key)
    }

    /// Copies the outputs of `entry` into place. Returns `false` if the entry
    /// was evicted in the meantime.
    pub fn materialize(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
        let state = self.read();
        if !state.entries.contains_key(&entry.key) {
            return Ok(false);
        }

        for output in &entry.outputs {
            self.store.materialize(output)?;
        }

        Ok(true)
    }

    /// Looks up `key` and materializes its outputs in one step, recording the
    /// outcome in the metrics and, when enabled, as a remark.
    ///
    /// Returns `true` on a hit. Anything that prevents the outputs from being
    /// restored counts as a miss.
    pub fn restore(&self, key: &CacheKey, target: Option<&ArcStr>) -> bool {
        let state = self.read();

        let restored = match self.lookup_locked(&state, key) {
            Lookup::Hit(entry) => match entry
                .outputs
                .iter()
                .try_for_each(|output| self.store.materialize(output))
            {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!("couldn't restore cache entry {key}: {err}");
                    self.note(target, format!("couldn't restore cache entry {key}: {err}"));
                    false
                }
            },
            Lookup::Miss => false,
        };
        drop(state);

        if restored {
            self.metrics.record_hit();
            self.remark(target, || format!("cache found for key {key}"));
        } else {
            self.metrics.record_miss();
            self.remark(target, || format!("cache miss for key {key}"));
        }

        restored
    }

    /// Stores the files at `outputs` under `key`, then evicts down to the
    /// size limit. The new entry itself is never evicted.
    ///
    /// Directories among `outputs` are skipped; a missing output is an error.
    /// Outputs are copied into the store without holding the index lock, so
    /// lookups of other keys proceed meanwhile.
    pub fn store(&self, key: CacheKey, outputs: &[Utf8PathBuf]) -> Result<CacheEntry, CacheError> {
        let mut reservation = self.reserve();
        let mut stored = Vec::with_capacity(outputs.len());
        for path in outputs {
            match std::fs::metadata(path) {
                Ok(meta) if meta.is_dir() => continue,
                Ok(_) => {
                    let (object, size) = ObjectStore::digest(path)?;
                    reservation.add(object);
                    stored.push(self.store.write(path, object, size)?);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(CacheError::MissingOutput(path.clone()));
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut state = self.write();
        let entry = CacheEntry {
            key,
            outputs: stored,
        };

        let previous = state.entries.insert(
            key,
            Slot {
                entry: entry.clone(),
                last_access: AtomicU64::new(self.tick()),
            },
        );
        if let Some(previous) = previous {
            self.collect(&state, previous.entry.objects())?;
        }
        state.validated = false;

        if let Some(limit) = self.config.limit_size {
            self.evict_locked(&mut state, limit, Some(&key))?;
        }

        self.persist(&state)?;
        drop(reservation);
        tracing::debug!("stored {} outputs under {key}", entry.outputs.len());

        Ok(entry)
    }

    /// Evicts least recently used entries until the cache fits `max_size`.
    /// Returns the number of evicted entries.
    pub fn evict_to_budget(&self, max_size: u64) -> Result<usize, CacheError> {
        let mut state = self.write();
        let evicted = self.evict_locked(&mut state, max_size, None)?;

        if evicted > 0 {
            state.validated = false;
            self.persist(&state)?;
        }

        Ok(evicted)
    }

    fn evict_locked(
        &self,
        state: &mut State,
        max_size: u64,
        protect: Option<&CacheKey>,
    ) -> Result<usize, CacheError> {
        let mut size = state.size();
        if size <= max_size {
            return Ok(0);
        }

        let mut candidates: Vec<_> = state
            .entries
            .iter()
            .filter(|(key, _)| Some(*key) != protect)
            .map(|(key, slot)| {
                (
                    slot.last_access.load(Ordering::Relaxed),
                    *key,
                    slot.entry.size(),
                )
            })
            .collect();
        candidates.sort();

        let mut victims = Vec::new();
        for (_, key, entry_size) in candidates {
            if size <= max_size {
                break;
            }
            size -= entry_size;
            victims.push(key);
        }

        self.remove_entries(state, &victims)?;
        tracing::debug!(
            "evicted {} cache entries, {} bytes remain",
            victims.len(),
            size
        );

        Ok(victims.len())
    }

    fn remove_entries(&self, state: &mut State, keys: &[CacheKey]) -> Result<(), CacheError> {
        let mut released = Vec::new();
        for key in keys {
            if let Some(slot) = state.entries.remove(key) {
                released.extend(slot.entry.objects());
            }
        }

        self.collect(state, released)
    }

    /// Deletes `objects` that no remaining entry references and no store in
    /// flight has reserved.
    fn collect(
        &self,
        state: &State,
        objects: impl IntoIterator<Item = Hash32>,
    ) -> Result<(), CacheError> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let referenced = state.referenced();
        for object in objects {
            if !referenced.contains(&object) && !pending.contains_key(&object) {
                self.store.remove(object)?;
            }
        }
        Ok(())
    }

    /// Re-hashes every stored object and drops entries whose objects are
    /// missing or damaged. Skipped if nothing was written since the last
    /// successful validation.
    pub fn validate(&self) -> Result<Validation, CacheError> {
        let mut state = self.write();
        if state.validated {
            tracing::info!("cache at '{}': validation skipped", self.root());
            return Ok(Validation::Skipped);
        }

        let broken: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(key, slot)| {
                slot.entry.outputs.iter().any(|output| {
                    self.store
                        .check(output, true)
                        .inspect_err(|problem| tracing::warn!("cache entry {key}: {problem}"))
                        .is_err()
                })
            })
            .map(|(key, _)| *key)
            .collect();

        self.remove_entries(&mut state, &broken)?;
        let swept = {
            let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let mut keep = state.referenced();
            keep.extend(pending.keys().copied());
            self.store.sweep(&keep)?
        };

        state.validated = true;
        self.persist(&state)?;

        tracing::info!(
            "cache at '{}': validated successfully, removed {} entries and {} stray objects",
            self.root(),
            broken.len(),
            swept
        );

        Ok(Validation::Validated {
            removed: broken.len(),
        })
    }

    fn persist(&self, state: &State) -> Result<(), CacheError> {
        let mut records: Vec<_> = state
            .entries
            .values()
            .map(|slot| IndexRecord {
                entry: slot.entry.clone(),
                last_access: slot.last_access.load(Ordering::Relaxed),
            })
            .collect();
        records.sort_by(|a, b| a.entry.key.cmp(&b.entry.key));

        self.store
            .write_index(self.clock.load(Ordering::SeqCst), state.validated, records)
    }

    /// Persists access times gathered by lookups.
    pub fn flush(&self) -> Result<(), CacheError> {
        let state = self.write();
        self.persist(&state)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.read().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Total size of all entries in bytes.
    pub fn size(&self) -> u64 {
        self.read().size()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Ends a build: persists the index, writes the metrics file if one is
    /// configured and returns the notes gathered so far, with the hit rate
    /// summary appended when remarks are enabled.
    pub fn finish(&self) -> Result<Diagnostics, CacheError> {
        self.flush()?;

        let snapshot = self.metrics.snapshot();
        if let Some(path) = &self.config.metrics_path {
            snapshot.write(path)?;
        }
        self.remark(None, || snapshot.summary());

        let mut notes = self.notes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::take(&mut *notes))
    }
}

impl std::fmt::Debug for CompilationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationCache")
            .field("root", &self.root())
            .field("entries", &self.len())
            .finish()
    }
}
