// cache.rs — Shared camera cache keyed by (camera id, matching scale).
//
// Engines never own camera data. Whoever composes engines creates one cache
// and hands every engine an `Arc` to it, so a camera used as a target by
// many tiles (and as a reference by its own tiles) is downscaled and
// uploaded once per scale.
//
// GUARANTEES
// ──────────
// - Lazy: an entry is built on first `request` for its key.
// - At most one resident copy per key.
// - Concurrent first requests for the same key serialize on that key's slot:
//   one caller builds, the others block and then receive the built value.
//   Requests for other keys never wait on that build.
// - No caller ever sees a partially built entry; a failed build leaves the
//   slot empty so a later request builds again.
// - Eviction (explicit, or LRU beyond `capacity`) drops the cache's
//   reference only. Outstanding handles keep their value alive until they
//   are dropped; the next request for the key builds a fresh copy.
//
// LOCKING
// ───────
//   state: Mutex<CacheState>        map + LRU order, held only briefly
//   slot:  Arc<Mutex<Option<Arc<T>>>> one per key, held across the build
//
// Lock order is always slot → state, never the reverse, so a long build
// only ever blocks requests for its own key.
//
// NEW RUST CONCEPTS
// ─────────────────
// - `parking_lot::Mutex` — no poisoning, `lock()` returns the guard directly.
// - Generic `request<E, F: FnOnce() -> Result<T, E>>` — the builder is
//   supplied by the caller, so the same cache type serves host cameras and
//   device cameras with their own error types.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::camera::{PinholeCamera, ViewSet};
use crate::error::SgmError;
use crate::image::Image;

/// Cache key: camera id at a matching scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraKey {
    pub camera: usize,
    pub scale: u32,
}

impl CameraKey {
    pub fn new(camera: usize, scale: u32) -> Self {
        CameraKey { camera, scale }
    }
}

impl fmt::Display for CameraKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "camera {} @ scale {}", self.camera, self.scale)
    }
}

/// Shared reference to a cache-resident camera.
pub struct CameraHandle<T> {
    key: CameraKey,
    value: Arc<T>,
}

impl<T> CameraHandle<T> {
    pub fn key(&self) -> CameraKey {
        self.key
    }

    /// True when both handles point to the same resident copy.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.value, &b.value)
    }
}

impl<T> Clone for CameraHandle<T> {
    fn clone(&self) -> Self {
        CameraHandle { key: self.key, value: Arc::clone(&self.value) }
    }
}

impl<T> Deref for CameraHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> fmt::Debug for CameraHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CameraHandle({})", self.key)
    }
}

/// Build / hit / eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub builds: u64,
    pub hits: u64,
    pub evictions: u64,
}

type Slot<T> = Arc<Mutex<Option<Arc<T>>>>;

struct CacheState<T> {
    slots: HashMap<CameraKey, Slot<T>>,
    /// Resident keys, least recently used first.
    lru: VecDeque<CameraKey>,
}

/// Thread-safe lazily-populated camera cache.
pub struct CameraCache<T> {
    state: Mutex<CacheState<T>>,
    capacity: Option<usize>,
    builds: AtomicU64,
    hits: AtomicU64,
    evictions: AtomicU64,
}

impl<T> Default for CameraCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CameraCache<T> {
    /// Unbounded cache: entries stay until evicted explicitly.
    pub fn new() -> Self {
        Self::build_with(None)
    }

    /// Cache holding at most `capacity` resident entries (LRU eviction).
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build_with(Some(capacity.max(1)))
    }

    fn build_with(capacity: Option<usize>) -> Self {
        CameraCache {
            state: Mutex::new(CacheState { slots: HashMap::new(), lru: VecDeque::new() }),
            capacity,
            builds: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Return the entry for `key`, building it with `build` if absent.
    pub fn request<E, F>(&self, key: CameraKey, build: F) -> Result<CameraHandle<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let slot = {
            let mut state = self.state.lock();
            Arc::clone(state.slots.entry(key).or_insert_with(|| Arc::new(Mutex::new(None))))
        };

        let mut guard = slot.lock();
        if let Some(value) = guard.as_ref() {
            let value = Arc::clone(value);
            drop(guard);
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.touch(key, &slot);
            return Ok(CameraHandle { key, value });
        }

        debug!("camera cache: building {key}");
        let value = Arc::new(build()?);
        *guard = Some(Arc::clone(&value));
        drop(guard);
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.mark_resident(key, &slot);
        Ok(CameraHandle { key, value })
    }

    /// Drop the cache's reference to `key`. Returns whether it was resident.
    pub fn evict(&self, key: CameraKey) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.lru.iter().position(|k| *k == key) else {
            return false;
        };
        state.lru.remove(pos);
        state.slots.remove(&key);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Evict every resident entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let resident: Vec<CameraKey> = state.lru.drain(..).collect();
        for key in &resident {
            state.slots.remove(key);
        }
        self.evictions.fetch_add(resident.len() as u64, Ordering::Relaxed);
    }

    /// Whether `key` currently has a resident entry.
    pub fn contains(&self, key: CameraKey) -> bool {
        self.state.lock().lru.contains(&key)
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            builds: self.builds.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn is_current(state: &CacheState<T>, key: CameraKey, slot: &Slot<T>) -> bool {
        state.slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    fn touch(&self, key: CameraKey, slot: &Slot<T>) {
        let mut state = self.state.lock();
        if !Self::is_current(&state, key, slot) {
            return;
        }
        if let Some(pos) = state.lru.iter().position(|k| *k == key) {
            state.lru.remove(pos);
            state.lru.push_back(key);
        }
    }

    fn mark_resident(&self, key: CameraKey, slot: &Slot<T>) {
        let mut state = self.state.lock();
        // Cleared while building: the caller keeps its value, the cache does not.
        if !Self::is_current(&state, key, slot) {
            return;
        }
        state.lru.push_back(key);
        if let Some(cap) = self.capacity {
            while state.lru.len() > cap {
                let Some(old) = state.lru.pop_front() else { break };
                state.slots.remove(&old);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("camera cache: evicted {old}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Host cameras
// ---------------------------------------------------------------------------

/// Camera at matching scale with its box-downscaled f32 image.
#[derive(Debug, Clone)]
pub struct HostCamera {
    pub key: CameraKey,
    pub view_id: usize,
    pub camera: PinholeCamera,
    pub image: Image<f32>,
}

impl HostCamera {
    pub fn build(views: &ViewSet, key: CameraKey) -> Result<Self, SgmError> {
        let view = views.get(key.camera)?;
        Ok(HostCamera {
            key,
            view_id: view.view_id,
            camera: view.camera.scaled(key.scale),
            image: view.image.downscale_box(key.scale.max(1) as usize),
        })
    }
}

/// Cache of host cameras used by the CPU engine.
pub type HostCameraCache = CameraCache<HostCamera>;

/// Request a host camera, building it from `views` on first access.
pub fn request_host_camera(
    cache: &HostCameraCache,
    views: &ViewSet,
    camera: usize,
    scale: u32,
) -> Result<CameraHandle<HostCamera>, SgmError> {
    let key = CameraKey::new(camera, scale);
    cache.request(key, || HostCamera::build(views, key))
}
