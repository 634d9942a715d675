// tests/test_cache.rs — Camera cache shared between threads and engines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use mvsgm::cache::{request_host_camera, CameraCache, CameraHandle};
use mvsgm::synthetic::SceneBuilder;
use mvsgm::{CameraKey, DepthHypothesisSet, HostCameraCache, MatchingConfig, Roi, Sgm, Tile, TileParams};

// ===== Concurrency =====

#[test]
fn concurrent_first_requests_build_once() {
    let cache: Arc<CameraCache<Vec<u8>>> = Arc::new(CameraCache::new());
    let builds = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache
                    .request::<(), _>(CameraKey::new(5, 2), || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        // Slow build so the other threads pile up on the slot.
                        thread::sleep(Duration::from_millis(20));
                        Ok(vec![7u8; 64])
                    })
                    .unwrap()
            })
        })
        .collect();
    let results: Vec<CameraHandle<Vec<u8>>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(results.windows(2).all(|w| CameraHandle::ptr_eq(&w[0], &w[1])));
    assert_eq!(cache.stats().builds, 1);
    assert_eq!(cache.stats().hits, 7);
}

#[test]
fn other_keys_not_blocked_by_slow_build() {
    let cache: Arc<CameraCache<u32>> = Arc::new(CameraCache::new());
    let started = Arc::new(Barrier::new(2));

    let slow = {
        let cache = Arc::clone(&cache);
        let started = Arc::clone(&started);
        thread::spawn(move || {
            cache
                .request::<(), _>(CameraKey::new(1, 1), || {
                    started.wait();
                    thread::sleep(Duration::from_millis(200));
                    Ok(1)
                })
                .unwrap()
        })
    };
    started.wait();
    // Key 1 is mid-build; key 2 must be served without waiting for it.
    let fast = cache.request::<(), _>(CameraKey::new(2, 1), || Ok(2)).unwrap();
    assert_eq!(*fast, 2);
    assert!(!cache.contains(CameraKey::new(1, 1)));
    assert_eq!(*slow.join().unwrap(), 1);
    assert!(cache.contains(CameraKey::new(1, 1)));
}

#[test]
fn failed_build_leaves_slot_empty() {
    let cache: CameraCache<u32> = CameraCache::new();
    let key = CameraKey::new(9, 1);
    assert!(cache.request(key, || Err("disk on fire")).is_err());
    assert!(!cache.contains(key));
    let h = cache.request::<&str, _>(key, || Ok(3)).unwrap();
    assert_eq!(*h, 3);
    assert_eq!(cache.stats().builds, 1);
}

// ===== Eviction =====

#[test]
fn evicted_handle_stays_valid() {
    let cache: CameraCache<String> = CameraCache::with_capacity(2);
    let a = cache.request::<(), _>(CameraKey::new(0, 1), || Ok("a".to_string())).unwrap();
    cache.request::<(), _>(CameraKey::new(1, 1), || Ok("b".to_string())).unwrap();
    cache.request::<(), _>(CameraKey::new(2, 1), || Ok("c".to_string())).unwrap();

    // Capacity 2: the least recently used entry (key 0) is gone.
    assert!(!cache.contains(CameraKey::new(0, 1)));
    assert_eq!(cache.len(), 2);
    assert_eq!(a.as_str(), "a");

    let rebuilt = cache.request::<(), _>(CameraKey::new(0, 1), || Ok("a2".to_string())).unwrap();
    assert!(!CameraHandle::ptr_eq(&a, &rebuilt));
    assert_eq!(rebuilt.as_str(), "a2");
}

// ===== Shared between engines =====

#[test]
fn engines_share_cameras() {
    let scene = SceneBuilder::new(32, 16).baselines(vec![(0.5, 0.0), (-0.5, 0.0)]).build().unwrap();
    let views = Arc::new(scene.views.clone());
    let cache = Arc::new(HostCameraCache::new());
    let config = MatchingConfig { scale: 1, step_xy: 1, max_depths: 4, half_window: 1, ..MatchingConfig::default() };
    let params = TileParams { width: 16, height: 16 };

    let mut a = Sgm::new(Arc::clone(&views), Arc::clone(&cache), params, config.clone()).unwrap();
    let mut b = Sgm::new(Arc::clone(&views), Arc::clone(&cache), params, config).unwrap();
    let hyps = DepthHypothesisSet::full_coverage(vec![4.0, 5.0, 6.0, 7.0], 2);

    a.process(&Tile::new(scene.rc, scene.tcs.clone(), Roi::new(0, 16, 0, 16), 0, 2), &hyps).unwrap();
    b.process(&Tile::new(scene.rc, scene.tcs.clone(), Roi::new(16, 32, 0, 16), 1, 2), &hyps).unwrap();

    // rc + 2 tc, each built once at scale 1.
    assert_eq!(cache.stats().builds, 3);
    assert_eq!(cache.stats().hits, 3);
    let rc = request_host_camera(&cache, &views, scene.rc, 1).unwrap();
    assert_eq!(rc.image.width(), 32);
}
