//! Page reclaimer
//!
//! The reclaimer keeps a global least-recently-used order over every page
//! that a [`CacheBundle`] (a managed space, in practice) is willing to give
//! back. A background task wakes up periodically, checks whether physical
//! memory is under pressure or the cache has grown beyond its floor, and if
//! so asks the owning bundle to uncache the coldest page.
//!
//! Page lifecycle as seen by the reclaimer:
//!
//! ```text
//!  (untracked) --add_page--> Cached --check_reclaim--> Uncaching
//!       ^                      ^  |                        |
//!       |                      |  +----bump_page-----------+ (rescued)
//!       +---remove_page / finish_uncaching-----------------+
//! ```
//!
//! A page is in exactly one of: not tracked, on the LRU list (`Cached`), or
//! handed to its bundle for eviction (`Uncaching`).

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use nos_vm_api::sync::{CancellationEvent, Mutex};
use nos_vm_api::{BoxFuture, PhysicalAllocator};

use crate::config::ReclaimConfig;

/// Identifier of a registered [`CacheBundle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId(pub u64);

/// Key of a tracked page: owning bundle plus bundle-local identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    /// Owning bundle
    pub bundle: BundleId,
    /// Bundle-local page identity (a page index for managed spaces)
    pub identity: usize,
}

/// Reclaim state of a tracked page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimState {
    /// On the LRU list
    Cached,
    /// Handed to the bundle for eviction
    Uncaching,
}

/// Owner of reclaimable pages
pub trait CacheBundle: Send + Sync {
    /// Evicts and frees the page with the given identity
    ///
    /// Resolves to `true` if the page was freed. A page that was touched
    /// again while the eviction was in flight stays cached and yields `false`.
    fn uncache_page(self: Arc<Self>, identity: usize) -> BoxFuture<'static, bool>;
}

struct Tracked {
    stamp: u64,
    size: usize,
    state: ReclaimState,
}

struct ReclaimInner {
    lru: BTreeMap<u64, PageKey>,
    tracked: HashMap<PageKey, Tracked>,
    bundles: HashMap<BundleId, Weak<dyn CacheBundle>>,
    cached_size: usize,
    next_stamp: u64,
}

impl ReclaimInner {
    fn stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }
}

/// Statistics of the reclaimer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Pages on the LRU list
    pub cached_pages: usize,
    /// Pages currently handed to their bundle
    pub uncaching_pages: usize,
    /// Bytes of tracked pages
    pub cached_size: usize,
    /// Pages freed so far
    pub reclaimed_pages: u64,
}

/// Global LRU over reclaimable pages
pub struct MemoryReclaimer {
    inner: Mutex<ReclaimInner>,
    physical: Arc<dyn PhysicalAllocator>,
    config: ReclaimConfig,
    next_bundle: AtomicU64,
    reclaimed: AtomicU64,
    cancel: CancellationEvent,
}

impl MemoryReclaimer {
    /// Creates a reclaimer that watches the usage of `physical`
    pub fn new(physical: Arc<dyn PhysicalAllocator>, config: ReclaimConfig) -> Arc<Self> {
        vm_debug!(
            "vm: reclaimer watermark {}%, cache floor {:#x}",
            config.watermark_percent,
            config.cache_floor
        );
        Arc::new(Self {
            inner: Mutex::new(ReclaimInner {
                lru: BTreeMap::new(),
                tracked: HashMap::new(),
                bundles: HashMap::new(),
                cached_size: 0,
                next_stamp: 0,
            }),
            physical,
            config,
            next_bundle: AtomicU64::new(1),
            reclaimed: AtomicU64::new(0),
            cancel: CancellationEvent::new(),
        })
    }

    /// Policy of this reclaimer
    pub fn config(&self) -> &ReclaimConfig {
        &self.config
    }

    /// Registers a bundle and returns its identifier
    pub fn register_bundle(&self, bundle: Weak<dyn CacheBundle>) -> BundleId {
        let id = BundleId(self.next_bundle.fetch_add(1, Ordering::Relaxed));
        self.inner.lock().bundles.insert(id, bundle);
        id
    }

    /// Forgets a bundle together with every page it still has tracked
    pub fn forget_bundle(&self, id: BundleId) {
        let mut inner = self.inner.lock();
        inner.bundles.remove(&id);
        let stale: alloc::vec::Vec<PageKey> = inner.tracked.keys().filter(|key| key.bundle == id).copied().collect();
        for key in stale {
            if let Some(tracked) = inner.tracked.remove(&key) {
                inner.lru.remove(&tracked.stamp);
                inner.cached_size -= tracked.size;
            }
        }
    }

    /// Tracks a page as most recently used; bumps it if already tracked
    pub fn add_page(&self, key: PageKey, size: usize) {
        let mut inner = self.inner.lock();
        if inner.tracked.contains_key(&key) {
            drop(inner);
            self.bump_page(key);
            return;
        }
        let stamp = inner.stamp();
        inner.lru.insert(stamp, key);
        inner.tracked.insert(key, Tracked { stamp, size, state: ReclaimState::Cached });
        inner.cached_size += size;
    }

    /// Moves a page to the most recently used end
    ///
    /// A page that is being uncached is rescued back onto the list; its
    /// bundle will then fail [`finish_uncaching`](Self::finish_uncaching).
    pub fn bump_page(&self, key: PageKey) {
        let mut inner = self.inner.lock();
        let stamp = inner.stamp();
        let Some(tracked) = inner.tracked.get_mut(&key) else {
            return;
        };
        let old = core::mem::replace(&mut tracked.stamp, stamp);
        let was_cached = tracked.state == ReclaimState::Cached;
        tracked.state = ReclaimState::Cached;
        if was_cached {
            inner.lru.remove(&old);
        }
        inner.lru.insert(stamp, key);
    }

    /// Stops tracking a page (it was locked, dirtied or freed)
    pub fn remove_page(&self, key: PageKey) {
        let mut inner = self.inner.lock();
        if let Some(tracked) = inner.tracked.remove(&key) {
            if tracked.state == ReclaimState::Cached {
                inner.lru.remove(&tracked.stamp);
            }
            inner.cached_size -= tracked.size;
        }
    }

    /// Called by a bundle before it frees an uncached page
    ///
    /// Returns `false` if the page was rescued (or removed) in the meantime,
    /// in which case the bundle must keep it.
    pub fn finish_uncaching(&self, key: PageKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.tracked.get(&key) {
            Some(tracked) if tracked.state == ReclaimState::Uncaching => {
                let size = tracked.size;
                inner.tracked.remove(&key);
                inner.cached_size -= size;
                true
            }
            _ => false,
        }
    }

    /// Reclaim state of a page, `None` if it is not tracked
    pub fn reclaim_state(&self, key: PageKey) -> Option<ReclaimState> {
        self.inner.lock().tracked.get(&key).map(|tracked| tracked.state)
    }

    /// Bytes of tracked pages
    pub fn cached_size(&self) -> usize {
        self.inner.lock().cached_size
    }

    /// Snapshot of the bookkeeping
    pub fn stats(&self) -> ReclaimStats {
        let inner = self.inner.lock();
        ReclaimStats {
            cached_pages: inner.lru.len(),
            uncaching_pages: inner.tracked.len() - inner.lru.len(),
            cached_size: inner.cached_size,
            reclaimed_pages: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Checks whether physical memory use is above the watermark
    pub fn under_pressure(&self) -> bool {
        self.config.under_pressure(self.physical.used_pages(), self.physical.total_pages())
    }

    /// Picks the coldest page if reclaim is due and marks it as uncaching
    fn select_victim(&self) -> Option<(Arc<dyn CacheBundle>, usize)> {
        if self.config.disabled {
            return None;
        }
        let pressure = self.under_pressure();
        let mut inner = self.inner.lock();
        loop {
            if !pressure && inner.cached_size <= self.config.cache_floor {
                return None;
            }
            let (_, key) = inner.lru.pop_first()?;
            let bundle = inner.bundles.get(&key.bundle).and_then(Weak::upgrade);
            match bundle {
                Some(bundle) => {
                    if let Some(tracked) = inner.tracked.get_mut(&key) {
                        tracked.state = ReclaimState::Uncaching;
                    }
                    return Some((bundle, key.identity));
                }
                None => {
                    if let Some(tracked) = inner.tracked.remove(&key) {
                        inner.cached_size -= tracked.size;
                    }
                }
            }
        }
    }

    /// Runs one reclaim step; resolves to `true` if a page was freed
    pub async fn check_reclaim(&self) -> bool {
        let Some((bundle, identity)) = self.select_victim() else {
            return false;
        };
        let freed = bundle.uncache_page(identity).await;
        if freed {
            self.reclaimed.fetch_add(1, Ordering::Relaxed);
        }
        freed
    }

    /// Background loop; `sleep(ns)` suspends the task for the given time
    ///
    /// Returns after [`stop`](Self::stop) was called.
    pub async fn run<S>(self: Arc<Self>, mut sleep: S)
    where
        S: FnMut(u64) -> BoxFuture<'static, ()> + Send,
    {
        vm_info!("vm: reclaimer started");
        while !self.cancel.is_cancelled() {
            let pressure = self.under_pressure();
            #[cfg(feature = "log")]
            {
                let stats = self.stats();
                vm_debug!(
                    "vm: reclaim round, {} cached ({:#x} bytes), pressure: {}",
                    stats.cached_pages,
                    stats.cached_size,
                    pressure
                );
            }

            while !self.cancel.is_cancelled() && self.check_reclaim().await {}

            let interval = if pressure { self.config.pressure_interval_ns } else { self.config.interval_ns };
            sleep(interval).await;
        }
        vm_info!("vm: reclaimer stopped");
    }

    /// Asks the background loop to exit
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use nos_vm_api::testing::SimulatedPhysicalMemory;
    use nos_vm_api::{WorkQueue, PAGE_SIZE};

    struct RecordingBundle {
        reclaimer: Mutex<Option<Arc<MemoryReclaimer>>>,
        id: Mutex<Option<BundleId>>,
        uncached: Mutex<Vec<usize>>,
    }

    impl CacheBundle for RecordingBundle {
        fn uncache_page(self: Arc<Self>, identity: usize) -> BoxFuture<'static, bool> {
            Box::pin(async move {
                let reclaimer = self.reclaimer.lock().clone().unwrap();
                let bundle = self.id.lock().unwrap();
                let freed = reclaimer.finish_uncaching(PageKey { bundle, identity });
                if freed {
                    self.uncached.lock().push(identity);
                }
                freed
            })
        }
    }

    fn setup(config: ReclaimConfig) -> (Arc<MemoryReclaimer>, Arc<RecordingBundle>, BundleId) {
        let memory = Arc::new(SimulatedPhysicalMemory::new(16));
        let reclaimer = MemoryReclaimer::new(memory, config);
        let bundle = Arc::new(RecordingBundle {
            reclaimer: Mutex::new(Some(reclaimer.clone())),
            id: Mutex::new(None),
            uncached: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn CacheBundle> = Arc::downgrade(&(bundle.clone() as Arc<dyn CacheBundle>));
        let id = reclaimer.register_bundle(weak);
        *bundle.id.lock() = Some(id);
        (reclaimer, bundle, id)
    }

    fn no_floor() -> ReclaimConfig {
        ReclaimConfig { cache_floor: 0, ..ReclaimConfig::new() }
    }

    #[test]
    fn test_lru_order_and_bump() {
        let (reclaimer, bundle, id) = setup(no_floor());
        for identity in 0..3 {
            reclaimer.add_page(PageKey { bundle: id, identity }, PAGE_SIZE);
        }
        reclaimer.bump_page(PageKey { bundle: id, identity: 0 });
        assert_eq!(reclaimer.cached_size(), 3 * PAGE_SIZE);

        let wq = WorkQueue::new();
        let round = {
            let reclaimer = reclaimer.clone();
            wq.spawn(async move { (reclaimer.check_reclaim().await, reclaimer.check_reclaim().await) })
        };
        wq.run();
        assert_eq!(round.try_take(), Some((true, true)));
        assert_eq!(*bundle.uncached.lock(), [1, 2]);
        assert_eq!(reclaimer.cached_size(), PAGE_SIZE);
    }

    #[test]
    fn test_rescued_page_is_not_freed() {
        let (reclaimer, _bundle, id) = setup(no_floor());
        let key = PageKey { bundle: id, identity: 7 };
        reclaimer.add_page(key, PAGE_SIZE);

        let (_victim, identity) = reclaimer.select_victim().unwrap();
        assert_eq!(identity, 7);
        assert_eq!(reclaimer.reclaim_state(key), Some(ReclaimState::Uncaching));

        reclaimer.bump_page(key);
        assert_eq!(reclaimer.reclaim_state(key), Some(ReclaimState::Cached));
        assert!(!reclaimer.finish_uncaching(key));
        assert_eq!(reclaimer.stats().cached_pages, 1);
    }

    #[test]
    fn test_floor_and_disable() {
        let (reclaimer, _bundle, id) = setup(ReclaimConfig::new());
        reclaimer.add_page(PageKey { bundle: id, identity: 0 }, PAGE_SIZE);
        assert!(reclaimer.select_victim().is_none());

        let (disabled, _bundle, id) = setup(ReclaimConfig { disabled: true, ..no_floor() });
        disabled.add_page(PageKey { bundle: id, identity: 0 }, PAGE_SIZE);
        assert!(disabled.select_victim().is_none());
    }

    #[test]
    fn test_forget_bundle_drops_pages() {
        let (reclaimer, _bundle, id) = setup(no_floor());
        reclaimer.add_page(PageKey { bundle: id, identity: 1 }, PAGE_SIZE);
        reclaimer.add_page(PageKey { bundle: id, identity: 2 }, PAGE_SIZE);
        reclaimer.remove_page(PageKey { bundle: id, identity: 1 });
        assert_eq!(reclaimer.cached_size(), PAGE_SIZE);
        reclaimer.forget_bundle(id);
        assert_eq!(reclaimer.stats(), ReclaimStats::default());
    }

    #[test]
    fn test_run_stops() {
        let (reclaimer, _bundle, _id) = setup(ReclaimConfig::new());
        let wq = WorkQueue::new();
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let reclaimer = reclaimer.clone();
            let sleeps = sleeps.clone();
            wq.spawn(reclaimer.run(move |ns| {
                sleeps.lock().push(ns);
                Box::pin(core::future::ready(()))
            }))
        };
        reclaimer.stop();
        wq.run();
        assert!(task.is_finished());
        assert!(sleeps.lock().is_empty());
    }
}
