use {
    anyhow::Result,
    lru::LruCache,
    parking_lot::Mutex,
    std::{collections::HashMap, num::NonZeroUsize, sync::Arc},
    tracing::debug,
};

/// Decoded blocks of one block volume, by block id.
#[derive(Debug, Default)]
pub struct VolumeBlocks(HashMap<String, Vec<u8>>);

impl VolumeBlocks {
    #[must_use]
    #[inline]
    pub fn new(blocks: HashMap<String, Vec<u8>>) -> Self {
        Self(blocks)
    }

    #[must_use]
    #[inline]
    pub fn get(&self, id: &str) -> Option<&[u8]> {
        self.0.get(id).map(Vec::as_slice)
    }

    #[inline]
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Least recently used cache of decoded volumes, keyed by volume name.
///
/// A volume is decoded at most once at a time: concurrent callers asking for the same
/// volume wait for the first one and then share its result.
pub struct VolumeCache {
    entries: Mutex<LruCache<String, Arc<VolumeBlocks>>>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VolumeCache {
    #[must_use]
    #[inline]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Holds as many volumes as fit into `max_bytes` if each is as large as the largest
    /// one, and at least one.
    #[must_use]
    #[inline]
    pub fn with_budget(max_bytes: u64, largest_volume: u64) -> Self {
        let count = max_bytes.checked_div(largest_volume).unwrap_or(1);
        let capacity = usize::try_from(count)
            .ok()
            .and_then(NonZeroUsize::new)
            .unwrap_or(NonZeroUsize::MIN);
        debug!(max_bytes, largest_volume, capacity, "volume cache");
        Self::new(capacity)
    }

    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Returns the cached volume or decodes it with `load`.
    #[inline]
    pub fn get_or_load(
        &self,
        name: &str,
        load: impl FnOnce() -> Result<VolumeBlocks>,
    ) -> Result<Arc<VolumeBlocks>> {
        if let Some(blocks) = self.cached(name) {
            return Ok(blocks);
        }
        let slot = Arc::clone(self.in_flight.lock().entry(name.to_owned()).or_default());
        let loading = slot.lock();
        if let Some(blocks) = self.cached(name) {
            return Ok(blocks);
        }
        debug!(name, "decoding volume");
        let result = load().map(Arc::new);
        if let Ok(blocks) = &result {
            self.entries.lock().put(name.to_owned(), Arc::clone(blocks));
        }
        self.in_flight.lock().remove(name);
        drop(loading);
        result
    }

    fn cached(&self, name: &str) -> Option<Arc<VolumeBlocks>> {
        self.entries.lock().get(name).cloned()
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {
        super::*,
        std::{
            sync::atomic::{AtomicU32, Ordering},
            thread,
            time::Duration,
        },
    };

    fn blocks(id: &str) -> VolumeBlocks {
        VolumeBlocks::new(HashMap::from([(id.to_owned(), b"data".to_vec())]))
    }

    #[test]
    fn budget() {
        assert_eq!(VolumeCache::with_budget(100, 30).capacity(), 3);
        assert_eq!(VolumeCache::with_budget(10, 30).capacity(), 1);
        assert_eq!(VolumeCache::with_budget(10, 0).capacity(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = VolumeCache::new(NonZeroUsize::new(2).unwrap());
        let loads = AtomicU32::new(0);
        let load = |name: &str| {
            cache
                .get_or_load(name, || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(blocks(name))
                })
                .unwrap()
        };
        load("a");
        load("b");
        load("a");
        load("c");
        assert_eq!(loads.load(Ordering::SeqCst), 3);
        load("a");
        assert_eq!(loads.load(Ordering::SeqCst), 3);
        load("b");
        assert_eq!(loads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn failed_load_is_not_cached() {
        let cache = VolumeCache::new(NonZeroUsize::MIN);
        cache
            .get_or_load("a", || anyhow::bail!("broken"))
            .unwrap_err();
        let blocks = cache.get_or_load("a", || Ok(blocks("x"))).unwrap();
        assert_eq!(blocks.get("x"), Some(&b"data"[..]));
    }

    #[test]
    fn one_load_in_flight() {
        let cache = VolumeCache::new(NonZeroUsize::new(4).unwrap());
        let loads = AtomicU32::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache
                        .get_or_load("v", || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(blocks("id"))
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
