//! Capacity-bounded LRU of parsed devices, keyed by hex device id.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::info::DeviceInfo;

/// Default number of devices kept
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// LRU cache of the latest record per device
#[derive(Debug)]
pub struct DeviceCache {
    entries: LruCache<String, DeviceInfo>,
    evictions: u64,
}

impl DeviceCache {
    /// Create a cache holding at most `capacity` devices (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            evictions: 0,
        }
    }

    /// Insert or refresh a device; returns the entry evicted to make room
    pub fn insert(&mut self, info: DeviceInfo) -> Option<DeviceInfo> {
        let key = info.hex_id();
        if self.entries.contains(&key) {
            self.entries.put(key, info);
            return None;
        }
        let evicted = self.entries.push(key, info).map(|(_, old)| old);
        if evicted.is_some() {
            self.evictions += 1;
        }
        evicted
    }

    /// Look up a device and mark it recently used
    pub fn get(&mut self, hex_id: &str) -> Option<&DeviceInfo> {
        self.entries.get(hex_id)
    }

    /// Look up a device without touching its recency
    pub fn peek(&self, hex_id: &str) -> Option<&DeviceInfo> {
        self.entries.peek(hex_id)
    }

    /// All cached devices, most recently used first
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.entries.iter().map(|(_, info)| info.clone()).collect()
    }

    /// Number of cached devices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of devices kept
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Entries evicted since creation
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

impl Default for DeviceCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
