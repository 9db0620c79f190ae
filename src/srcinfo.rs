use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

pub const DEFAULT_CAPACITY: usize = 65536;
const SHARDS: usize = 16;
const READ_LOCK_TIMEOUT: Duration = Duration::from_millis(2);

/// 远端端点在包里的位置：入站时是源地址，出站时是目的地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowSide {
    Source,
    Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub addr: IpAddr,
    pub port: u16,
    pub side: FlowSide,
}

impl FlowKey {
    pub fn new(addr: IpAddr, port: u16, side: FlowSide) -> Self {
        Self { addr, port, side }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfoEntry {
    pub ttl: u8,
    pub hwaddr: [u8; 6],
}

/// Per-endpoint TTL and next-hop MAC learned from traffic the dispatcher
/// already sees. Sharded LRU; eviction is by last update, reads do not
/// refresh an entry.
pub struct FlowCache {
    shards: Box<[Mutex<LruCache<FlowKey, SourceInfoEntry>>]>,
    // 每个网卡最近一次入站帧的源 MAC，出站新流没有条目时用
    next_hops: RwLock<HashMap<u32, [u8; 6]>>,
}

impl FlowCache {
    pub fn new(capacity: usize) -> Self {
        let shard_count = SHARDS.min(capacity.max(1));
        let per_shard = capacity.max(1).div_ceil(shard_count);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self {
            shards,
            next_hops: RwLock::new(HashMap::new()),
        }
    }

    fn shard(&self, key: &FlowKey) -> &Mutex<LruCache<FlowKey, SourceInfoEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    pub fn put(&self, key: FlowKey, ttl: u8, hwaddr: [u8; 6]) {
        // put 会把 key 移到最新，满了就挤掉最久没更新的
        self.shard(&key).lock().put(key, SourceInfoEntry { ttl, hwaddr });
    }

    /// Returns a copy of the latest entry. A shard that stays contended past
    /// a short bound reads as a miss.
    pub fn get(&self, key: &FlowKey) -> Option<SourceInfoEntry> {
        let shard = self.shard(key).try_lock_for(READ_LOCK_TIMEOUT)?;
        shard.peek(key).copied()
    }

    pub fn put_next_hop(&self, ifindex: u32, hwaddr: [u8; 6]) {
        if self.next_hops.read().get(&ifindex) == Some(&hwaddr) {
            return;
        }
        self.next_hops.write().insert(ifindex, hwaddr);
    }

    /// Last link-layer source seen arriving on `ifindex`.
    pub fn next_hop(&self, ifindex: u32) -> Option<[u8; 6]> {
        self.next_hops.read().get(&ifindex).copied()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.lock().cap().get()).sum()
    }
}

impl Default for FlowCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
