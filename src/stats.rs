use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::info;

// ==========================================
// 计数器：各 worker 共享，只做原子加
// ==========================================
#[derive(Debug, Default)]
pub struct Stats {
    pub packets: AtomicU64,
    pub marked: AtomicU64,
    pub parse_errors: AtomicU64,
    pub decoys_sent: AtomicU64,
    pub decoys_failed: AtomicU64,
    pub decoys_skipped: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub packets: u64,
    pub marked: u64,
    pub parse_errors: u64,
    pub decoys_sent: u64,
    pub decoys_failed: u64,
    pub decoys_skipped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl Stats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Snapshot {
            packets: load(&self.packets),
            marked: load(&self.marked),
            parse_errors: load(&self.parse_errors),
            decoys_sent: load(&self.decoys_sent),
            decoys_failed: load(&self.decoys_failed),
            decoys_skipped: load(&self.decoys_skipped),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
        }
    }
}

impl Snapshot {
    fn delta(&self, prev: &Snapshot) -> Snapshot {
        Snapshot {
            packets: self.packets - prev.packets,
            marked: self.marked - prev.marked,
            parse_errors: self.parse_errors - prev.parse_errors,
            decoys_sent: self.decoys_sent - prev.decoys_sent,
            decoys_failed: self.decoys_failed - prev.decoys_failed,
            decoys_skipped: self.decoys_skipped - prev.decoys_skipped,
            cache_hits: self.cache_hits - prev.cache_hits,
            cache_misses: self.cache_misses - prev.cache_misses,
        }
    }
}

// ==========================================
// 周期报表：只打印区间增量
// ==========================================
pub struct Reporter {
    interval: Duration,
    last_at: Instant,
    last: Snapshot,
}

impl Reporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_at: Instant::now(),
            last: Snapshot::default(),
        }
    }

    /// Logs one line when the interval has elapsed. Returns the delta that was
    /// reported, if any.
    pub fn tick(&mut self, stats: &Stats) -> Option<Snapshot> {
        if self.interval.is_zero() {
            return None;
        }
        let elapsed = self.last_at.elapsed();
        if elapsed < self.interval {
            return None;
        }

        let now = stats.snapshot();
        let d = now.delta(&self.last);
        info!(
            "{:.0}s: pkts={} marked={} bad={} decoys sent={} failed={} skipped={} cache hit/miss={}/{}",
            elapsed.as_secs_f64(),
            d.packets,
            d.marked,
            d.parse_errors,
            d.decoys_sent,
            d.decoys_failed,
            d.decoys_skipped,
            d.cache_hits,
            d.cache_misses,
        );
        self.last_at = Instant::now();
        self.last = now;
        Some(d)
    }
}
