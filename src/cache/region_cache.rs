//! Region text cache
//!
//! OCR is the slowest step per item. While a list is scrolled slowly or not at
//! all, the same region shows up in consecutive frames a few pixels apart, so
//! its text is reused until the entry expires.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::CacheStats;
use crate::vision::BBox;

struct Entry {
    bbox: BBox,
    text: String,
    stored_at: Instant,
}

struct Inner {
    entries: HashMap<BBox, Entry>,
    stats: CacheStats,
}

/// Bounded map from approximate region position to recognized text
pub struct RegionCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    tolerance: i32,
    capacity: usize,
}

impl RegionCache {
    pub fn new(ttl: Duration, tolerance: u32, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            ttl,
            tolerance: tolerance.max(1) as i32,
            capacity: capacity.max(1),
        }
    }

    /// Each edge floored to a multiple of the tolerance
    fn quantize(&self, bbox: &BBox) -> BBox {
        let t = self.tolerance as i64;
        let q = |v: i32| ((v as i64).div_euclid(t) * t).max(i32::MIN as i64) as i32;
        BBox::new(q(bbox.x1), q(bbox.y1), q(bbox.x2), q(bbox.y2))
    }

    /// Text of a live entry within tolerance of `bbox` on every edge.
    ///
    /// Expired entries are evicted on the way. When several entries qualify the
    /// closest one wins.
    pub fn cached_text(&self, bbox: &BBox) -> Option<String> {
        let mut inner = self.inner.lock();
        let ttl = self.ttl;
        inner.entries.retain(|_, e| e.stored_at.elapsed() <= ttl);

        let text = inner
            .entries
            .values()
            .filter(|e| e.bbox.within_tolerance(bbox, self.tolerance))
            .min_by_key(|e| edge_distance(&e.bbox, bbox))
            .map(|e| e.text.clone());

        inner.stats.record(text.is_some());
        if text.is_some() {
            debug!("Region cache hit at {}", bbox);
        }
        text
    }

    /// Store text for a region. Blank text is not cached.
    pub fn update(&self, bbox: &BBox, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let key = self.quantize(bbox);
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(
            key,
            Entry {
                bbox: *bbox,
                text: text.to_string(),
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        let ttl = self.ttl;
        inner.entries.retain(|_, e| e.stored_at.elapsed() <= ttl);
        before - inner.entries.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

fn edge_distance(a: &BBox, b: &BBox) -> i64 {
    [(a.x1, b.x1), (a.y1, b.y1), (a.x2, b.x2), (a.y2, b.y2)]
        .iter()
        .map(|(p, q)| (*p as i64 - *q as i64).abs())
        .sum()
}
