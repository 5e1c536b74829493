//! Work-skipping caches
//!
//! - [`FrameCache`] reuses the last detection result while the screen is
//!   visually unchanged
//! - [`RegionCache`] reuses OCR text for regions that barely moved
//!
//! Both lock internally around whole check-and-update sequences and live from
//! pipeline start to stop.

pub mod frame_cache;
pub mod region_cache;

use serde::Serialize;

pub use frame_cache::{AdaptiveTtl, FrameCache, Fingerprint};
pub use region_cache::RegionCache;

/// Hit/miss counters of one cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Share of lookups that hit, 0.0 before the first lookup
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }

    pub(crate) fn record(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }
}
