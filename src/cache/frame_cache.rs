//! Frame similarity cache
//!
//! Holds the detections of the last frame that went through the detector,
//! together with a perceptual fingerprint of that frame. A new frame whose
//! fingerprint is close enough, and which arrives within the TTL, reuses those
//! detections instead of running the model again.

use image::imageops::{self, FilterType};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use super::CacheStats;
use crate::capture::Frame;
use crate::error::CacheError;
use crate::vision::Detection;

/// Fingerprint side length in pixels
const FINGERPRINT_SIZE: u32 = 64;
const FINGERPRINT_WORDS: usize = (FINGERPRINT_SIZE * FINGERPRINT_SIZE / 64) as usize;
const FINGERPRINT_BITS: u32 = FINGERPRINT_SIZE * FINGERPRINT_SIZE;

/// Mean-threshold bitmap of a 64x64 luma thumbnail
#[derive(Clone, PartialEq, Eq)]
pub struct Fingerprint {
    bits: [u64; FINGERPRINT_WORDS],
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({} bits set)", self.count_ones())
    }
}

impl Fingerprint {
    pub fn from_frame(frame: &Frame) -> Result<Self, CacheError> {
        let gray = frame.to_luma()?;
        let thumb = imageops::resize(&gray, FINGERPRINT_SIZE, FINGERPRINT_SIZE, FilterType::Triangle);

        let sum: u64 = thumb.pixels().map(|p| p.0[0] as u64).sum();
        let mean = sum / FINGERPRINT_BITS as u64;

        let mut bits = [0u64; FINGERPRINT_WORDS];
        for (i, pixel) in thumb.pixels().enumerate() {
            if pixel.0[0] as u64 > mean {
                bits[i / 64] |= 1u64 << (i % 64);
            }
        }
        Ok(Self { bits })
    }

    /// Fraction of bits that differ, in `[0, 1]`
    pub fn difference(&self, other: &Fingerprint) -> f32 {
        let differing: u32 = self
            .bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        differing as f32 / FINGERPRINT_BITS as f32
    }

    fn count_ones(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }
}

struct Slot {
    fingerprint: Fingerprint,
    detections: Vec<Detection>,
    stored_at: Instant,
}

struct Inner {
    slot: Option<Slot>,
    ttl: Duration,
    stats: CacheStats,
}

/// Single-slot detection cache keyed by frame appearance
pub struct FrameCache {
    inner: Mutex<Inner>,
    tolerance: f32,
}

impl FrameCache {
    /// `tolerance` is the largest fraction of differing fingerprint bits that
    /// still counts as the same frame (exclusive)
    pub fn new(ttl: Duration, tolerance: f32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slot: None,
                ttl,
                stats: CacheStats::default(),
            }),
            tolerance,
        }
    }

    /// Fingerprint a frame
    pub fn fingerprint(frame: &Frame) -> Result<Fingerprint, CacheError> {
        Fingerprint::from_frame(frame)
    }

    fn is_fresh(&self, inner: &Inner, fingerprint: &Fingerprint) -> bool {
        match &inner.slot {
            Some(slot) => {
                slot.stored_at.elapsed() <= inner.ttl
                    && slot.fingerprint.difference(fingerprint) < self.tolerance
            }
            None => false,
        }
    }

    /// True when the stored detections can stand in for this frame
    pub fn should_skip_detection(&self, frame: &Frame) -> Result<bool, CacheError> {
        let fingerprint = Fingerprint::from_frame(frame)?;
        let inner = self.inner.lock();
        Ok(self.is_fresh(&inner, &fingerprint))
    }

    /// Detections of the last genuine run, empty if there was none
    pub fn cached_detections(&self) -> Vec<Detection> {
        self.inner
            .lock()
            .slot
            .as_ref()
            .map(|slot| slot.detections.clone())
            .unwrap_or_default()
    }

    /// Skip check and read in one step; counts towards the hit rate
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Vec<Detection>> {
        let mut inner = self.inner.lock();
        let hit = self.is_fresh(&inner, fingerprint);
        inner.stats.record(hit);
        if !hit {
            return None;
        }
        let slot = inner.slot.as_ref()?;
        debug!(
            "Frame cache hit ({} detections, age {:?})",
            slot.detections.len(),
            slot.stored_at.elapsed()
        );
        Some(slot.detections.clone())
    }

    /// Replace the slot with a genuine detection result
    pub fn store(&self, fingerprint: Fingerprint, detections: Vec<Detection>) {
        self.inner.lock().slot = Some(Slot {
            fingerprint,
            detections,
            stored_at: Instant::now(),
        });
    }

    /// Fingerprint `frame` and replace the slot
    pub fn update(&self, frame: &Frame, detections: Vec<Detection>) -> Result<(), CacheError> {
        let fingerprint = Fingerprint::from_frame(frame)?;
        self.store(fingerprint, detections);
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        self.inner.lock().ttl
    }

    pub fn set_ttl(&self, ttl: Duration) {
        self.inner.lock().ttl = ttl;
    }

    pub fn clear(&self) {
        self.inner.lock().slot = None;
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

/// Maps measured throughput to a frame cache TTL.
///
/// At `reference_fps` the TTL equals the base; faster throughput shortens it,
/// slower throughput lengthens it, always within `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveTtl {
    pub base: Duration,
    pub min: Duration,
    pub max: Duration,
    pub reference_fps: f32,
}

impl AdaptiveTtl {
    pub fn ttl_for(&self, fps: f32) -> Duration {
        if !fps.is_finite() || fps <= 0.0 || self.reference_fps <= 0.0 {
            return self.base.clamp(self.min, self.max);
        }
        let scaled = self.base.as_secs_f32() * self.reference_fps / fps;
        Duration::from_secs_f32(scaled.min(self.max.as_secs_f32())).clamp(self.min, self.max)
    }
}
