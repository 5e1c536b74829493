//! Pipeline counters and throughput

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::cache::CacheStats;

/// Smoothed events-per-second estimate
#[derive(Debug, Clone)]
pub struct FpsCounter {
    estimate: f32,
    last: Option<Instant>,
    smoothing: f32,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl FpsCounter {
    /// `smoothing` is the weight of the newest sample (0.0 - 1.0)
    pub fn new(smoothing: f32) -> Self {
        Self {
            estimate: 0.0,
            last: None,
            smoothing: smoothing.clamp(0.01, 1.0),
        }
    }

    /// Register one event and return the updated estimate
    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> f32 {
        if let Some(last) = self.last {
            let dt = now.duration_since(last).as_secs_f32().max(0.001);
            let sample = 1.0 / dt;
            self.estimate = if self.estimate == 0.0 {
                sample
            } else {
                (1.0 - self.smoothing) * self.estimate + self.smoothing * sample
            };
        }
        self.last = Some(now);
        self.estimate
    }

    pub fn fps(&self) -> f32 {
        self.estimate
    }
}

/// Counters shared by all stages
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    /// Frames replaced in a full frame queue
    pub frames_dropped: AtomicU64,
    /// Frames passed over by frame skipping
    pub frames_skipped: AtomicU64,
    pub detector_calls: AtomicU64,
    /// Detection batches dropped on a full detection queue
    pub batches_dropped: AtomicU64,
    pub ocr_calls: AtomicU64,
    /// Regions dropped on a full job queue
    pub regions_dropped: AtomicU64,
    pub records_emitted: AtomicU64,
    pub duplicates: AtomicU64,
    pub stage_errors: AtomicU64,
    detection_fps_bits: AtomicU32,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_detection_fps(&self, fps: f32) {
        self.detection_fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn detection_fps(&self) -> f32 {
        f32::from_bits(self.detection_fps_bits.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self, frame_cache: CacheStats, region_cache: CacheStats) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: get(&self.frames_captured),
            frames_dropped: get(&self.frames_dropped),
            frames_skipped: get(&self.frames_skipped),
            detector_calls: get(&self.detector_calls),
            batches_dropped: get(&self.batches_dropped),
            ocr_calls: get(&self.ocr_calls),
            regions_dropped: get(&self.regions_dropped),
            records_emitted: get(&self.records_emitted),
            duplicates: get(&self.duplicates),
            stage_errors: get(&self.stage_errors),
            detection_fps: self.detection_fps(),
            frame_cache_hit_rate: frame_cache.hit_rate(),
            region_cache_hit_rate: region_cache.hit_rate(),
            frame_cache,
            region_cache,
        }
    }
}

/// Point-in-time copy of [`PipelineStats`] plus cache counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
    pub detector_calls: u64,
    pub batches_dropped: u64,
    pub ocr_calls: u64,
    pub regions_dropped: u64,
    pub records_emitted: u64,
    pub duplicates: u64,
    pub stage_errors: u64,
    pub detection_fps: f32,
    pub frame_cache: CacheStats,
    pub frame_cache_hit_rate: f32,
    pub region_cache: CacheStats,
    pub region_cache_hit_rate: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fps_counter_converges() {
        let mut fps = FpsCounter::new(0.5);
        let start = Instant::now();
        assert_eq!(fps.tick_at(start), 0.0);

        let mut now = start;
        for _ in 0..20 {
            now += Duration::from_millis(100);
            fps.tick_at(now);
        }
        assert!((fps.fps() - 10.0).abs() < 0.5, "fps was {}", fps.fps());
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let stats = PipelineStats::default();
        PipelineStats::incr(&stats.frames_captured);
        PipelineStats::add(&stats.ocr_calls, 3);
        stats.set_detection_fps(12.5);

        let snapshot = stats.snapshot(
            CacheStats { hits: 1, misses: 3 },
            CacheStats::default(),
        );
        assert_eq!(snapshot.frames_captured, 1);
        assert_eq!(snapshot.ocr_calls, 3);
        assert_eq!(snapshot.detection_fps, 12.5);
        assert!((snapshot.frame_cache_hit_rate - 0.25).abs() < 1e-6);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["frame_cache"]["hits"], 1);
    }
}
