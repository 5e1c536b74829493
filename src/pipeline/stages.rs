//! Capture and detection stages

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::budget::ErrorBudget;
use super::metrics::{FpsCounter, PipelineStats};
use super::queue::{push_drop_oldest, PushOutcome};
use crate::cache::{AdaptiveTtl, FrameCache};
use crate::capture::{Frame, FrameSource};
use crate::config::PipelineSettings;
use crate::vision::annotate::{annotate, DisplayFrame};
use crate::vision::{sort_by_position, Detection, Detector, GroupedRecord, HierarchicalResolver};

/// State shared by every stage thread
pub(crate) struct StageContext {
    pub stop: AtomicBool,
    pub stats: PipelineStats,
    /// Detection batches and records handed off but not yet finished
    pub in_flight: AtomicUsize,
    pub settings: PipelineSettings,
}

impl StageContext {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            stop: AtomicBool::new(false),
            stats: PipelineStats::default(),
            in_flight: AtomicUsize::new(0),
            settings,
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn begin_work(&self, n: usize) {
        self.in_flight.fetch_add(n, Ordering::SeqCst);
    }

    pub fn end_work(&self, n: usize) {
        self.in_flight.fetch_sub(n, Ordering::SeqCst);
    }

    pub fn budget(&self, stage: &str) -> ErrorBudget {
        ErrorBudget::new(stage, self.settings.max_consecutive_errors)
    }
}

/// One frame's grouped records on their way to OCR
pub(crate) struct DetectionBatch {
    pub frame: Arc<Frame>,
    pub records: Vec<GroupedRecord>,
}

/// Pulls frames from the source into the frame queue
pub(crate) struct CaptureStage {
    pub source: Box<dyn FrameSource>,
    pub frame_tx: Sender<Frame>,
    pub frame_rx: Receiver<Frame>,
    pub ctx: Arc<StageContext>,
}

impl CaptureStage {
    pub fn run(mut self) {
        info!("Capture stage started");
        let interval = self.ctx.settings.capture_interval();
        let mut budget = self.ctx.budget("capture");

        while !self.ctx.should_stop() {
            let started = Instant::now();

            match self.source.next_frame() {
                Ok(Some(frame)) => {
                    budget.success();
                    PipelineStats::incr(&self.ctx.stats.frames_captured);
                    match push_drop_oldest(&self.frame_tx, &self.frame_rx, frame) {
                        PushOutcome::Sent => {}
                        PushOutcome::DroppedOldest => {
                            PipelineStats::incr(&self.ctx.stats.frames_dropped);
                            debug!("Frame queue full, dropped oldest frame");
                        }
                        PushOutcome::Disconnected => break,
                    }
                }
                Ok(None) => budget.success(),
                Err(e) => {
                    PipelineStats::incr(&self.ctx.stats.stage_errors);
                    if budget.failure(&format!("{e:#}"), &self.ctx.stop) {
                        break;
                    }
                }
            }

            if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
        info!("Capture stage stopped");
    }
}

/// Detection, grouping and display publishing
pub(crate) struct DetectionStage {
    pub detector: Arc<dyn Detector>,
    pub resolver: HierarchicalResolver,
    pub frame_cache: Option<Arc<FrameCache>>,
    pub adaptive_ttl: Option<AdaptiveTtl>,
    pub confidence_threshold: f32,
    pub frame_skip: u32,
    pub max_records: usize,
    pub frame_rx: Receiver<Frame>,
    pub detection_tx: Sender<DetectionBatch>,
    pub display_tx: Sender<DisplayFrame>,
    pub display_rx: Receiver<DisplayFrame>,
    pub ctx: Arc<StageContext>,
}

impl DetectionStage {
    pub fn run(self) {
        info!("Detection stage started");
        let timeout = self.ctx.settings.queue_timeout();
        let mut budget = self.ctx.budget("detection");
        let mut fps = FpsCounter::default();
        let mut received: u64 = 0;

        while !self.ctx.should_stop() {
            let frame = match self.frame_rx.recv_timeout(timeout) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            received += 1;
            if self.frame_skip > 1 && (received - 1) % self.frame_skip as u64 != 0 {
                PipelineStats::incr(&self.ctx.stats.frames_skipped);
                continue;
            }

            self.ctx.begin_work(1);
            let result = self.process(frame, &mut fps);
            if let Err(e) = result {
                self.ctx.end_work(1);
                PipelineStats::incr(&self.ctx.stats.stage_errors);
                if budget.failure(&format!("{e:#}"), &self.ctx.stop) {
                    break;
                }
            } else {
                budget.success();
            }
        }
        info!("Detection stage stopped");
    }

    /// Detect, group and hand off one frame.
    ///
    /// The caller has counted the frame as in flight; on success this either
    /// passes that count on with the batch or releases it.
    fn process(&self, frame: Frame, fps: &mut FpsCounter) -> Result<()> {
        let started = Instant::now();
        let mut detections = self.detect(&frame)?;
        sort_by_position(&mut detections);

        let mut hierarchy = self.resolver.resolve(&detections);
        if hierarchy.records.len() > self.max_records {
            debug!(
                "Keeping top {} of {} records",
                self.max_records,
                hierarchy.records.len()
            );
            hierarchy.truncate_top(self.max_records);
        }

        match annotate(&frame, &hierarchy) {
            Ok(display) => {
                push_drop_oldest(&self.display_tx, &self.display_rx, display);
            }
            Err(e) => warn!("Skipping display frame {}: {}", frame.sequence, e),
        }

        let rate = fps.tick();
        self.ctx.stats.set_detection_fps(rate);
        if let (Some(cache), Some(adaptive)) = (&self.frame_cache, &self.adaptive_ttl) {
            cache.set_ttl(adaptive.ttl_for(rate));
        }

        debug!(
            "Frame {}: {} detections, {} records in {:?}",
            frame.sequence,
            detections.len(),
            hierarchy.records.len(),
            started.elapsed()
        );

        if hierarchy.records.is_empty() {
            self.ctx.end_work(1);
            return Ok(());
        }

        let batch = DetectionBatch {
            frame: Arc::new(frame),
            records: hierarchy.records,
        };
        self.hand_off(batch, self.ctx.settings.enqueue_wait());
        Ok(())
    }

    fn hand_off(&self, batch: DetectionBatch, wait: Duration) {
        match self.detection_tx.send_timeout(batch, wait) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(batch)) => {
                warn!(
                    "Detection queue full for {:?}, dropping frame {} ({} records)",
                    wait,
                    batch.frame.sequence,
                    batch.records.len()
                );
                PipelineStats::incr(&self.ctx.stats.batches_dropped);
                self.ctx.end_work(1);
            }
            Err(SendTimeoutError::Disconnected(_)) => self.ctx.end_work(1),
        }
    }

    /// Detections for a frame, from the cache when the frame is unchanged
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let Some(cache) = &self.frame_cache else {
            return self.run_detector(frame);
        };

        match FrameCache::fingerprint(frame) {
            Ok(fingerprint) => {
                if let Some(cached) = cache.lookup(&fingerprint) {
                    return Ok(cached);
                }
                let detections = self.run_detector(frame)?;
                cache.store(fingerprint, detections.clone());
                Ok(detections)
            }
            Err(e) => {
                warn!("Frame cache unavailable, detecting directly: {}", e);
                self.run_detector(frame)
            }
        }
    }

    fn run_detector(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let started = Instant::now();
        let detections = self.detector.detect(frame, self.confidence_threshold)?;
        PipelineStats::incr(&self.ctx.stats.detector_calls);
        debug!(
            "Detector returned {} boxes in {:?}",
            detections.len(),
            started.elapsed()
        );
        Ok(detections)
    }
}
