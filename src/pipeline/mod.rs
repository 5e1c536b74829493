//! Pipeline Orchestrator
//!
//! Runs capture, detection and OCR on separate threads connected by bounded
//! queues:
//!
//! ```text
//! capture -> [frames] -> detection -> [batches] -> ocr-dispatch -> [jobs] -> ocr-worker-N
//!                            |                                                  |
//!                            v                                                  v
//!                        [display]                                          [records]
//! ```
//!
//! Frames and display images are lossy (newest wins). Accepted records are
//! never dropped once the duplicate resolver took them.

pub mod budget;
pub mod metrics;
pub(crate) mod ocr_pool;
pub mod queue;
pub(crate) mod stages;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{AdaptiveTtl, FrameCache, RegionCache};
use crate::capture::{Frame, FrameSource};
use crate::config::AppConfig;
use crate::error::{PipelineError, RecordError};
use crate::records::{DuplicateResolver, RecordSummary, StructuredRecord};
use crate::vision::annotate::DisplayFrame;
use crate::vision::{Detector, HierarchicalResolver, TextRecognizer};

pub use metrics::StatsSnapshot;

use ocr_pool::{OcrDispatcher, OcrJob, OcrWorker, RecordSink};
use stages::{CaptureStage, DetectionBatch, DetectionStage, StageContext};

/// Lifecycle of a [`Pipeline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    StopRequested,
    Stopped,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::StopRequested => "stopping",
            PipelineState::Stopped => "stopped",
        }
    }
}

/// Receivers kept by the orchestrator to drain leftovers on stop
struct InternalQueues {
    frames: Receiver<Frame>,
    batches: Receiver<DetectionBatch>,
    jobs: Receiver<OcrJob>,
}

/// Multi-stage detection and OCR pipeline
pub struct Pipeline {
    config: AppConfig,
    state: PipelineState,
    source: Option<Box<dyn FrameSource>>,
    detector: Arc<dyn Detector>,
    recognizer: Arc<dyn TextRecognizer>,
    ctx: Arc<StageContext>,
    dedup: Arc<DuplicateResolver>,
    frame_cache: Option<Arc<FrameCache>>,
    region_cache: Option<Arc<RegionCache>>,
    threads: Vec<(String, JoinHandle<()>)>,
    queues: Option<InternalQueues>,
    record_tx: Sender<StructuredRecord>,
    record_rx: Receiver<StructuredRecord>,
    display_tx: Sender<DisplayFrame>,
    display_rx: Receiver<DisplayFrame>,
}

impl Pipeline {
    /// Create an idle pipeline. The configuration is validated here.
    pub fn new(
        config: AppConfig,
        source: impl FrameSource + 'static,
        detector: Arc<dyn Detector>,
        recognizer: Arc<dyn TextRecognizer>,
    ) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Config(format!("{e:#}")))?;

        let (record_tx, record_rx) = unbounded();
        let (display_tx, display_rx) = bounded(config.pipeline.display_queue_depth);
        let dedup = Arc::new(DuplicateResolver::new(&config.dedup, &config.hierarchy));
        let ctx = Arc::new(StageContext::new(config.pipeline.clone()));

        Ok(Self {
            config,
            state: PipelineState::Idle,
            source: Some(Box::new(source)),
            detector,
            recognizer,
            ctx,
            dedup,
            frame_cache: None,
            region_cache: None,
            threads: Vec::new(),
            queues: None,
            record_tx,
            record_rx,
            display_tx,
            display_rx,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Spawn every stage. Only allowed once, from `Idle`.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Idle {
            return Err(PipelineError::InvalidState {
                action: "start",
                state: self.state.as_str(),
            });
        }
        let source = self.source.take().ok_or(PipelineError::InvalidState {
            action: "start",
            state: "missing its frame source",
        })?;

        let settings = &self.config.pipeline;
        let profile = settings.profile();
        let workers = settings.worker_count();
        info!(
            "Starting pipeline: mode {:?}, {} OCR workers, frame skip {}, caches {}",
            settings.performance_mode,
            workers,
            profile.frame_skip,
            if profile.caches_enabled { "on" } else { "off" }
        );

        let cache_cfg = &self.config.cache;
        if profile.caches_enabled {
            self.frame_cache = Some(Arc::new(FrameCache::new(
                cache_cfg.frame_ttl(),
                cache_cfg.frame_similarity_tolerance,
            )));
            self.region_cache = Some(Arc::new(RegionCache::new(
                cache_cfg.region_ttl(),
                cache_cfg.region_position_tolerance,
                cache_cfg.region_capacity,
            )));
        }
        let adaptive_ttl = cache_cfg.adaptive_ttl.then(|| AdaptiveTtl {
            base: cache_cfg.frame_ttl(),
            min: std::time::Duration::from_millis(cache_cfg.frame_ttl_min_ms),
            max: std::time::Duration::from_millis(cache_cfg.frame_ttl_max_ms),
            reference_fps: cache_cfg.reference_fps,
        });

        let (frame_tx, frame_rx) = bounded(settings.frame_queue_depth);
        let (detection_tx, detection_rx) = bounded(settings.detection_queue_depth);
        let (job_tx, job_rx) = bounded(settings.ocr_job_capacity);
        self.queues = Some(InternalQueues {
            frames: frame_rx.clone(),
            batches: detection_rx.clone(),
            jobs: job_rx.clone(),
        });

        let capture = CaptureStage {
            source,
            frame_tx,
            frame_rx: frame_rx.clone(),
            ctx: Arc::clone(&self.ctx),
        };
        let detection = DetectionStage {
            detector: Arc::clone(&self.detector),
            resolver: HierarchicalResolver::new(&self.config.hierarchy),
            frame_cache: self.frame_cache.clone(),
            adaptive_ttl,
            confidence_threshold: self.config.detection.confidence_threshold,
            frame_skip: profile.frame_skip,
            max_records: profile.max_records_per_frame,
            frame_rx,
            detection_tx,
            display_tx: self.display_tx.clone(),
            display_rx: self.display_rx.clone(),
            ctx: Arc::clone(&self.ctx),
        };
        let sink = Arc::new(RecordSink {
            dedup: Arc::clone(&self.dedup),
            output: self.record_tx.clone(),
            ctx: Arc::clone(&self.ctx),
            item_image_dir: settings.item_image_dir.clone(),
        });
        let dispatcher = OcrDispatcher {
            detection_rx,
            job_tx,
            region_cache: self.region_cache.clone(),
            sink: Arc::clone(&sink),
        };

        let workers: Vec<OcrWorker> = (0..workers)
            .map(|id| OcrWorker {
                id,
                job_rx: job_rx.clone(),
                recognizer: Arc::clone(&self.recognizer),
                region_cache: self.region_cache.clone(),
                margin: self.config.ocr.margin,
                min_text_length: self.config.ocr.min_text_length,
                title_class: self.config.hierarchy.title_class.clone(),
                sink: Arc::clone(&sink),
            })
            .collect();

        self.state = PipelineState::Running;
        let result = self.spawn_stages(capture, detection, dispatcher, workers);

        if let Err(e) = result {
            warn!("Pipeline start failed: {}", e);
            self.stop()?;
            return Err(e);
        }

        info!("Pipeline running ({} threads)", self.threads.len());
        Ok(())
    }

    fn spawn_stages(
        &mut self,
        capture: CaptureStage,
        detection: DetectionStage,
        dispatcher: OcrDispatcher,
        workers: Vec<OcrWorker>,
    ) -> Result<(), PipelineError> {
        self.spawn("capture", move || capture.run())?;
        self.spawn("detection", move || detection.run())?;
        self.spawn("ocr-dispatch", move || dispatcher.run())?;
        for worker in workers {
            let name = format!("ocr-worker-{}", worker.id);
            self.spawn(&name, move || worker.run())?;
        }
        Ok(())
    }

    fn spawn<F>(&mut self, name: &str, body: F) -> Result<(), PipelineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|source| PipelineError::Spawn {
                stage: name.to_string(),
                source,
            })?;
        self.threads.push((name.to_string(), handle));
        Ok(())
    }

    /// Stop every stage and release resources.
    ///
    /// Idempotent: calls in any state other than `Running` return `Ok` without
    /// doing anything. Threads that miss the join deadline are detached.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Running {
            return Ok(());
        }
        self.state = PipelineState::StopRequested;
        info!("Stopping pipeline...");
        self.ctx.stop.store(true, Ordering::SeqCst);

        let timeout = self.config.pipeline.stop_timeout();
        let mut detached = 0;
        for (name, handle) in self.threads.drain(..) {
            if !queue::join_with_timeout(handle, &name, timeout) {
                detached += 1;
            }
        }
        if detached > 0 {
            warn!("{} thread(s) force-released", detached);
        }

        if let Some(queues) = self.queues.take() {
            let leftover = queue::drain(&queues.frames)
                + queue::drain(&queues.batches)
                + queue::drain(&queues.jobs);
            if leftover > 0 {
                info!("Discarded {} queued items", leftover);
            }
        }

        let stats = self.stats();
        let summary = self.dedup.summary();
        info!(
            "Pipeline stopped: {} frames captured, {} detector calls, {} OCR calls, {} records ({} OK), {} duplicates",
            stats.frames_captured,
            stats.detector_calls,
            stats.ocr_calls,
            summary.total,
            summary.ok,
            stats.duplicates
        );
        for (status, count) in &summary.errors {
            info!("  {}: {}", status, count);
        }

        // Entries go, hit counters stay readable through stats()
        if let Some(cache) = &self.frame_cache {
            cache.clear();
        }
        if let Some(cache) = &self.region_cache {
            if !cache.is_empty() {
                debug!("Clearing {} cached regions", cache.len());
            }
            cache.clear();
        }
        self.state = PipelineState::Stopped;
        Ok(())
    }

    /// True while running with every stage thread alive
    pub fn is_running(&self) -> bool {
        self.state == PipelineState::Running
            && !self.ctx.should_stop()
            && !self.threads.is_empty()
            && self.threads.iter().all(|(_, handle)| !handle.is_finished())
    }

    /// True when no frame, batch, region or record is waiting or in progress
    pub fn is_drained(&self) -> bool {
        let queues_empty = self
            .queues
            .as_ref()
            .map(|q| q.frames.is_empty() && q.batches.is_empty() && q.jobs.is_empty())
            .unwrap_or(true);
        queues_empty && self.ctx.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Accepted records, in acceptance order
    pub fn records(&self) -> Receiver<StructuredRecord> {
        self.record_rx.clone()
    }

    /// Annotated frames, newest kept when the consumer falls behind
    pub fn display_frames(&self) -> Receiver<DisplayFrame> {
        self.display_rx.clone()
    }

    /// The session's record store
    pub fn record_store(&self) -> Arc<DuplicateResolver> {
        Arc::clone(&self.dedup)
    }

    pub fn confirm_record(&self, id: Uuid) -> Result<(), RecordError> {
        self.dedup.confirm(id)
    }

    pub fn update_record_field(&self, id: Uuid, class: &str, value: &str) -> Result<(), RecordError> {
        self.dedup.update_field(id, class, value)
    }

    pub fn summary(&self) -> RecordSummary {
        self.dedup.summary()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let frame = self
            .frame_cache
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or_default();
        let region = self
            .region_cache
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or_default();
        self.ctx.stats.snapshot(frame, region)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::vision::{BBox, Detection};
    use anyhow::{anyhow, Result};
    use std::time::{Duration, Instant};

    const WIDTH: u32 = 120;
    const HEIGHT: u32 = 160;

    struct ScriptedDetector;

    impl Detector for ScriptedDetector {
        fn detect(&self, _frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
            let all = vec![
                Detection::new(BBox::new(0, 0, 120, 50), 0.95, "list-item"),
                Detection::new(BBox::new(0, 50, 120, 100), 0.95, "list-item"),
                Detection::new(BBox::new(0, 100, 120, 150), 0.9, "list-item"),
                Detection::new(BBox::new(5, 5, 100, 20), 0.9, "title"),
                Detection::new(BBox::new(5, 25, 100, 40), 0.9, "site_name"),
                Detection::new(BBox::new(5, 55, 100, 70), 0.9, "title"),
                Detection::new(BBox::new(5, 75, 100, 90), 0.2, "site_name"),
            ];
            Ok(all.into_iter().filter(|d| d.confidence >= threshold).collect())
        }
    }

    struct ScriptedOcr;

    impl TextRecognizer for ScriptedOcr {
        fn extract_text(&self, _frame: &Frame, bbox: &BBox, _margin: u32) -> String {
            match bbox.y1 {
                5 => "  Dune \n".to_string(),
                25 => "Shelf".to_string(),
                55 => "Overlord".to_string(),
                _ => String::new(),
            }
        }
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.pipeline.capture_interval_ms = 5;
        config.pipeline.queue_timeout_ms = 50;
        config.pipeline.enqueue_wait_ms = 200;
        config.pipeline.stop_timeout_ms = 1000;
        config
    }

    fn counting_source(frames: u64) -> impl FrameSource {
        let mut produced = 0;
        move || -> Result<Option<Frame>> {
            if produced >= frames {
                return Ok(None);
            }
            produced += 1;
            let data = vec![128; (WIDTH * HEIGHT * 4) as usize];
            Ok(Some(
                Frame::new(data, WIDTH, HEIGHT, PixelFormat::Rgba8).with_sequence(produced),
            ))
        }
    }

    fn pipeline(config: AppConfig, source: impl FrameSource + 'static) -> Pipeline {
        Pipeline::new(config, source, Arc::new(ScriptedDetector), Arc::new(ScriptedOcr)).unwrap()
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_double_stop_is_noop() {
        let mut p = pipeline(test_config(), counting_source(3));
        assert_eq!(p.state(), PipelineState::Idle);
        assert!(p.stop().is_ok());
        assert_eq!(p.state(), PipelineState::Idle);

        p.start().unwrap();
        assert!(p.is_running());

        p.stop().unwrap();
        assert_eq!(p.state(), PipelineState::Stopped);
        assert!(!p.is_running());
        p.stop().unwrap();
        assert_eq!(p.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_start_only_from_idle() {
        let mut p = pipeline(test_config(), counting_source(1));
        p.start().unwrap();
        assert!(matches!(
            p.start(),
            Err(PipelineError::InvalidState { action: "start", .. })
        ));
        p.stop().unwrap();
        assert!(p.start().is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.pipeline.frame_queue_depth = 0;
        let result = Pipeline::new(
            config,
            counting_source(1),
            Arc::new(ScriptedDetector),
            Arc::new(ScriptedOcr),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_end_to_end_deduplicates_repeated_frames() {
        let mut p = pipeline(test_config(), counting_source(20));
        let records = p.records();
        let display = p.display_frames();
        p.start().unwrap();

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.len() < 3 && Instant::now() < deadline {
            if let Ok(record) = records.recv_timeout(Duration::from_millis(100)) {
                received.push(record);
            }
        }

        assert!(wait_until(Duration::from_secs(5), || p.is_drained()
            && p.stats().frames_captured == 20));
        p.stop().unwrap();

        while let Ok(record) = records.try_recv() {
            received.push(record);
        }
        assert_eq!(received.len(), 3, "records: {received:?}");

        let dune = received.iter().find(|r| r.title() == "Dune").unwrap();
        assert_eq!(dune.attribute("site_name"), Some("Shelf"));
        assert_eq!(dune.error_status().to_string(), "missing_last_read_date");

        let overlord = received.iter().find(|r| r.title() == "Overlord").unwrap();
        assert_eq!(
            overlord.error_status().to_string(),
            "missing_last_read_date, missing_site_name"
        );

        // The bare third container is kept by its position
        assert!(received.iter().any(|r| r.title().is_empty()));

        let stats = p.stats();
        assert!(stats.duplicates > 0);
        assert!(stats.detector_calls >= 1);
        assert_eq!(p.summary().total, 3);
        assert!(display.try_recv().is_ok());
    }

    #[test]
    fn test_accurate_mode_runs_without_caches() {
        let mut config = test_config();
        config.pipeline.performance_mode = crate::config::PerformanceMode::Accurate;
        let mut p = pipeline(config, counting_source(4));
        let records = p.records();
        p.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            let stats = p.stats();
            stats.frames_captured == 4 && stats.detector_calls + stats.frames_dropped == 4
        }));
        assert!(wait_until(Duration::from_secs(5), || p.is_drained()));
        let stats = p.stats();
        p.stop().unwrap();

        assert_eq!(stats.frame_cache.hits + stats.frame_cache.misses, 0);
        assert_eq!(stats.region_cache.hits + stats.region_cache.misses, 0);
        assert_eq!(records.try_iter().count(), 3);
    }

    struct EmptyDetector;

    impl Detector for EmptyDetector {
        fn detect(&self, _frame: &Frame, _threshold: f32) -> Result<Vec<Detection>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_unfingerprintable_frames_still_reach_detector() {
        let mut produced = 0;
        let truncated = move || -> Result<Option<Frame>> {
            if produced >= 5 {
                return Ok(None);
            }
            produced += 1;
            // 20x20 RGBA needs 1600 bytes
            Ok(Some(
                Frame::new(vec![0; 100], 20, 20, PixelFormat::Rgba8).with_sequence(produced),
            ))
        };
        let mut p = Pipeline::new(
            test_config(),
            truncated,
            Arc::new(EmptyDetector),
            Arc::new(ScriptedOcr),
        )
        .unwrap();
        p.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            let stats = p.stats();
            stats.frames_captured == 5 && stats.detector_calls + stats.frames_dropped == 5
        }));
        assert!(p.is_running());
        let stats = p.stats();
        p.stop().unwrap();

        assert!(stats.detector_calls >= 1);
        assert_eq!(stats.stage_errors, 0);
        assert_eq!(stats.frame_cache.hits + stats.frame_cache.misses, 0);
    }

    #[test]
    fn test_fatal_source_errors_stop_pipeline() {
        let mut config = test_config();
        config.pipeline.capture_interval_ms = 1;
        let failing = || -> Result<Option<Frame>> { Err(anyhow!("device lost")) };
        let mut p = pipeline(config, failing);
        p.start().unwrap();

        assert!(wait_until(Duration::from_secs(3), || !p.is_running()));
        assert_eq!(p.state(), PipelineState::Running);
        assert!(p.stats().stage_errors >= 10);

        p.stop().unwrap();
        assert_eq!(p.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_edits_through_pipeline() {
        let mut p = pipeline(test_config(), counting_source(2));
        let records = p.records();
        p.start().unwrap();
        let first = records.recv_timeout(Duration::from_secs(5)).unwrap();
        p.stop().unwrap();

        p.update_record_field(first.id, "last_read_date", "2024-03-01").unwrap();
        p.confirm_record(first.id).unwrap();
        assert!(matches!(
            p.update_record_field(first.id, "title", "x"),
            Err(RecordError::Confirmed(_))
        ));
        assert!(p.record_store().get(first.id).unwrap().is_confirmed());
    }
}
