//! OCR dispatch and worker pool
//!
//! The dispatcher splits each detection batch into one job per attribute
//! region, top of the screen first, and feeds a bounded job queue. Workers
//! read regions in parallel; the worker finishing the last region of a record
//! hands it to the duplicate resolver.

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::metrics::PipelineStats;
use super::stages::{DetectionBatch, StageContext};
use crate::cache::RegionCache;
use crate::capture::Frame;
use crate::records::text::cleanup_text;
use crate::records::{DuplicateResolver, StructuredRecord};
use crate::vision::{BBox, GroupedRecord, TextRecognizer};

/// Pixels kept around a container when saving its crop
const ITEM_IMAGE_MARGIN: u32 = 5;

/// Texts of one record collected across workers
struct RecordAssembly {
    record: GroupedRecord,
    frame: Arc<Frame>,
    texts: Mutex<BTreeMap<String, String>>,
    remaining: AtomicUsize,
    abandoned: AtomicBool,
}

impl RecordAssembly {
    fn new(record: GroupedRecord, frame: Arc<Frame>) -> Self {
        let regions = record.region_count();
        Self {
            record,
            frame,
            texts: Mutex::new(BTreeMap::new()),
            remaining: AtomicUsize::new(regions),
            abandoned: AtomicBool::new(false),
        }
    }

    /// Store a region's text; true for the last region of the record
    fn complete(&self, class: &str, text: String) -> bool {
        self.texts.lock().insert(class.to_string(), text);
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Give up on a region that never reached a worker
    fn abandon(&self) -> bool {
        self.abandoned.store(true, Ordering::SeqCst);
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

pub(crate) struct OcrJob {
    frame: Arc<Frame>,
    class: String,
    bbox: BBox,
    assembly: Arc<RecordAssembly>,
}

/// What dispatcher and workers need to finish a record
pub(crate) struct RecordSink {
    pub dedup: Arc<DuplicateResolver>,
    pub output: Sender<StructuredRecord>,
    pub ctx: Arc<StageContext>,
    /// Where accepted items' crops go, if anywhere
    pub item_image_dir: Option<PathBuf>,
}

impl RecordSink {
    /// Called exactly once per record, by whoever finished it last
    fn finish(&self, assembly: &RecordAssembly) {
        if assembly.abandoned.load(Ordering::SeqCst) {
            debug!("Discarding incomplete {}", assembly.record.item_id);
        } else {
            let texts = std::mem::take(&mut *assembly.texts.lock());
            self.emit(&assembly.record, &texts, &assembly.frame);
        }
        self.ctx.end_work(1);
    }

    fn emit(&self, record: &GroupedRecord, texts: &BTreeMap<String, String>, frame: &Frame) {
        match self.dedup.add_record(record, texts) {
            Some(mut accepted) => {
                PipelineStats::incr(&self.ctx.stats.records_emitted);
                if let Some(dir) = &self.item_image_dir {
                    if let Some(path) = save_item_image(dir, frame, record, accepted.id) {
                        if self.dedup.attach_image(accepted.id, path.clone()).is_ok() {
                            accepted.image_path = Some(path);
                        }
                    }
                }
                // Nothing accepted is dropped; a gone consumer only loses the copy
                let _ = self.output.send(accepted);
            }
            None => PipelineStats::incr(&self.ctx.stats.duplicates),
        }
    }
}

/// Save the container crop as `<dir>/<id>.png`; failures are logged and skipped
fn save_item_image(dir: &Path, frame: &Frame, record: &GroupedRecord, id: Uuid) -> Option<String> {
    let path = dir.join(format!("{id}.png"));
    let saved = frame
        .crop(&record.container.bbox, ITEM_IMAGE_MARGIN)
        .map_err(anyhow::Error::from)
        .and_then(|crop| -> anyhow::Result<()> {
            std::fs::create_dir_all(dir)?;
            crop.save(&path)?;
            Ok(())
        });

    match saved {
        Ok(()) => Some(path.display().to_string()),
        Err(e) => {
            warn!("Failed to save item image for {}: {:#}", record.item_id, e);
            None
        }
    }
}

pub(crate) struct OcrDispatcher {
    pub detection_rx: Receiver<DetectionBatch>,
    pub job_tx: Sender<OcrJob>,
    /// Swept for expired entries once per TTL
    pub region_cache: Option<Arc<RegionCache>>,
    pub sink: Arc<RecordSink>,
}

impl OcrDispatcher {
    pub fn run(self) {
        info!("OCR dispatcher started");
        let ctx = Arc::clone(&self.sink.ctx);
        let timeout = ctx.settings.queue_timeout();
        let mut last_sweep = Instant::now();

        while !ctx.should_stop() {
            match self.detection_rx.recv_timeout(timeout) {
                Ok(batch) => self.dispatch(batch),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if let Some(cache) = &self.region_cache {
                if last_sweep.elapsed() >= cache.ttl() {
                    let removed = cache.cleanup_expired();
                    if removed > 0 {
                        debug!(
                            "Region cache: removed {} expired entries, {} left",
                            removed,
                            cache.len()
                        );
                    }
                    last_sweep = Instant::now();
                }
            }
        }
        info!("OCR dispatcher stopped");
    }

    fn dispatch(&self, batch: DetectionBatch) {
        let ctx = &self.sink.ctx;
        let DetectionBatch { frame, records } = batch;

        // Records take over the batch's in-flight slot
        ctx.begin_work(records.len());
        ctx.end_work(1);

        let mut jobs = Vec::new();
        for record in records {
            if record.region_count() == 0 {
                self.sink.emit(&record, &BTreeMap::new(), &frame);
                ctx.end_work(1);
                continue;
            }
            let assembly = Arc::new(RecordAssembly::new(record, Arc::clone(&frame)));
            for (class, detection) in &assembly.record.attributes {
                jobs.push(OcrJob {
                    frame: Arc::clone(&frame),
                    class: class.clone(),
                    bbox: detection.bbox,
                    assembly: Arc::clone(&assembly),
                });
            }
        }

        jobs.sort_by_key(|job| (job.bbox.y1, job.bbox.x1));
        let wait = ctx.settings.enqueue_wait();
        let mut jobs = jobs.into_iter();

        while let Some(job) = jobs.next() {
            match self.job_tx.send_timeout(job, wait) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(job)) | Err(SendTimeoutError::Disconnected(job)) => {
                    let mut dropped = vec![job];
                    dropped.extend(jobs.by_ref());
                    warn!(
                        "OCR job queue unavailable, dropping {} regions of frame {}",
                        dropped.len(),
                        frame.sequence
                    );
                    PipelineStats::add(&ctx.stats.regions_dropped, dropped.len() as u64);
                    for job in dropped {
                        if job.assembly.abandon() {
                            self.sink.finish(&job.assembly);
                        }
                    }
                    break;
                }
            }
        }
    }
}

pub(crate) struct OcrWorker {
    pub id: usize,
    pub job_rx: Receiver<OcrJob>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub region_cache: Option<Arc<RegionCache>>,
    pub margin: u32,
    pub min_text_length: usize,
    pub title_class: String,
    pub sink: Arc<RecordSink>,
}

impl OcrWorker {
    pub fn run(self) {
        debug!("OCR worker {} started", self.id);
        let ctx = Arc::clone(&self.sink.ctx);
        let timeout = ctx.settings.queue_timeout();
        let mut budget = ctx.budget(&format!("ocr-worker-{}", self.id));

        while !ctx.should_stop() {
            let job = match self.job_rx.recv_timeout(timeout) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let text = match job.frame.validate() {
                Ok(()) => {
                    budget.success();
                    self.read_region(&job)
                }
                Err(e) => {
                    PipelineStats::incr(&ctx.stats.stage_errors);
                    let fatal = budget.failure(&e, &ctx.stop);
                    if job.assembly.abandon() {
                        self.sink.finish(&job.assembly);
                    }
                    if fatal {
                        break;
                    }
                    continue;
                }
            };

            if job.assembly.complete(&job.class, text) {
                self.sink.finish(&job.assembly);
            }
        }
        debug!("OCR worker {} stopped", self.id);
    }

    fn read_region(&self, job: &OcrJob) -> String {
        if let Some(cache) = &self.region_cache {
            if let Some(text) = cache.cached_text(&job.bbox) {
                return text;
            }
        }

        let started = Instant::now();
        let raw = self
            .recognizer
            .extract_text(&job.frame, &job.bbox, self.margin);
        PipelineStats::incr(&self.sink.ctx.stats.ocr_calls);

        let single_line = job.class == self.title_class;
        let text = cleanup_text(&raw, single_line, self.min_text_length);
        debug!(
            "OCR {} at {}: '{}' in {:?}",
            job.class,
            job.bbox,
            text,
            started.elapsed()
        );

        if let Some(cache) = &self.region_cache {
            cache.update(&job.bbox, &text);
        }
        text
    }
}
