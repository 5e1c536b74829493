//! Application Configuration
//!
//! Pipeline settings stored in TOML format. Every section falls back to its
//! defaults, so a config file only needs the keys it changes.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::vision::MatchMetric;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Detector settings
    pub detection: DetectionSettings,
    /// Container/attribute grouping
    pub hierarchy: HierarchySettings,
    /// Duplicate filtering
    pub dedup: DedupSettings,
    /// Frame and region caches
    pub cache: CacheSettings,
    /// Text extraction
    pub ocr: OcrSettings,
    /// Threads, queues and timeouts
    pub pipeline: PipelineSettings,
}

/// Detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Minimum confidence passed to the detector (0.0 - 1.0)
    pub confidence_threshold: f32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
        }
    }
}

/// Which classes form a record and how they are matched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchySettings {
    /// Class of the whole list item
    pub container_class: String,
    /// Classes grouped under a container
    pub attribute_classes: Vec<String>,
    /// Attribute classes whose absence marks the record as incomplete
    pub required_classes: Vec<String>,
    /// Attribute class used as the record title and duplicate key
    pub title_class: String,
    /// Minimum match score for an attribute to join a container
    pub match_threshold: f32,
    /// Scoring used for the match
    pub match_metric: MatchMetric,
}

impl Default for HierarchySettings {
    fn default() -> Self {
        Self {
            container_class: "list-item".to_string(),
            attribute_classes: vec![
                "title".to_string(),
                "progress".to_string(),
                "last_read_date".to_string(),
                "site_name".to_string(),
            ],
            required_classes: vec![
                "title".to_string(),
                "last_read_date".to_string(),
                "site_name".to_string(),
            ],
            title_class: "title".to_string(),
            match_threshold: 0.5,
            match_metric: MatchMetric::Containment,
        }
    }
}

/// Duplicate filtering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    /// Title similarity at or above which a record is a duplicate
    pub similarity_threshold: f32,
    /// Grid size in pixels for the position key of untitled records
    pub position_grid: u32,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            position_grid: 20,
        }
    }
}

/// Frame and region cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Base lifetime of cached detections
    pub frame_ttl_ms: u64,
    /// Fraction of fingerprint bits that may differ for a frame to count as unchanged
    pub frame_similarity_tolerance: f32,
    /// Scale the frame TTL with measured throughput
    pub adaptive_ttl: bool,
    pub frame_ttl_min_ms: u64,
    pub frame_ttl_max_ms: u64,
    /// Throughput at which the adaptive TTL equals the base TTL
    pub reference_fps: f32,
    /// Lifetime of cached region text
    pub region_ttl_ms: u64,
    /// Per-edge pixel tolerance for region reuse
    pub region_position_tolerance: u32,
    /// Maximum cached regions
    pub region_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            frame_ttl_ms: 500,
            frame_similarity_tolerance: 0.05,
            adaptive_ttl: true,
            frame_ttl_min_ms: 200,
            frame_ttl_max_ms: 1500,
            reference_fps: 15.0,
            region_ttl_ms: 2000,
            region_position_tolerance: 10,
            region_capacity: 256,
        }
    }
}

impl CacheSettings {
    pub fn frame_ttl(&self) -> Duration {
        Duration::from_millis(self.frame_ttl_ms)
    }

    pub fn region_ttl(&self) -> Duration {
        Duration::from_millis(self.region_ttl_ms)
    }
}

/// Text extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Pixels added around each region before reading
    pub margin: u32,
    /// Shorter results are treated as noise
    pub min_text_length: usize,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            margin: 5,
            min_text_length: 3,
        }
    }
}

/// Speed/accuracy preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    Fast,
    #[default]
    Balanced,
    Accurate,
}

/// Values a [`PerformanceMode`] stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceProfile {
    /// Run detection on every Nth frame
    pub frame_skip: u32,
    pub caches_enabled: bool,
    pub ocr_workers: usize,
    /// Records kept per frame, top-most first
    pub max_records_per_frame: usize,
}

impl PerformanceMode {
    pub fn profile(self) -> PerformanceProfile {
        match self {
            PerformanceMode::Fast => PerformanceProfile {
                frame_skip: 2,
                caches_enabled: true,
                ocr_workers: 6,
                max_records_per_frame: 8,
            },
            PerformanceMode::Balanced => PerformanceProfile {
                frame_skip: 1,
                caches_enabled: true,
                ocr_workers: 4,
                max_records_per_frame: 12,
            },
            PerformanceMode::Accurate => PerformanceProfile {
                frame_skip: 1,
                caches_enabled: false,
                ocr_workers: 3,
                max_records_per_frame: 20,
            },
        }
    }
}

impl std::str::FromStr for PerformanceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(PerformanceMode::Fast),
            "balanced" => Ok(PerformanceMode::Balanced),
            "accurate" => Ok(PerformanceMode::Accurate),
            other => bail!("unknown performance mode '{other}' (expected fast, balanced or accurate)"),
        }
    }
}

/// Threads, queues and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub performance_mode: PerformanceMode,
    /// Overrides the worker count of the performance mode
    pub ocr_workers: Option<usize>,
    /// Capture to detection queue (drop-oldest)
    pub frame_queue_depth: usize,
    /// Detection to OCR queue (bounded wait, then drop)
    pub detection_queue_depth: usize,
    /// Annotated frames for display (drop-oldest)
    pub display_queue_depth: usize,
    /// Regions waiting for an OCR worker
    pub ocr_job_capacity: usize,
    /// How long a stage waits for input before rechecking the stop flag
    pub queue_timeout_ms: u64,
    /// How long a stage waits on a full downstream queue before dropping
    pub enqueue_wait_ms: u64,
    /// Per-thread join deadline on stop
    pub stop_timeout_ms: u64,
    /// Consecutive failures after which a stage gives up
    pub max_consecutive_errors: u32,
    /// Pause between capture attempts
    pub capture_interval_ms: u64,
    /// Save a crop of every accepted item here and record its path
    pub item_image_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            performance_mode: PerformanceMode::Balanced,
            ocr_workers: None,
            frame_queue_depth: 2,
            detection_queue_depth: 5,
            display_queue_depth: 2,
            ocr_job_capacity: 64,
            queue_timeout_ms: 1000,
            enqueue_wait_ms: 1000,
            stop_timeout_ms: 2000,
            max_consecutive_errors: 10,
            capture_interval_ms: 33,
            item_image_dir: None,
        }
    }
}

impl PipelineSettings {
    pub fn profile(&self) -> PerformanceProfile {
        self.performance_mode.profile()
    }

    /// Worker count after applying the override
    pub fn worker_count(&self) -> usize {
        self.ocr_workers.unwrap_or(self.profile().ocr_workers).max(1)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }
}

impl AppConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                bail!("{name} must be within 0.0..=1.0, got {v}");
            }
            Ok(())
        };
        unit("detection.confidence_threshold", self.detection.confidence_threshold)?;
        unit("hierarchy.match_threshold", self.hierarchy.match_threshold)?;
        unit("dedup.similarity_threshold", self.dedup.similarity_threshold)?;
        unit(
            "cache.frame_similarity_tolerance",
            self.cache.frame_similarity_tolerance,
        )?;

        let h = &self.hierarchy;
        if h.container_class.is_empty() {
            bail!("hierarchy.container_class must not be empty");
        }
        if h.attribute_classes.contains(&h.container_class) {
            bail!("hierarchy.container_class cannot also be an attribute class");
        }
        if !h.attribute_classes.contains(&h.title_class) {
            bail!(
                "hierarchy.title_class '{}' is not one of the attribute classes",
                h.title_class
            );
        }
        if let Some(class) = h
            .required_classes
            .iter()
            .find(|c| !h.attribute_classes.contains(*c))
        {
            bail!("required class '{class}' is not one of the attribute classes");
        }

        let c = &self.cache;
        if c.frame_ttl_min_ms > c.frame_ttl_max_ms {
            bail!("cache.frame_ttl_min_ms must not exceed cache.frame_ttl_max_ms");
        }
        if c.reference_fps <= 0.0 {
            bail!("cache.reference_fps must be positive");
        }
        if c.region_capacity == 0 {
            bail!("cache.region_capacity must be at least 1");
        }

        let p = &self.pipeline;
        for (name, depth) in [
            ("pipeline.frame_queue_depth", p.frame_queue_depth),
            ("pipeline.detection_queue_depth", p.detection_queue_depth),
            ("pipeline.display_queue_depth", p.display_queue_depth),
            ("pipeline.ocr_job_capacity", p.ocr_job_capacity),
        ] {
            if depth == 0 {
                bail!("{name} must be at least 1");
            }
        }
        if p.ocr_workers == Some(0) {
            bail!("pipeline.ocr_workers must be at least 1");
        }
        if p.max_consecutive_errors == 0 {
            bail!("pipeline.max_consecutive_errors must be at least 1");
        }
        Ok(())
    }
}

/// Default config file location (`<config dir>/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "hier-ocr").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    Ok(config)
}

/// Load from `path`, or from the default location when it exists, else defaults
pub fn load_or_default(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => load_config(path),
        None => match default_config_path() {
            Some(path) if path.exists() => load_config(&path),
            _ => Ok(AppConfig::default()),
        },
    }
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config {}", path.display()))?;
    Ok(())
}
