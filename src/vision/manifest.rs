//! Recorded detections and OCR results for replay
//!
//! A manifest maps image file names to what the detector and the OCR engine
//! returned for them, so a captured session can be pushed through the pipeline
//! again without either model.
//!
//! ```json
//! {
//!   "frames": {
//!     "0001.png": {
//!       "detections": [
//!         { "bbox": { "x1": 0, "y1": 0, "x2": 400, "y2": 90 }, "confidence": 0.93, "class": "list-item" }
//!       ],
//!       "texts": [
//!         { "bbox": { "x1": 12, "y1": 8, "x2": 300, "y2": 30 }, "text": "Dune" }
//!       ]
//!     }
//!   }
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::{BBox, Detection, Detector, TextRecognizer};
use crate::capture::Frame;

/// Pixels a requested region may differ from the recorded one per edge
const TEXT_MATCH_TOLERANCE: i32 = 4;

/// OCR result recorded for one region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedText {
    pub bbox: BBox,
    pub text: String,
}

/// Everything recorded for one image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestFrame {
    pub detections: Vec<Detection>,
    pub texts: Vec<RecordedText>,
}

/// Replay detector and text recognizer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    frames: HashMap<String, ManifestFrame>,
    /// Playback order; frame sequence numbers index into it
    #[serde(skip)]
    order: Vec<String>,
}

impl Manifest {
    /// Load a manifest from JSON
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
        info!("Loaded manifest with {} frames", manifest.frames.len());
        Ok(manifest)
    }

    /// Set the playback order used to map frame sequence numbers to files
    pub fn with_order(mut self, order: Vec<String>) -> Self {
        self.order = order;
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn entry_for(&self, frame: &Frame) -> Result<Option<&ManifestFrame>> {
        if self.order.is_empty() {
            return Err(anyhow!("manifest has no playback order"));
        }
        let name = &self.order[frame.sequence as usize % self.order.len()];
        Ok(self.frames.get(name))
    }
}

impl Detector for Manifest {
    fn detect(&self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let Some(entry) = self.entry_for(frame)? else {
            debug!("No manifest entry for frame {}", frame.sequence);
            return Ok(Vec::new());
        };
        Ok(entry
            .detections
            .iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .cloned()
            .collect())
    }
}

impl TextRecognizer for Manifest {
    fn extract_text(&self, frame: &Frame, bbox: &BBox, _margin: u32) -> String {
        let entry = match self.entry_for(frame) {
            Ok(Some(entry)) => entry,
            _ => return String::new(),
        };
        entry
            .texts
            .iter()
            .find(|t| t.bbox.within_tolerance(bbox, TEXT_MATCH_TOLERANCE))
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }
}
