//! Hierarchical grouping of detections
//!
//! The detector emits a flat list: one container class (a whole list item) and
//! several attribute classes (its title, dates, ...). The model has no notion
//! of parent/child, so grouping is done here from box overlap alone.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::geometry::{containment, iou};
use super::{BBox, Detection};
use crate::config::HierarchySettings;
use crate::records::ErrorStatus;

/// How a container/attribute pair is scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMetric {
    /// Overlap relative to the attribute's own area
    #[default]
    Containment,
    /// Plain intersection over union
    Iou,
}

impl MatchMetric {
    pub fn score(self, container: &BBox, attribute: &BBox) -> f32 {
        match self {
            MatchMetric::Containment => containment(container, attribute),
            MatchMetric::Iou => iou(container, attribute),
        }
    }
}

/// One container with the attributes assigned to it
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedRecord {
    /// Frame-local identifier (`item_001`, ...)
    pub item_id: String,
    /// The container detection
    pub container: Detection,
    /// At most one detection per attribute class
    pub attributes: BTreeMap<String, Detection>,
}

impl GroupedRecord {
    pub fn new(item_id: impl Into<String>, container: Detection) -> Self {
        Self {
            item_id: item_id.into(),
            container,
            attributes: BTreeMap::new(),
        }
    }

    /// Assigned detection for a class
    pub fn attribute(&self, class: &str) -> Option<&Detection> {
        self.attributes.get(class)
    }

    /// Required classes with no assigned detection
    pub fn error_status(&self, required: &[String]) -> ErrorStatus {
        ErrorStatus::from_missing(
            required
                .iter()
                .filter(|class| !self.attributes.contains_key(class.as_str())),
        )
    }

    /// Number of attribute regions that need OCR
    pub fn region_count(&self) -> usize {
        self.attributes.len()
    }
}

/// Grouping result for one frame
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    /// One entry per container, in detection order
    pub records: Vec<GroupedRecord>,
    /// Attributes that matched no container
    pub orphans: Vec<Detection>,
}

impl Hierarchy {
    /// Orphan count per attribute class
    pub fn orphan_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for orphan in &self.orphans {
            *counts.entry(orphan.class_label.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Keep only the `max` top-most records
    pub fn truncate_top(&mut self, max: usize) {
        if self.records.len() <= max {
            return;
        }
        self.records
            .sort_by_key(|r| (r.container.bbox.y1, r.container.bbox.x1));
        self.records.truncate(max);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.orphans.is_empty()
    }
}

/// Assigns attribute detections to container detections
#[derive(Debug, Clone)]
pub struct HierarchicalResolver {
    container_class: String,
    attribute_classes: Vec<String>,
    threshold: f32,
    metric: MatchMetric,
}

impl HierarchicalResolver {
    pub fn new(settings: &HierarchySettings) -> Self {
        Self {
            container_class: settings.container_class.clone(),
            attribute_classes: settings.attribute_classes.clone(),
            threshold: settings.match_threshold,
            metric: settings.match_metric,
        }
    }

    /// Group one frame's (already confidence-filtered) detections.
    ///
    /// Per attribute class, every container/attribute pair scoring at least the
    /// threshold is a candidate. Candidates are accepted best score first, ties
    /// going to the earlier container and then the earlier attribute; a
    /// container takes one attribute per class and an attribute joins one
    /// container.
    pub fn resolve(&self, detections: &[Detection]) -> Hierarchy {
        let mut records = Vec::new();
        let mut pools: Vec<(&str, Vec<&Detection>)> = self
            .attribute_classes
            .iter()
            .map(|class| (class.as_str(), Vec::new()))
            .collect();

        for det in detections {
            if !det.bbox.is_valid() {
                warn!(
                    class = %det.class_label,
                    confidence = det.confidence,
                    bbox = %det.bbox,
                    "Dropping detection with invalid box"
                );
                continue;
            }

            if det.class_label == self.container_class {
                let item_id = format!("item_{:03}", records.len() + 1);
                records.push(GroupedRecord::new(item_id, det.clone()));
            } else if let Some((_, pool)) = pools
                .iter_mut()
                .find(|(class, _)| *class == det.class_label)
            {
                pool.push(det);
            } else {
                debug!("Ignoring detection of unknown class '{}'", det.class_label);
            }
        }

        let mut orphans = Vec::new();

        for (class, pool) in pools {
            if pool.is_empty() {
                continue;
            }

            let assigned = self.assign_class(class, &pool, &mut records);

            let mut class_orphans = 0;
            for (det, taken) in pool.into_iter().zip(assigned) {
                if taken {
                    continue;
                }
                warn!(
                    class = %det.class_label,
                    confidence = det.confidence,
                    bbox = %det.bbox,
                    "Orphaned attribute: no container above match threshold {}",
                    self.threshold
                );
                orphans.push(det.clone());
                class_orphans += 1;
            }

            if class_orphans > 0 {
                warn!("{}: {} orphaned attribute(s) in frame", class, class_orphans);
            }
        }

        Hierarchy { records, orphans }
    }

    /// Assign one class's pool; returns which pool entries were taken
    fn assign_class(
        &self,
        class: &str,
        pool: &[&Detection],
        records: &mut [GroupedRecord],
    ) -> Vec<bool> {
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (ci, record) in records.iter().enumerate() {
            for (ai, attr) in pool.iter().enumerate() {
                let score = self.metric.score(&record.container.bbox, &attr.bbox);
                if score > 0.0 && score >= self.threshold {
                    candidates.push((score, ci, ai));
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut taken = vec![false; pool.len()];
        for (score, ci, ai) in candidates {
            if taken[ai] || records[ci].attributes.contains_key(class) {
                continue;
            }
            taken[ai] = true;
            debug!(
                "Assigned {} {} to {} (score {:.3})",
                class, pool[ai].bbox, records[ci].item_id, score
            );
            records[ci]
                .attributes
                .insert(class.to_string(), pool[ai].clone());
        }
        taken
    }
}
