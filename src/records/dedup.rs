//! Fuzzy duplicate filtering and the session record store
//!
//! The same list item is seen in many consecutive frames and OCR rarely reads
//! it identically twice, so exact matching would store it over and over.
//! Titles are compared with [`text_similarity`]; items without a readable
//! title fall back to their on-screen position.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use super::text::text_similarity;
use super::StructuredRecord;
use crate::config::{DedupSettings, HierarchySettings};
use crate::error::RecordError;
use crate::vision::{BBox, GroupedRecord};

/// Totals over the accepted records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordSummary {
    pub total: usize,
    pub ok: usize,
    /// Record count per non-OK error status
    pub errors: BTreeMap<String, usize>,
}

#[derive(Default)]
struct RecordStore {
    records: Vec<StructuredRecord>,
    position_keys: HashSet<String>,
}

impl RecordStore {
    fn find_mut(&mut self, id: Uuid) -> Result<&mut StructuredRecord, RecordError> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(RecordError::NotFound(id))
    }
}

/// Accepts new records and rejects near-duplicates of accepted ones
pub struct DuplicateResolver {
    store: Mutex<RecordStore>,
    similarity_threshold: f32,
    position_grid: i32,
    title_class: String,
    required: Vec<String>,
}

impl DuplicateResolver {
    pub fn new(dedup: &DedupSettings, hierarchy: &HierarchySettings) -> Self {
        Self {
            store: Mutex::new(RecordStore::default()),
            similarity_threshold: dedup.similarity_threshold,
            position_grid: dedup.position_grid.max(1) as i32,
            title_class: hierarchy.title_class.clone(),
            required: hierarchy.required_classes.clone(),
        }
    }

    /// True when `title` is at least as similar as the threshold to any
    /// accepted title. Blank titles are never duplicates by text.
    pub fn is_duplicate(&self, title: &str) -> bool {
        let store = self.store.lock();
        self.find_similar(&store, title).is_some()
    }

    fn find_similar<'a>(&self, store: &'a RecordStore, title: &str) -> Option<(&'a str, f32)> {
        if title.trim().is_empty() {
            return None;
        }

        for existing in store.records.iter().map(|r| r.title()) {
            if existing.is_empty() {
                continue;
            }
            let similarity = text_similarity(title, existing);
            if similarity >= self.similarity_threshold {
                info!(
                    "Duplicate detected: '{}' ~ '{}' (similarity {:.2})",
                    title, existing, similarity
                );
                return Some((existing, similarity));
            }
        }
        None
    }

    /// Position/shape key for items without readable text
    fn position_key(&self, bbox: &BBox) -> String {
        let g = self.position_grid;
        let snap = |v: i64| v.div_euclid(g as i64);
        format!(
            "pos:{}:{}:{}:{}",
            snap(bbox.x1 as i64 + g as i64 / 2),
            snap(bbox.y1 as i64 + g as i64 / 2),
            snap(bbox.width() + g as i64 / 2),
            snap(bbox.height() + g as i64 / 2),
        )
    }

    /// Check and insert in one step.
    ///
    /// Returns the new record when accepted, `None` for a duplicate. Holding the
    /// lock across check and insert means two near-identical items arriving
    /// from different workers cannot both be accepted.
    pub fn add_record(
        &self,
        grouped: &GroupedRecord,
        ocr_texts: &BTreeMap<String, String>,
    ) -> Option<StructuredRecord> {
        let title = ocr_texts
            .get(&self.title_class)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        let mut store = self.store.lock();

        let position_key = if title.is_empty() {
            let key = self.position_key(&grouped.container.bbox);
            if store.position_keys.contains(&key) {
                debug!("Duplicate untitled item at {}", grouped.container.bbox);
                return None;
            }
            Some(key)
        } else {
            if self.find_similar(&store, &title).is_some() {
                return None;
            }
            None
        };

        let present: BTreeSet<String> = grouped.attributes.keys().cloned().collect();
        let texts: BTreeMap<String, String> = present
            .iter()
            .map(|class| {
                let text = if *class == self.title_class {
                    title.clone()
                } else {
                    ocr_texts.get(class).cloned().unwrap_or_default()
                };
                (class.clone(), text)
            })
            .collect();

        let record = StructuredRecord::new(
            grouped.item_id.clone(),
            &self.title_class,
            texts,
            present,
            &self.required,
        );

        if let Some(key) = position_key {
            store.position_keys.insert(key);
        }
        store.records.push(record.clone());

        info!(
            "New record: {} [{}]",
            if title.is_empty() { "(untitled)" } else { title.as_str() },
            record.error_status()
        );
        Some(record)
    }

    /// Snapshot of all accepted records, oldest first
    pub fn records(&self) -> Vec<StructuredRecord> {
        self.store.lock().records.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<StructuredRecord> {
        self.store.lock().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.store.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze a record's fields
    pub fn confirm(&self, id: Uuid) -> Result<(), RecordError> {
        let mut store = self.store.lock();
        store.find_mut(id)?.confirm();
        info!("Record {} confirmed", id);
        Ok(())
    }

    /// Record where the item's crop was saved
    pub fn attach_image(&self, id: Uuid, path: impl Into<String>) -> Result<(), RecordError> {
        let mut store = self.store.lock();
        store.find_mut(id)?.image_path = Some(path.into());
        Ok(())
    }

    /// Edit one field of an unconfirmed record
    pub fn update_field(&self, id: Uuid, class: &str, value: &str) -> Result<(), RecordError> {
        let mut store = self.store.lock();
        let title_class = self.title_class.as_str();
        store.find_mut(id)?.set_field(title_class, class, value)
    }

    pub fn summary(&self) -> RecordSummary {
        let store = self.store.lock();
        let mut summary = RecordSummary {
            total: store.records.len(),
            ..Default::default()
        };
        for record in &store.records {
            if record.error_status().is_ok() {
                summary.ok += 1;
            } else {
                *summary
                    .errors
                    .entry(record.error_status().to_string())
                    .or_insert(0) += 1;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::Detection;
    use std::sync::Arc;

    fn resolver(threshold: f32) -> DuplicateResolver {
        let dedup = DedupSettings {
            similarity_threshold: threshold,
            ..DedupSettings::default()
        };
        DuplicateResolver::new(&dedup, &HierarchySettings::default())
    }

    fn grouped(y: i32, classes: &[&str]) -> GroupedRecord {
        let mut record = GroupedRecord::new(
            "item_001",
            Detection::new(BBox::new(0, y, 300, y + 80), 0.9, "list-item"),
        );
        for (i, class) in classes.iter().enumerate() {
            let top = y + 5 + i as i32 * 15;
            record.attributes.insert(
                class.to_string(),
                Detection::new(BBox::new(10, top, 200, top + 12), 0.8, *class),
            );
        }
        record
    }

    fn texts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_first_is_new_repeat_is_duplicate() {
        let r = resolver(0.75);
        assert!(!r.is_duplicate("Mushoku Tensei"));

        let accepted = r.add_record(&grouped(0, &["title"]), &texts(&[("title", "Mushoku Tensei")]));
        assert!(accepted.is_some());
        assert!(r.is_duplicate("Mushoku Tensei"));
    }

    #[test]
    fn test_same_title_twice_yields_one_record() {
        let r = resolver(0.75);
        let first = r.add_record(&grouped(0, &["title"]), &texts(&[("title", "Overlord")]));
        let second = r.add_record(&grouped(100, &["title"]), &texts(&[("title", "Overlord")]));
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_threshold_is_monotonic() {
        let a = "転生したらスライムだった件";
        let b = "転生したらスライムだつた件";
        let similarity = text_similarity(a, b);

        let lenient = resolver(similarity);
        lenient.add_record(&grouped(0, &["title"]), &texts(&[("title", a)]));
        assert!(lenient.is_duplicate(b));

        let strict = resolver((similarity + 0.01).min(1.0));
        strict.add_record(&grouped(0, &["title"]), &texts(&[("title", a)]));
        assert!(!strict.is_duplicate(b));
    }

    #[test]
    fn test_untitled_falls_back_to_position() {
        let r = resolver(0.75);
        let empty = texts(&[]);
        assert!(r.add_record(&grouped(0, &[]), &empty).is_some());
        // A few pixels of jitter still lands on the same key
        let mut jittered = grouped(3, &[]);
        jittered.container.bbox.x1 += 2;
        assert!(r.add_record(&jittered, &empty).is_none());
        // A different row is a different item
        assert!(r.add_record(&grouped(200, &[]), &empty).is_some());
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_record_fields_and_status() {
        let r = resolver(0.75);
        let record = r
            .add_record(
                &grouped(0, &["title", "progress", "site_name"]),
                &texts(&[("title", "  Dune  "), ("progress", "38/768"), ("site_name", "Shelf")]),
            )
            .unwrap();
        assert_eq!(record.title(), "Dune");
        assert_eq!(record.attribute("progress"), Some("38/768"));
        assert_eq!(record.error_status().to_string(), "missing_last_read_date");

        let summary = r.summary();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.ok, 0);
        assert_eq!(summary.errors.get("missing_last_read_date"), Some(&1));
    }

    #[test]
    fn test_confirm_and_update() {
        let r = resolver(0.75);
        let record = r
            .add_record(&grouped(0, &["title"]), &texts(&[("title", "Dune")]))
            .unwrap();

        r.update_field(record.id, "site_name", "Shelf").unwrap();
        r.update_field(record.id, "last_read_date", "2024-01-02").unwrap();
        assert!(r.get(record.id).unwrap().error_status().is_ok());

        r.confirm(record.id).unwrap();
        assert_eq!(
            r.update_field(record.id, "title", "Dune Messiah"),
            Err(RecordError::Confirmed(record.id))
        );

        let missing = Uuid::new_v4();
        assert_eq!(r.confirm(missing), Err(RecordError::NotFound(missing)));
    }

    #[test]
    fn test_attach_image_and_snapshot() {
        let r = resolver(0.75);
        assert!(r.is_empty());
        let record = r
            .add_record(&grouped(0, &["title"]), &texts(&[("title", "Dune")]))
            .unwrap();
        assert!(record.image_path.is_none());

        r.attach_image(record.id, "items/dune.png").unwrap();
        let stored = r.records();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].image_path.as_deref(), Some("items/dune.png"));

        let missing = Uuid::new_v4();
        assert_eq!(
            r.attach_image(missing, "x.png"),
            Err(RecordError::NotFound(missing))
        );
    }

    #[test]
    fn test_concurrent_duplicates_accept_once() {
        let r = Arc::new(resolver(0.75));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || {
                    let title = if i % 2 == 0 { "Spice and Wolf" } else { "Spice and Wolf." };
                    r.add_record(&grouped(i * 100, &["title"]), &texts(&[("title", title)]))
                        .is_some()
                })
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(r.len(), 1);
    }
}
