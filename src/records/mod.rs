//! Structured records produced by the pipeline
//!
//! A record is built once per accepted list item after OCR. Its error status is
//! always derived from which required fields were detected; it is never stored
//! independently of the fields themselves.

pub mod dedup;
pub mod text;

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::RecordError;

pub use dedup::{DuplicateResolver, RecordSummary};

/// Completeness of a record's required fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorStatus {
    /// Every required field was detected
    Ok,
    /// Required classes that were not detected, in declaration order
    Missing(Vec<String>),
}

impl ErrorStatus {
    /// Build from the list of missing classes
    pub fn from_missing<I, S>(missing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let missing: Vec<String> = missing.into_iter().map(|s| s.as_ref().to_string()).collect();
        if missing.is_empty() {
            ErrorStatus::Ok
        } else {
            ErrorStatus::Missing(missing)
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ErrorStatus::Ok)
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStatus::Ok => write!(f, "OK"),
            ErrorStatus::Missing(classes) => {
                let parts: Vec<String> = classes.iter().map(|c| format!("missing_{c}")).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

impl Serialize for ErrorStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One deduplicated list item
#[derive(Debug, Clone, Serialize)]
pub struct StructuredRecord {
    pub id: Uuid,
    /// Frame-local id of the container the record was built from
    pub item_id: String,
    title: String,
    attributes: BTreeMap<String, String>,
    error_status: ErrorStatus,
    pub image_path: Option<String>,
    confirmed: bool,
    #[serde(skip)]
    pub created_at: SystemTime,
    /// Classes that were detected or filled in by an edit
    #[serde(skip)]
    present: BTreeSet<String>,
    #[serde(skip)]
    required: Vec<String>,
}

impl StructuredRecord {
    /// Build a record.
    ///
    /// `present` lists the attribute classes that were detected, `texts` the OCR
    /// result per class (title included), `required` the classes whose absence
    /// is an error.
    pub fn new(
        item_id: impl Into<String>,
        title_class: &str,
        texts: BTreeMap<String, String>,
        present: BTreeSet<String>,
        required: &[String],
    ) -> Self {
        let mut attributes = texts;
        let title = attributes.remove(title_class).unwrap_or_default();
        let error_status = derive_status(&present, required);

        Self {
            id: Uuid::new_v4(),
            item_id: item_id.into(),
            title,
            attributes,
            error_status,
            image_path: None,
            confirmed: false,
            created_at: SystemTime::now(),
            present,
            required: required.to_vec(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn attribute(&self, class: &str) -> Option<&str> {
        self.attributes.get(class).map(String::as_str)
    }

    pub fn error_status(&self) -> &ErrorStatus {
        &self.error_status
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Mark as confirmed; fields are frozen from now on
    pub fn confirm(&mut self) {
        self.confirmed = true;
    }

    /// Overwrite a field (the title when `class` is `title_class`).
    ///
    /// A non-empty value counts the class as present for the error status.
    pub fn set_field(
        &mut self,
        title_class: &str,
        class: &str,
        value: impl Into<String>,
    ) -> Result<(), RecordError> {
        if self.confirmed {
            return Err(RecordError::Confirmed(self.id));
        }

        let value = value.into();
        if value.trim().is_empty() {
            self.present.remove(class);
        } else {
            self.present.insert(class.to_string());
        }

        if class == title_class {
            self.title = value;
        } else {
            self.attributes.insert(class.to_string(), value);
        }
        self.error_status = derive_status(&self.present, &self.required);
        Ok(())
    }
}

fn derive_status(present: &BTreeSet<String>, required: &[String]) -> ErrorStatus {
    ErrorStatus::from_missing(required.iter().filter(|class| !present.contains(class.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<String> {
        vec!["title".into(), "last_read_date".into(), "site_name".into()]
    }

    fn record(present: &[&str]) -> StructuredRecord {
        let texts: BTreeMap<String, String> = present
            .iter()
            .map(|c| (c.to_string(), format!("{c} text")))
            .collect();
        let present = present.iter().map(|c| c.to_string()).collect();
        StructuredRecord::new("item_001", "title", texts, present, &required())
    }

    #[test]
    fn test_error_status_display() {
        assert_eq!(ErrorStatus::Ok.to_string(), "OK");
        assert_eq!(
            ErrorStatus::from_missing(["title", "site_name"]).to_string(),
            "missing_title, missing_site_name"
        );
        assert_eq!(ErrorStatus::from_missing(Vec::<String>::new()), ErrorStatus::Ok);
    }

    #[test]
    fn test_status_derived_from_present_classes() {
        let complete = record(&["title", "last_read_date", "site_name", "progress"]);
        assert!(complete.error_status().is_ok());
        assert_eq!(complete.title(), "title text");
        assert_eq!(complete.attribute("progress"), Some("progress text"));
        assert!(complete.attribute("title").is_none());

        let partial = record(&["title", "progress"]);
        assert_eq!(
            partial.error_status().to_string(),
            "missing_last_read_date, missing_site_name"
        );
    }

    #[test]
    fn test_edit_rederives_status() {
        let mut rec = record(&["title", "last_read_date"]);
        assert!(!rec.error_status().is_ok());

        rec.set_field("title", "site_name", "Example Site").unwrap();
        assert!(rec.error_status().is_ok());

        rec.set_field("title", "title", "  ").unwrap();
        assert_eq!(rec.error_status().to_string(), "missing_title");
    }

    #[test]
    fn test_confirmed_record_is_frozen() {
        let mut rec = record(&["title"]);
        rec.confirm();
        assert!(rec.is_confirmed());
        assert_eq!(
            rec.set_field("title", "title", "changed"),
            Err(RecordError::Confirmed(rec.id))
        );
        assert_eq!(rec.title(), "title text");
    }

    #[test]
    fn test_serializes_status_as_string() {
        let rec = record(&["title"]);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(
            json["error_status"],
            "missing_last_read_date, missing_site_name"
        );
        assert_eq!(json["confirmed"], false);
        assert_eq!(json["title"], "title text");
    }
}
