//! In-Memory Schedule Store
//!
//! [`ScheduleStore`] adapter backed by a validated list of entries, seeded
//! either with exchange defaults or from a JSON schedule document.
//!
//! # Document Format
//!
//! ```json
//! {
//!   "entries": [
//!     { "kind": "MARKET", "scope": { "type": "global" },
//!       "start": "09:15:00", "end": "15:30:00", "is_open": true },
//!     { "kind": "MARKET", "scope": { "type": "weekday", "value": "Sat" },
//!       "is_open": false },
//!     { "account": "AB1234", "kind": "MARKET",
//!       "scope": { "type": "exact_date", "value": "2024-11-01" },
//!       "start": "18:00:00", "end": "19:00:00", "is_open": true }
//!   ]
//! }
//! ```

use std::path::Path;

use async_trait::async_trait;
use chrono::{NaiveTime, Weekday};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::application::ports::{ScheduleStore, ScheduleStoreError};
use crate::domain::schedule::{
    AccountId, ScheduleEntry, ScheduleError, ScheduleKind, ScheduleScope, validate_entries,
};

/// Schedule document loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleLoadError {
    /// The file could not be read.
    #[error("failed to read schedule file {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The document is not valid JSON for the schedule format.
    #[error("invalid schedule document: {0}")]
    Parse(#[from] serde_json::Error),

    /// The entries violate a schedule invariant.
    #[error(transparent)]
    Invalid(#[from] ScheduleError),
}

#[derive(Debug, Deserialize)]
struct ScheduleDocument {
    entries: Vec<ScheduleEntry>,
}

/// Schedule store holding entries in memory.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    entries: RwLock<Vec<ScheduleEntry>>,
}

impl InMemoryScheduleStore {
    /// Create a store from entries, validating them first.
    ///
    /// # Errors
    ///
    /// Returns `ScheduleError` if a kind lacks exactly one shared default.
    pub fn new(entries: Vec<ScheduleEntry>) -> Result<Self, ScheduleError> {
        validate_entries(&entries)?;
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Store seeded with the default exchange hours.
    ///
    /// Market: 09:15 to 15:30, closed on weekends. Batch: 09:00 to 16:00.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            entries: RwLock::new(default_entries()),
        }
    }

    /// Parse and validate a JSON schedule document.
    ///
    /// # Errors
    ///
    /// Returns `ScheduleLoadError` if the document is malformed or invalid.
    pub fn from_json_str(json: &str) -> Result<Self, ScheduleLoadError> {
        let document: ScheduleDocument = serde_json::from_str(json)?;
        Ok(Self::new(document.entries)?)
    }

    /// Load a JSON schedule document from disk.
    ///
    /// # Errors
    ///
    /// Returns `ScheduleLoadError` if the file cannot be read or is invalid.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ScheduleLoadError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ScheduleLoadError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let store = Self::from_json_str(&json)?;
        tracing::info!(path = %path.display(), entries = store.len(), "Schedule document loaded");
        Ok(store)
    }

    /// Add an override entry.
    ///
    /// # Errors
    ///
    /// Returns `ScheduleError` if the entry would duplicate a shared default.
    pub fn insert(&self, entry: ScheduleEntry) -> Result<(), ScheduleError> {
        let mut entries = self.entries.write();
        let mut candidate = entries.clone();
        candidate.push(entry);
        validate_entries(&candidate)?;
        *entries = candidate;
        Ok(())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn schedule_entries(
        &self,
        account: &AccountId,
        kind: ScheduleKind,
    ) -> Result<Vec<ScheduleEntry>, ScheduleStoreError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .filter(|e| e.account.as_ref().is_none_or(|owner| owner == account))
            .cloned()
            .collect())
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

fn default_entries() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry::open(ScheduleScope::Global, hm(9, 15), hm(15, 30)),
        ScheduleEntry::closed(ScheduleScope::Weekday(Weekday::Sat)),
        ScheduleEntry::closed(ScheduleScope::Weekday(Weekday::Sun)),
        ScheduleEntry::open(ScheduleScope::Global, hm(9, 0), hm(16, 0))
            .with_kind(ScheduleKind::Batch),
    ]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::NaiveDate;

    use super::*;
    use crate::domain::schedule::{WindowSource, resolve_window};

    const DOCUMENT: &str = r#"{
        "entries": [
            { "kind": "MARKET", "scope": { "type": "global" },
              "start": "09:15:00", "end": "15:30:00", "is_open": true },
            { "kind": "MARKET", "scope": { "type": "weekday", "value": "Sat" },
              "is_open": false },
            { "account": "AB1234", "kind": "MARKET",
              "scope": { "type": "exact_date", "value": "2024-11-01" },
              "start": "18:00:00", "end": "19:00:00", "is_open": true },
            { "account": "ZZ9999", "kind": "MARKET",
              "scope": { "type": "global" },
              "start": "10:00:00", "end": "11:00:00", "is_open": true }
        ]
    }"#;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_entries(&default_entries()).is_ok());
    }

    #[tokio::test]
    async fn defaults_close_on_weekends() {
        let store = InMemoryScheduleStore::with_defaults();
        let account = AccountId::new("AB1234");
        let entries = store
            .schedule_entries(&account, ScheduleKind::Market)
            .await
            .unwrap();

        let sunday = NaiveDate::from_ymd_opt(2024, 3, 17).unwrap();
        assert!(!resolve_window(&entries, &account, sunday).is_open);
    }

    #[tokio::test]
    async fn entries_are_filtered_by_kind_and_account() {
        let store = InMemoryScheduleStore::from_json_str(DOCUMENT).unwrap();

        let entries = store
            .schedule_entries(&AccountId::new("AB1234"), ScheduleKind::Market)
            .await
            .unwrap();

        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.account.as_ref().is_none_or(|a| a.as_str() == "AB1234")));

        let batch = store
            .schedule_entries(&AccountId::new("AB1234"), ScheduleKind::Batch)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn document_exact_date_applies_to_owner() {
        let store = InMemoryScheduleStore::from_json_str(DOCUMENT).unwrap();
        let account = AccountId::new("AB1234");
        let entries = store
            .schedule_entries(&account, ScheduleKind::Market)
            .await
            .unwrap();

        let special = NaiveDate::from_ymd_opt(2024, 11, 1).unwrap();
        let window = resolve_window(&entries, &account, special);

        assert_eq!(window.source, WindowSource::ExactDate);
        assert!(window.account_specific);
    }

    #[test]
    fn document_without_default_is_rejected() {
        let json = r#"{ "entries": [
            { "scope": { "type": "weekday", "value": "Sat" }, "is_open": false },
            { "account": "AB1234", "scope": { "type": "global" }, "is_open": true }
        ] }"#;

        assert!(matches!(
            InMemoryScheduleStore::from_json_str(json),
            Err(ScheduleLoadError::Invalid(ScheduleError::MissingDefault("MARKET")))
        ));
    }

    #[test]
    fn malformed_document_is_rejected() {
        assert!(matches!(
            InMemoryScheduleStore::from_json_str("{ \"entries\": 3 }"),
            Err(ScheduleLoadError::Parse(_))
        ));
    }

    #[test]
    fn insert_rejects_second_shared_default() {
        let store = InMemoryScheduleStore::with_defaults();
        let before = store.len();

        let result = store.insert(ScheduleEntry::open(ScheduleScope::Global, hm(8, 0), hm(9, 0)));

        assert!(matches!(result, Err(ScheduleError::DuplicateDefault { .. })));
        assert_eq!(store.len(), before);
    }

    #[test]
    fn insert_accepts_override() {
        let store = InMemoryScheduleStore::with_defaults();
        let holiday = NaiveDate::from_ymd_opt(2024, 8, 15).unwrap();

        store
            .insert(ScheduleEntry::closed(ScheduleScope::ExactDate(holiday)))
            .unwrap();

        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DOCUMENT.as_bytes()).unwrap();

        let store = InMemoryScheduleStore::from_json_file(file.path())
            .await
            .unwrap();

        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = InMemoryScheduleStore::from_json_file(dir.path().join("absent.json")).await;

        assert!(matches!(result, Err(ScheduleLoadError::Io { .. })));
    }
}
