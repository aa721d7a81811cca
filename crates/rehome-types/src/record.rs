//! File record model.
//!
//! One `FileRecord` exists per physical file. It carries three independent
//! state machines (indexing, reorganisation, cleanup) as plain fields; the
//! storage crate persists them flat and maps them back through pure functions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::ExecutionId;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable, collision-resistant identity of one physical file.
///
/// Established upstream at indexing time (a hex digest of the original full
/// path) and never recomputed by the migration engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new record identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for RecordId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Indexing state, produced by the upstream indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexingStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl IndexingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the persisted form. Returns `None` for unknown values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Reorganisation state: `PENDING -> SUCCESS | FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReorgStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

impl ReorgStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the persisted form. Returns `None` for unknown values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReorgStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// State blocks
// ---------------------------------------------------------------------------

/// Optional business classification attached by the indexer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
}

impl BusinessMetadata {
    /// True when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document_type.is_none()
            && self.customer_code.is_none()
            && self.year.is_none()
            && self.month.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingState {
    #[serde(default)]
    pub status: IndexingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reorganisation bookkeeping.
///
/// `attempts` only ever grows; every persisted attempt adds to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgState {
    #[serde(default)]
    pub status: ReorgStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupState {
    #[serde(default)]
    pub deleted_from_source: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

// ---------------------------------------------------------------------------
// FileRecord
// ---------------------------------------------------------------------------

/// One physical file tracked by the record store.
///
/// This is also the import format: each line of an index export is one
/// `FileRecord` in JSON, with the state blocks defaulting to PENDING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: RecordId,
    pub source_path: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business: Option<BusinessMetadata>,
    #[serde(default)]
    pub indexing: IndexingState,
    #[serde(default)]
    pub reorg: ReorgState,
    #[serde(default)]
    pub cleanup: CleanupState,
}

impl FileRecord {
    /// A freshly indexed record, pending reorganisation.
    ///
    /// The extension is derived from the file name when it has one.
    #[must_use]
    pub fn pending(
        id: impl Into<RecordId>,
        source_path: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        let file_name = file_name.into();
        let extension = file_name
            .rsplit_once('.')
            .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
            .map(|(_, ext)| ext.to_ascii_lowercase());
        Self {
            id: id.into(),
            source_path: source_path.into(),
            file_name,
            extension,
            file_size: None,
            last_modified: None,
            business: None,
            indexing: IndexingState::default(),
            reorg: ReorgState::default(),
            cleanup: CleanupState::default(),
        }
    }

    /// Whether this record may be deleted from the origin at `now`.
    ///
    /// Requires a successful reorganisation with a destination path, an
    /// origin copy that still exists, and a completion time inside
    /// `safety_window`.
    #[must_use]
    pub fn is_cleanup_eligible(&self, now: DateTime<Utc>, safety_window: Duration) -> bool {
        if self.reorg.status != ReorgStatus::Success || self.cleanup.deleted_from_source {
            return false;
        }
        if self
            .reorg
            .destination_path
            .as_deref()
            .map_or(true, str::is_empty)
        {
            return false;
        }
        self.reorg
            .completed_at
            .is_some_and(|completed| completed >= now - safety_window)
    }

    /// Project the fields the cleanup stage reads.
    #[must_use]
    pub fn to_candidate(&self) -> CleanupCandidate {
        CleanupCandidate {
            id: self.id.clone(),
            source_path: Some(self.source_path.clone()).filter(|p| !p.is_empty()),
            destination_path: self.reorg.destination_path.clone(),
            completed_at: self.reorg.completed_at,
            file_size: self.file_size,
            last_modified: self.last_modified,
        }
    }
}

/// Projection of a `FileRecord` selected for origin deletion.
///
/// Path and timestamp fields stay optional: the selection query may return
/// incomplete documents, and the cleanup validator rejects those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupCandidate {
    pub id: RecordId,
    pub source_path: Option<String>,
    pub destination_path: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated(completed_days_ago: i64, now: DateTime<Utc>) -> FileRecord {
        let mut rec = FileRecord::pending("a1b2c3", "/in/report.pdf", "report.pdf");
        rec.reorg.status = ReorgStatus::Success;
        rec.reorg.destination_path = Some("/dest/a1/b2/c3/report.pdf".into());
        rec.reorg.completed_at = Some(now - Duration::days(completed_days_ago));
        rec
    }

    #[test]
    fn record_id_roundtrip() {
        let id = RecordId::new("abc");
        assert_eq!(id.as_str(), "abc");
        assert_eq!(id.to_string(), "abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let from: RecordId = "abc".into();
        assert_eq!(from, id);
    }

    #[test]
    fn status_strings_match_persisted_form() {
        assert_eq!(ReorgStatus::Success.as_str(), "SUCCESS");
        assert_eq!(ReorgStatus::parse("FAILED"), Some(ReorgStatus::Failed));
        assert_eq!(ReorgStatus::parse("COMPLETED"), None);
        assert_eq!(IndexingStatus::parse("COMPLETED"), Some(IndexingStatus::Completed));
        assert_eq!(
            serde_json::to_string(&ReorgStatus::Pending).unwrap(),
            "\"PENDING\""
        );
    }

    #[test]
    fn pending_derives_extension() {
        let rec = FileRecord::pending("x", "/a/Report.PDF", "Report.PDF");
        assert_eq!(rec.extension.as_deref(), Some("pdf"));
        assert_eq!(rec.reorg.status, ReorgStatus::Pending);
        assert_eq!(rec.reorg.attempts, 0);
        assert!(!rec.cleanup.deleted_from_source);

        let hidden = FileRecord::pending("y", "/a/.profile", ".profile");
        assert_eq!(hidden.extension, None);
    }

    #[test]
    fn cleanup_eligibility_respects_safety_window() {
        let now = Utc::now();
        let window = Duration::days(90);
        assert!(migrated(89, now).is_cleanup_eligible(now, window));
        assert!(!migrated(91, now).is_cleanup_eligible(now, window));
    }

    #[test]
    fn cleanup_eligibility_requires_destination_and_flag() {
        let now = Utc::now();
        let window = Duration::days(90);

        let mut no_dest = migrated(1, now);
        no_dest.reorg.destination_path = Some(String::new());
        assert!(!no_dest.is_cleanup_eligible(now, window));

        let mut deleted = migrated(1, now);
        deleted.cleanup.deleted_from_source = true;
        assert!(!deleted.is_cleanup_eligible(now, window));

        let mut failed = migrated(1, now);
        failed.reorg.status = ReorgStatus::Failed;
        assert!(!failed.is_cleanup_eligible(now, window));

        let mut no_time = migrated(1, now);
        no_time.reorg.completed_at = None;
        assert!(!no_time.is_cleanup_eligible(now, window));
    }

    #[test]
    fn import_line_defaults_state_blocks() {
        let line = r#"{"id":"ff00","source_path":"/in/a.txt","file_name":"a.txt",
            "business":{"document_type":"INVOICE","year":2023}}"#;
        let rec: FileRecord = serde_json::from_str(line).unwrap();
        assert_eq!(rec.reorg.status, ReorgStatus::Pending);
        assert_eq!(rec.indexing.status, IndexingStatus::Pending);
        assert_eq!(
            rec.business.unwrap().document_type.as_deref(),
            Some("INVOICE")
        );
    }

    #[test]
    fn candidate_projection_drops_empty_source() {
        let now = Utc::now();
        let mut rec = migrated(1, now);
        rec.source_path.clear();
        let cand = rec.to_candidate();
        assert_eq!(cand.source_path, None);
        assert_eq!(cand.destination_path.as_deref(), Some("/dest/a1/b2/c3/report.pdf"));
    }
}
