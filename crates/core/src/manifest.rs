//! Durable per-document progress log.
//!
//! The manifest is a JSONL file. Every change appends the document's full
//! entry; when loading, the last line for a document wins. Lines are never
//! rewritten in place except by [`Manifest::compact`].

use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extracted,
    Normalized,
    Chunked,
    Embedded,
    Upserted,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Extracted,
        Stage::Normalized,
        Stage::Chunked,
        Stage::Embedded,
        Stage::Upserted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extracted => "extracted",
            Stage::Normalized => "normalized",
            Stage::Chunked => "chunked",
            Stage::Embedded => "embedded",
            Stage::Upserted => "upserted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion time per stage; `None` means the stage has not finished for
/// the current content hash.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub extracted: Option<DateTime<Utc>>,
    pub normalized: Option<DateTime<Utc>>,
    pub chunked: Option<DateTime<Utc>>,
    pub embedded: Option<DateTime<Utc>>,
    pub upserted: Option<DateTime<Utc>>,
}

impl StageStatus {
    pub fn get(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Extracted => self.extracted,
            Stage::Normalized => self.normalized,
            Stage::Chunked => self.chunked,
            Stage::Embedded => self.embedded,
            Stage::Upserted => self.upserted,
        }
    }

    fn slot(&mut self, stage: Stage) -> &mut Option<DateTime<Utc>> {
        match stage {
            Stage::Extracted => &mut self.extracted,
            Stage::Normalized => &mut self.normalized,
            Stage::Chunked => &mut self.chunked,
            Stage::Embedded => &mut self.embedded,
            Stage::Upserted => &mut self.upserted,
        }
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.get(stage).is_some()
    }

    /// True when `stage` and every stage before it are complete.
    pub fn completed_through(&self, stage: Stage) -> bool {
        Stage::ALL
            .iter()
            .filter(|candidate| **candidate <= stage)
            .all(|candidate| self.is_complete(*candidate))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub document_id: String,
    #[serde(default)]
    pub source_path: String,
    pub content_hash: String,
    #[serde(default)]
    pub stages: StageStatus,
    #[serde(default)]
    pub page_count: usize,
    #[serde(default)]
    pub chunk_count: usize,
    pub title: Option<String>,
    pub date: Option<String>,
    /// Vectors of the current version present in the index.
    #[serde(default)]
    pub indexed_vectors: usize,
    /// Vectors of a superseded version still to delete from the index.
    #[serde(default)]
    pub stale_vectors: usize,
    pub skipped: Option<String>,
    pub failure: Option<StageFailure>,
    pub updated_at: DateTime<Utc>,
}

impl ManifestEntry {
    fn new(document_id: &str, source_path: &str, content_hash: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            source_path: source_path.to_string(),
            content_hash: content_hash.to_string(),
            stages: StageStatus::default(),
            page_count: 0,
            chunk_count: 0,
            title: None,
            date: None,
            indexed_vectors: 0,
            stale_vectors: 0,
            skipped: None,
            failure: None,
            updated_at: Utc::now(),
        }
    }

    /// Drop all progress of the previous version; its indexed vectors
    /// become stale.
    fn supersede(&mut self, content_hash: &str) {
        self.content_hash = content_hash.to_string();
        self.stages = StageStatus::default();
        self.stale_vectors += self.indexed_vectors;
        self.indexed_vectors = 0;
        self.chunk_count = 0;
        self.page_count = 0;
        self.skipped = None;
        self.failure = None;
    }

    pub fn is_complete(&self) -> bool {
        self.stages.completed_through(Stage::Upserted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManifestSummary {
    pub documents: usize,
    pub complete: usize,
    pub in_progress: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Manifest {
    path: PathBuf,
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Loads `path` if it exists; the file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let mut entries = BTreeMap::new();

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            for (line_number, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ManifestEntry>(line) {
                    Ok(entry) => {
                        entries.insert(entry.document_id.clone(), entry);
                    }
                    Err(error) => warn!(
                        path = %path.display(),
                        line = line_number + 1,
                        %error,
                        "ignoring corrupt manifest line"
                    ),
                }
            }
        }

        Ok(Self { path, entries })
    }

    pub fn get(&self, document_id: &str) -> Option<&ManifestEntry> {
        self.entries.get(document_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A document needs work when it is unknown, its content changed, or any
    /// stage through `upserted` is incomplete.
    pub fn needs_reprocessing(&self, document_id: &str, current_hash: &str) -> bool {
        self.needs_stage(document_id, current_hash, Stage::Upserted)
    }

    pub fn needs_stage(&self, document_id: &str, current_hash: &str, stage: Stage) -> bool {
        match self.entries.get(document_id) {
            Some(entry) => {
                entry.content_hash != current_hash || !entry.stages.completed_through(stage)
            }
            None => true,
        }
    }

    /// Registers the current version of a document. Returns `true` when this
    /// is a new document or its content hash changed.
    pub fn begin_version(
        &mut self,
        document_id: &str,
        source_path: &str,
        content_hash: &str,
    ) -> Result<bool, IngestError> {
        let (entry, changed) = match self.entries.get_mut(document_id) {
            Some(entry) if entry.content_hash == content_hash => {
                if entry.source_path == source_path {
                    return Ok(false);
                }
                entry.source_path = source_path.to_string();
                (entry.clone(), false)
            }
            Some(entry) => {
                debug!(
                    document_id,
                    stale_vectors = entry.indexed_vectors,
                    "content hash changed, superseding previous version"
                );
                entry.supersede(content_hash);
                entry.source_path = source_path.to_string();
                (entry.clone(), true)
            }
            None => {
                let entry = ManifestEntry::new(document_id, source_path, content_hash);
                self.entries.insert(document_id.to_string(), entry.clone());
                (entry, true)
            }
        };

        self.write(entry)?;
        Ok(changed)
    }

    /// Marks `stage` complete for `content_hash`. Returns `false` without
    /// writing when the stage was already complete for that hash.
    pub fn record_stage(
        &mut self,
        document_id: &str,
        stage: Stage,
        content_hash: &str,
    ) -> Result<bool, IngestError> {
        let entry = self
            .entries
            .entry(document_id.to_string())
            .or_insert_with(|| ManifestEntry::new(document_id, "", content_hash));

        if entry.content_hash != content_hash {
            entry.supersede(content_hash);
        } else if entry.stages.is_complete(stage) {
            return Ok(false);
        }

        *entry.stages.slot(stage) = Some(Utc::now());
        if entry
            .failure
            .as_ref()
            .is_some_and(|failure| failure.stage <= stage)
        {
            entry.failure = None;
        }

        let entry = entry.clone();
        self.write(entry)?;
        Ok(true)
    }

    pub fn record_failure(
        &mut self,
        document_id: &str,
        content_hash: &str,
        stage: Stage,
        reason: impl Into<String>,
    ) -> Result<(), IngestError> {
        let reason = reason.into();
        self.update(document_id, content_hash, |entry| {
            entry.failure = Some(StageFailure {
                stage,
                reason,
                at: Utc::now(),
            });
        })
    }

    pub fn record_skipped(
        &mut self,
        document_id: &str,
        content_hash: &str,
        reason: impl Into<String>,
    ) -> Result<(), IngestError> {
        let reason = reason.into();
        self.update(document_id, content_hash, |entry| {
            entry.skipped = Some(reason);
        })
    }

    /// Applies `change` to the entry for `content_hash`; appends a line only
    /// if something actually changed.
    pub fn update(
        &mut self,
        document_id: &str,
        content_hash: &str,
        change: impl FnOnce(&mut ManifestEntry),
    ) -> Result<(), IngestError> {
        let entry = self
            .entries
            .entry(document_id.to_string())
            .or_insert_with(|| ManifestEntry::new(document_id, "", content_hash));

        if entry.content_hash != content_hash {
            entry.supersede(content_hash);
        }

        let before = entry.clone();
        change(entry);
        if *entry == before {
            return Ok(());
        }

        let entry = entry.clone();
        self.write(entry)
    }

    /// Rewrites the log with one line per document.
    pub fn compact(&mut self) -> Result<(), IngestError> {
        ensure_parent(&self.path)?;
        let temp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            for entry in self.entries.values() {
                writeln!(file, "{}", serde_json::to_string(entry)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    pub fn summary(&self) -> ManifestSummary {
        let mut summary = ManifestSummary {
            documents: self.entries.len(),
            ..ManifestSummary::default()
        };

        for entry in self.entries.values() {
            if entry.failure.is_some() {
                summary.failed += 1;
            } else if entry.skipped.is_some() {
                summary.skipped += 1;
            } else if entry.is_complete() {
                summary.complete += 1;
            } else {
                summary.in_progress += 1;
            }
        }

        summary
    }

    fn write(&mut self, mut entry: ManifestEntry) -> Result<(), IngestError> {
        entry.updated_at = Utc::now();
        ensure_parent(&self.path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        file.flush()?;

        self.entries.insert(entry.document_id.clone(), entry);
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn line_count(path: &Path) -> usize {
        fs::read_to_string(path)
            .map(|contents| contents.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn unknown_documents_need_processing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let manifest = Manifest::open(dir.path().join("manifest.jsonl"))?;
        assert!(manifest.get("doc").is_none());
        assert!(manifest.needs_reprocessing("doc", "hash"));
        Ok(())
    }

    #[test]
    fn completed_documents_are_skipped_until_hash_changes() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let mut manifest = Manifest::open(dir.path().join("manifest.jsonl"))?;

        for stage in Stage::ALL {
            assert!(manifest.record_stage("doc", stage, "h1")?);
        }

        assert!(!manifest.needs_reprocessing("doc", "h1"));
        assert!(manifest.needs_reprocessing("doc", "h2"));
        Ok(())
    }

    #[test]
    fn incomplete_earlier_stage_requires_work() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut manifest = Manifest::open(dir.path().join("manifest.jsonl"))?;

        manifest.record_stage("doc", Stage::Extracted, "h1")?;
        manifest.record_stage("doc", Stage::Chunked, "h1")?;

        assert!(!manifest.needs_stage("doc", "h1", Stage::Extracted));
        assert!(manifest.needs_stage("doc", "h1", Stage::Chunked));
        Ok(())
    }

    #[test]
    fn repeated_stage_records_do_not_append() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manifest.jsonl");
        let mut manifest = Manifest::open(&path)?;

        manifest.begin_version("doc", "raw/doc.pdf", "h1")?;
        manifest.record_stage("doc", Stage::Extracted, "h1")?;
        let lines = line_count(&path);

        assert!(!manifest.begin_version("doc", "raw/doc.pdf", "h1")?);
        assert!(!manifest.record_stage("doc", Stage::Extracted, "h1")?);
        manifest.update("doc", "h1", |entry| entry.page_count = 0)?;

        assert_eq!(line_count(&path), lines);
        Ok(())
    }

    #[test]
    fn entries_survive_reopen_and_last_line_wins() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("manifest.jsonl");

        {
            let mut manifest = Manifest::open(&path)?;
            manifest.begin_version("doc", "raw/doc.pdf", "h1")?;
            manifest.record_stage("doc", Stage::Extracted, "h1")?;
            manifest.update("doc", "h1", |entry| entry.page_count = 7)?;
        }

        let reopened = Manifest::open(&path)?;
        let entry = reopened.get("doc").ok_or("missing entry")?;
        assert_eq!(entry.page_count, 7);
        assert!(entry.stages.is_complete(Stage::Extracted));
        assert_eq!(entry.source_path, "raw/doc.pdf");
        Ok(())
    }

    #[test]
    fn new_version_resets_stages_and_marks_vectors_stale() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let mut manifest = Manifest::open(dir.path().join("manifest.jsonl"))?;

        manifest.begin_version("doc", "raw/doc.pdf", "h1")?;
        for stage in Stage::ALL {
            manifest.record_stage("doc", stage, "h1")?;
        }
        manifest.update("doc", "h1", |entry| entry.indexed_vectors = 4)?;

        assert!(manifest.begin_version("doc", "raw/doc.pdf", "h2")?);
        let entry = manifest.get("doc").ok_or("missing entry")?;
        assert_eq!(entry.content_hash, "h2");
        assert_eq!(entry.stale_vectors, 4);
        assert_eq!(entry.indexed_vectors, 0);
        assert!(!entry.stages.is_complete(Stage::Extracted));
        Ok(())
    }

    #[test]
    fn corrupt_lines_are_ignored() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manifest.jsonl");
        {
            let mut manifest = Manifest::open(&path)?;
            manifest.begin_version("doc", "raw/doc.pdf", "h1")?;
        }
        let mut file = OpenOptions::new().append(true).open(&path)?;
        writeln!(file, "{{not json")?;

        let manifest = Manifest::open(&path)?;
        assert_eq!(manifest.len(), 1);
        Ok(())
    }

    #[test]
    fn failures_clear_once_the_stage_succeeds() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut manifest = Manifest::open(dir.path().join("manifest.jsonl"))?;

        manifest.begin_version("doc", "raw/doc.pdf", "h1")?;
        manifest.record_failure("doc", "h1", Stage::Embedded, "rate limited")?;
        assert_eq!(manifest.summary().failed, 1);

        manifest.record_stage("doc", Stage::Embedded, "h1")?;
        assert!(manifest.get("doc").ok_or("missing entry")?.failure.is_none());
        Ok(())
    }

    #[test]
    fn compact_keeps_one_line_per_document() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manifest.jsonl");
        let mut manifest = Manifest::open(&path)?;

        for id in ["a", "b"] {
            manifest.begin_version(id, "raw/x.pdf", "h1")?;
            for stage in Stage::ALL {
                manifest.record_stage(id, stage, "h1")?;
            }
        }
        manifest.compact()?;

        assert_eq!(line_count(&path), 2);
        assert_eq!(Manifest::open(&path)?.summary().complete, 2);
        Ok(())
    }
}
