//! Per-document pipeline: extract, normalize, chunk, embed, upsert.
//!
//! Every stage consults the manifest first. A stage that is already
//! complete for the current content hash reloads its artifact from the
//! workspace instead of running again, so an interrupted run resumes where
//! it stopped and a finished document costs nothing on the next run.

use crate::chunking::Chunker;
use crate::config::PipelineConfig;
use crate::embeddings::Embedder;
use crate::error::{IngestError, PipelineError, ServiceError};
use crate::extractor::{document_metadata, PdfExtractor};
use crate::ingest::{digest_file, discover_pdf_files, document_id_for, Workspace};
use crate::manifest::{Manifest, ManifestSummary, Stage, StageStatus};
use crate::models::{
    chunk_id, Chunk, DocumentRecord, EmbeddingRecord, ExtractedDocument, IndexStats,
    NormalizedDocument,
};
use crate::normalizer::Normalizer;
use crate::retry::{RateLimiter, RetryPolicy};
use crate::traits::VectorStore;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDocument {
    pub document_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDocument {
    pub document_id: String,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: Vec<String>,
    pub unchanged: Vec<String>,
    pub skipped: Vec<SkippedDocument>,
    pub failed: Vec<FailedDocument>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.unchanged.len() + self.skipped.len() + self.failed.len()
    }
}

#[derive(Debug)]
enum DocumentOutcome {
    Indexed { chunks: usize },
    Unchanged,
    Skipped(String),
}

/// A document error tagged with the stage it happened in.
#[derive(Debug)]
struct StageError {
    stage: Stage,
    error: PipelineError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageError>;
}

impl<T, E: Into<PipelineError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|error| StageError {
            stage,
            error: error.into(),
        })
    }
}

struct SourceDocument {
    document_id: String,
    path: PathBuf,
    source_path: String,
    content_hash: String,
}

pub struct Pipeline {
    workspace: Workspace,
    normalizer: Normalizer,
    chunker: Chunker,
    extractor: Arc<dyn PdfExtractor>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    manifest: Mutex<Manifest>,
    retry: RetryPolicy,
    limiter: RateLimiter,
    embed_batch_size: usize,
    upsert_batch_size: usize,
    metadata_text_chars: usize,
    workers: usize,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        extractor: Arc<dyn PdfExtractor>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let workspace = Workspace::new(&config.data_dir, config.input_dir.clone());
        workspace.prepare()?;
        let manifest = Manifest::open(workspace.manifest_path())?;

        Ok(Self {
            normalizer: Normalizer::new(config.normalizer)?,
            chunker: Chunker::new(config.chunking)?,
            workspace,
            extractor,
            embedder,
            store,
            manifest: Mutex::new(manifest),
            retry: config.retry,
            limiter: config.rate_limiter(),
            embed_batch_size: config.embedding.batch_size,
            upsert_batch_size: config.store.upsert_batch_size,
            metadata_text_chars: config.store.metadata_text_chars,
            workers: config.workers,
        })
    }

    pub async fn manifest_summary(&self) -> ManifestSummary {
        self.manifest.lock().await.summary()
    }

    /// Fails with `DimensionMismatch` when the embedder and the index disagree.
    pub async fn check_dimensions(&self) -> Result<IndexStats, PipelineError> {
        let store = &self.store;
        let limiter = &self.limiter;
        let stats = self
            .retry
            .run("describe index", || async move {
                limiter.acquire().await;
                store.describe().await
            })
            .await?;

        if stats.dimension != self.embedder.dimensions() {
            return Err(ServiceError::DimensionMismatch {
                expected: stats.dimension,
                actual: self.embedder.dimensions(),
            }
            .into());
        }
        Ok(stats)
    }

    /// Processes every PDF under the input directory.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let files = discover_pdf_files(self.workspace.input_dir());
        self.run_files(&files).await
    }

    /// Processes `files`. Per-document failures end up in the summary;
    /// configuration, manifest and dimension errors abort the run.
    pub async fn run_files(&self, files: &[PathBuf]) -> Result<RunSummary, PipelineError> {
        let stats = self.check_dimensions().await?;
        info!(
            files = files.len(),
            backend = self.store.backend(),
            model = self.embedder.model(),
            dimension = stats.dimension,
            indexed = stats.total_vectors,
            "starting ingestion run"
        );

        let mut summary = RunSummary::default();
        let mut sources = Vec::new();
        let mut seen = HashSet::new();
        for path in files {
            let document_id = match document_id_for(path) {
                Ok(document_id) => document_id,
                Err(error) => {
                    warn!(path = %path.display(), %error, "no document id, skipping");
                    summary.skipped.push(SkippedDocument {
                        document_id: path.display().to_string(),
                        reason: error.to_string(),
                    });
                    continue;
                }
            };
            if !seen.insert(document_id.clone()) {
                warn!(document_id = %document_id, path = %path.display(), "duplicate document id, skipping");
                summary.skipped.push(SkippedDocument {
                    document_id,
                    reason: format!("duplicate document id for {}", path.display()),
                });
                continue;
            }
            match digest_file(path) {
                Ok(content_hash) => sources.push(SourceDocument {
                    document_id,
                    path: path.clone(),
                    source_path: path.display().to_string(),
                    content_hash,
                }),
                Err(error) => {
                    warn!(document_id = %document_id, path = %path.display(), %error, "cannot read source file, skipping");
                    summary.skipped.push(SkippedDocument {
                        document_id,
                        reason: error.to_string(),
                    });
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let aborted = AtomicBool::new(false);
        let tasks = sources.iter().map(|source| {
            let semaphore = Arc::clone(&semaphore);
            let aborted = &aborted;
            async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if aborted.load(Ordering::SeqCst) {
                    return None;
                }
                let result = self.process(source).await;
                if matches!(&result, Err(failure) if failure.error.is_fatal()) {
                    aborted.store(true, Ordering::SeqCst);
                }
                Some((source, result))
            }
        });

        let mut fatal = None;
        for (source, result) in join_all(tasks).await.into_iter().flatten() {
            let document_id = source.document_id.clone();
            match result {
                Ok(DocumentOutcome::Indexed { chunks }) => {
                    info!(document_id = %document_id, chunks, "document indexed");
                    summary.succeeded.push(document_id);
                }
                Ok(DocumentOutcome::Unchanged) => summary.unchanged.push(document_id),
                Ok(DocumentOutcome::Skipped(reason)) => {
                    summary.skipped.push(SkippedDocument { document_id, reason })
                }
                Err(failure) if failure.error.is_fatal() => {
                    error!(document_id = %document_id, stage = %failure.stage, error = %failure.error, "aborting run");
                    if fatal.is_none() {
                        fatal = Some(failure.error);
                    }
                }
                Err(failure) => match self.settle_failure(source, failure).await? {
                    Ok(skipped) => summary.skipped.push(skipped),
                    Err(failed) => summary.failed.push(failed),
                },
            }
        }

        if let Some(error) = fatal {
            return Err(error);
        }

        info!(
            succeeded = summary.succeeded.len(),
            unchanged = summary.unchanged.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "ingestion run finished"
        );
        Ok(summary)
    }

    /// Unreadable and textless documents are skipped; anything else is a
    /// failure at the stage it happened in.
    async fn settle_failure(
        &self,
        source: &SourceDocument,
        failure: StageError,
    ) -> Result<Result<SkippedDocument, FailedDocument>, PipelineError> {
        let reason = failure.error.to_string();

        match failure.error {
            PipelineError::Ingest(IngestError::PdfParse(_) | IngestError::EmptyDocument(_)) => {
                warn!(document_id = %source.document_id, stage = %failure.stage, %reason, "skipping document");
                if let Err(purge) = self.purge_stale(source).await {
                    warn!(document_id = %source.document_id, error = %purge.error, "superseded vectors left in index");
                }
                self.manifest.lock().await.record_skipped(
                    &source.document_id,
                    &source.content_hash,
                    reason.clone(),
                )?;
                Ok(Ok(SkippedDocument {
                    document_id: source.document_id.clone(),
                    reason,
                }))
            }
            _ => {
                error!(document_id = %source.document_id, stage = %failure.stage, %reason, "document failed");
                self.manifest.lock().await.record_failure(
                    &source.document_id,
                    &source.content_hash,
                    failure.stage,
                    reason.clone(),
                )?;
                Ok(Err(FailedDocument {
                    document_id: source.document_id.clone(),
                    stage: failure.stage,
                    reason,
                }))
            }
        }
    }

    async fn process(&self, source: &SourceDocument) -> Result<DocumentOutcome, StageError> {
        let document_id = source.document_id.as_str();

        let stages = {
            let mut manifest = self.manifest.lock().await;
            let changed = manifest
                .begin_version(document_id, &source.source_path, &source.content_hash)
                .at(Stage::Extracted)?;
            let Some(entry) = manifest.get(document_id) else {
                return Err(IngestError::Manifest(format!("no entry for {document_id}")))
                    .at(Stage::Extracted);
            };
            if entry.is_complete() {
                debug!(document_id, "unchanged, already indexed");
                return Ok(DocumentOutcome::Unchanged);
            }
            if let Some(reason) = &entry.skipped {
                debug!(document_id, %reason, "unchanged, previously skipped");
                return Ok(DocumentOutcome::Skipped(reason.clone()));
            }
            if changed {
                info!(document_id, hash = %source.content_hash, "processing new version");
            } else {
                info!(document_id, "resuming unfinished document");
            }
            entry.stages.clone()
        };

        let extracted = match reuse(&stages, Stage::Extracted, document_id, || {
            self.workspace.read_extracted(document_id)
        }) {
            Some(extracted) => extracted,
            None => self.extract(source).await?,
        };

        let normalized = match reuse(&stages, Stage::Normalized, document_id, || {
            self.workspace.read_normalized(document_id)
        }) {
            Some(normalized) => normalized,
            None => self.normalize(source, &extracted).await?,
        };

        let chunks = match reuse(&stages, Stage::Chunked, document_id, || {
            self.workspace.read_chunks(document_id)
        }) {
            Some(chunks) if !chunks.is_empty() => chunks,
            _ => self.chunk(source, &normalized).await?,
        };

        let records = match reuse(&stages, Stage::Embedded, document_id, || {
            self.workspace.read_embeddings(document_id)
        }) {
            Some(records) if records.len() == chunks.len() => records,
            _ => self.embed(source, &extracted.document, &chunks).await?,
        };

        if !stages.is_complete(Stage::Upserted) {
            self.upsert(source, &records).await?;
        }

        Ok(DocumentOutcome::Indexed {
            chunks: chunks.len(),
        })
    }

    async fn extract(&self, source: &SourceDocument) -> Result<ExtractedDocument, StageError> {
        let extractor = Arc::clone(&self.extractor);
        let path = source.path.clone();
        let pages = tokio::task::spawn_blocking(move || extractor.extract_pages(&path))
            .await
            .map_err(|error| IngestError::Io(std::io::Error::other(error)))
            .at(Stage::Extracted)?
            .at(Stage::Extracted)?;

        let metadata = document_metadata(&pages).at(Stage::Extracted)?;
        let extracted = ExtractedDocument {
            document: DocumentRecord {
                document_id: source.document_id.clone(),
                source_path: source.source_path.clone(),
                content_hash: source.content_hash.clone(),
                page_count: pages.len(),
                metadata,
                extracted_at: Utc::now(),
            },
            pages,
        };
        self.workspace
            .write_extracted(&extracted)
            .at(Stage::Extracted)?;

        let document = &extracted.document;
        let mut manifest = self.manifest.lock().await;
        manifest
            .update(&source.document_id, &source.content_hash, |entry| {
                entry.page_count = document.page_count;
                entry.title = Some(document.metadata.title.clone()).filter(|title| !title.is_empty());
                entry.date = document.metadata.date.clone();
            })
            .at(Stage::Extracted)?;
        manifest
            .record_stage(&source.document_id, Stage::Extracted, &source.content_hash)
            .at(Stage::Extracted)?;
        info!(document_id = %source.document_id, stage = %Stage::Extracted, pages = document.page_count, "stage complete");
        Ok(extracted)
    }

    async fn normalize(
        &self,
        source: &SourceDocument,
        extracted: &ExtractedDocument,
    ) -> Result<NormalizedDocument, StageError> {
        let normalized = self.normalizer.normalize(&extracted.pages);
        if normalized.is_empty() {
            return Err(IngestError::EmptyDocument(source.document_id.clone()))
                .at(Stage::Normalized);
        }

        self.workspace
            .write_normalized(&source.document_id, &normalized)
            .at(Stage::Normalized)?;
        self.manifest
            .lock()
            .await
            .record_stage(&source.document_id, Stage::Normalized, &source.content_hash)
            .at(Stage::Normalized)?;
        info!(document_id = %source.document_id, stage = %Stage::Normalized, chars = normalized.text.len(), "stage complete");
        Ok(normalized)
    }

    async fn chunk(
        &self,
        source: &SourceDocument,
        normalized: &NormalizedDocument,
    ) -> Result<Vec<Chunk>, StageError> {
        let chunks = self.chunker.chunk(&source.document_id, normalized);
        if chunks.is_empty() {
            return Err(IngestError::EmptyDocument(source.document_id.clone())).at(Stage::Chunked);
        }

        self.workspace
            .write_chunks(&source.document_id, &chunks)
            .at(Stage::Chunked)?;

        let mut manifest = self.manifest.lock().await;
        manifest
            .update(&source.document_id, &source.content_hash, |entry| {
                entry.chunk_count = chunks.len();
            })
            .at(Stage::Chunked)?;
        manifest
            .record_stage(&source.document_id, Stage::Chunked, &source.content_hash)
            .at(Stage::Chunked)?;
        info!(document_id = %source.document_id, stage = %Stage::Chunked, chunks = chunks.len(), "stage complete");
        Ok(chunks)
    }

    async fn embed(
        &self,
        source: &SourceDocument,
        document: &DocumentRecord,
        chunks: &[Chunk],
    ) -> Result<Vec<EmbeddingRecord>, StageError> {
        let expected = self.embedder.dimensions();
        let mut records = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.embed_batch_size) {
            let texts = batch
                .iter()
                .map(|chunk| chunk.text.clone())
                .collect::<Vec<_>>();
            let embedder = &self.embedder;
            let limiter = &self.limiter;
            let inputs = &texts;
            let vectors = self
                .retry
                .run("embed", || async move {
                    limiter.acquire().await;
                    embedder.embed_batch(inputs).await
                })
                .await
                .at(Stage::Embedded)?;

            if vectors.len() != batch.len() {
                return Err(ServiceError::Request(format!(
                    "embedder returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )))
                .at(Stage::Embedded);
            }

            for (chunk, vector) in batch.iter().zip(vectors) {
                if vector.len() != expected {
                    return Err(ServiceError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    })
                    .at(Stage::Embedded);
                }
                records.push(EmbeddingRecord::from_chunk(
                    chunk,
                    document,
                    vector,
                    self.metadata_text_chars,
                ));
            }
            debug!(document_id = %source.document_id, embedded = records.len(), total = chunks.len(), "embedded batch");
        }

        self.workspace
            .write_embeddings(&source.document_id, &records)
            .at(Stage::Embedded)?;
        self.manifest
            .lock()
            .await
            .record_stage(&source.document_id, Stage::Embedded, &source.content_hash)
            .at(Stage::Embedded)?;
        info!(document_id = %source.document_id, stage = %Stage::Embedded, vectors = records.len(), "stage complete");
        Ok(records)
    }

    /// Deletes the vectors of a superseded version.
    async fn purge_stale(&self, source: &SourceDocument) -> Result<(), StageError> {
        let document_id = source.document_id.as_str();
        let store = &self.store;
        let limiter = &self.limiter;

        let stale = {
            let manifest = self.manifest.lock().await;
            manifest
                .get(document_id)
                .map_or(0, |entry| entry.stale_vectors)
        };
        if stale == 0 {
            return Ok(());
        }

        let stale_ids = (0..stale)
            .map(|sequence| chunk_id(document_id, sequence))
            .collect::<Vec<_>>();
        for batch in stale_ids.chunks(self.upsert_batch_size) {
            self.retry
                .run("delete stale vectors", || async move {
                    limiter.acquire().await;
                    store.delete(batch).await
                })
                .await
                .at(Stage::Upserted)?;
        }
        self.manifest
            .lock()
            .await
            .update(document_id, &source.content_hash, |entry| {
                entry.stale_vectors = 0;
            })
            .at(Stage::Upserted)?;
        info!(document_id, deleted = stale, "removed superseded vectors");
        Ok(())
    }

    async fn upsert(
        &self,
        source: &SourceDocument,
        records: &[EmbeddingRecord],
    ) -> Result<(), StageError> {
        let document_id = source.document_id.as_str();
        let store = &self.store;
        let limiter = &self.limiter;

        self.purge_stale(source).await?;

        // Written before the first batch so a partial upsert is still
        // deleted when this version is superseded.
        self.manifest
            .lock()
            .await
            .update(document_id, &source.content_hash, |entry| {
                entry.indexed_vectors = entry.indexed_vectors.max(records.len());
            })
            .at(Stage::Upserted)?;

        for batch in records.chunks(self.upsert_batch_size) {
            self.retry
                .run("upsert", || async move {
                    limiter.acquire().await;
                    store.upsert(batch).await
                })
                .await
                .at(Stage::Upserted)?;
        }

        let mut manifest = self.manifest.lock().await;
        manifest
            .update(document_id, &source.content_hash, |entry| {
                entry.indexed_vectors = records.len();
            })
            .at(Stage::Upserted)?;
        manifest
            .record_stage(document_id, Stage::Upserted, &source.content_hash)
            .at(Stage::Upserted)?;
        info!(document_id, stage = %Stage::Upserted, vectors = records.len(), "stage complete");
        Ok(())
    }
}

/// Loads the artifact of a stage that is already complete. A missing or
/// unreadable artifact means the stage runs again.
fn reuse<T>(
    stages: &StageStatus,
    stage: Stage,
    document_id: &str,
    load: impl FnOnce() -> Result<T, IngestError>,
) -> Option<T> {
    if !stages.is_complete(stage) {
        return None;
    }
    match load() {
        Ok(artifact) => Some(artifact),
        Err(error) => {
            warn!(document_id, %stage, %error, "stored artifact unavailable, rerunning stage");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_keep_their_stage() {
        let result: Result<(), ServiceError> = Err(ServiceError::Request("boom".to_string()));
        let failure = result.at(Stage::Embedded).err();
        assert!(matches!(
            failure,
            Some(StageError {
                stage: Stage::Embedded,
                error: PipelineError::Service(ServiceError::Request(_)),
            })
        ));
    }

    #[test]
    fn completed_stages_reuse_their_artifacts() {
        let stages = StageStatus {
            extracted: Some(Utc::now()),
            ..StageStatus::default()
        };

        assert_eq!(reuse(&stages, Stage::Extracted, "doc", || Ok(7)), Some(7));
        assert_eq!(reuse(&stages, Stage::Normalized, "doc", || Ok(7)), None);
        assert_eq!(
            reuse::<u32>(&stages, Stage::Extracted, "doc", || Err(IngestError::Manifest(
                "gone".to_string()
            ))),
            None
        );
    }

    #[test]
    fn summary_counts_every_outcome() {
        let summary = RunSummary {
            succeeded: vec!["a".to_string()],
            unchanged: vec!["b".to_string()],
            skipped: vec![SkippedDocument {
                document_id: "c".to_string(),
                reason: "empty".to_string(),
            }],
            failed: Vec::new(),
        };
        assert_eq!(summary.total(), 3);
    }
}
