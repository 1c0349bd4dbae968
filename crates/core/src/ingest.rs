//! Input discovery and the on-disk layout of intermediate artifacts.

use crate::{Chunk, EmbeddingRecord, ExtractedDocument, IngestError, NormalizedDocument, PageOffset};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    loop {
        let buffer = reader.fill_buf()?;
        if buffer.is_empty() {
            break;
        }
        hasher.update(buffer);
        let consumed = buffer.len();
        reader.consume(consumed);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// File stem with everything but ASCII alphanumerics, `-` and `_` replaced.
pub fn document_id_for(path: &Path) -> Result<String, IngestError> {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.trim().is_empty())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;

    Ok(stem
        .trim()
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || character == '-' || character == '_' {
                character
            } else {
                '_'
            }
        })
        .collect())
}

/// `data_dir` layout:
/// `extracted/{id}.pages.json`, `normalized/{id}.txt`,
/// `normalized/{id}.offsets.json`, `chunks/{id}.jsonl`,
/// `embeddings/{id}.jsonl` and `manifest.jsonl`.
#[derive(Debug, Clone)]
pub struct Workspace {
    input_dir: PathBuf,
    data_dir: PathBuf,
}

impl Workspace {
    pub fn new(data_dir: impl Into<PathBuf>, input_dir: Option<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            input_dir: input_dir.unwrap_or_else(|| data_dir.join("raw")),
            data_dir,
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn prepare(&self) -> Result<(), IngestError> {
        for dir in ["extracted", "normalized", "chunks", "embeddings"] {
            fs::create_dir_all(self.data_dir.join(dir))?;
        }
        Ok(())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("manifest.jsonl")
    }

    pub fn extracted_path(&self, document_id: &str) -> PathBuf {
        self.data_dir
            .join("extracted")
            .join(format!("{document_id}.pages.json"))
    }

    pub fn normalized_text_path(&self, document_id: &str) -> PathBuf {
        self.data_dir
            .join("normalized")
            .join(format!("{document_id}.txt"))
    }

    pub fn normalized_offsets_path(&self, document_id: &str) -> PathBuf {
        self.data_dir
            .join("normalized")
            .join(format!("{document_id}.offsets.json"))
    }

    pub fn chunks_path(&self, document_id: &str) -> PathBuf {
        self.data_dir
            .join("chunks")
            .join(format!("{document_id}.jsonl"))
    }

    pub fn embeddings_path(&self, document_id: &str) -> PathBuf {
        self.data_dir
            .join("embeddings")
            .join(format!("{document_id}.jsonl"))
    }

    pub fn write_extracted(&self, extracted: &ExtractedDocument) -> Result<(), IngestError> {
        let path = self.extracted_path(&extracted.document.document_id);
        write_atomic(&path, serde_json::to_string_pretty(extracted)?.as_bytes())
    }

    pub fn read_extracted(&self, document_id: &str) -> Result<ExtractedDocument, IngestError> {
        let contents = fs::read_to_string(self.extracted_path(document_id))?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn write_normalized(
        &self,
        document_id: &str,
        normalized: &NormalizedDocument,
    ) -> Result<(), IngestError> {
        write_atomic(
            &self.normalized_offsets_path(document_id),
            serde_json::to_string(&normalized.page_offsets)?.as_bytes(),
        )?;
        write_atomic(
            &self.normalized_text_path(document_id),
            normalized.text.as_bytes(),
        )
    }

    pub fn read_normalized(&self, document_id: &str) -> Result<NormalizedDocument, IngestError> {
        let text = fs::read_to_string(self.normalized_text_path(document_id))?;
        let offsets = fs::read_to_string(self.normalized_offsets_path(document_id))?;
        let page_offsets: Vec<PageOffset> = serde_json::from_str(&offsets)?;
        Ok(NormalizedDocument { text, page_offsets })
    }

    pub fn write_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), IngestError> {
        write_jsonl(&self.chunks_path(document_id), chunks)
    }

    pub fn read_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, IngestError> {
        read_jsonl(&self.chunks_path(document_id))
    }

    pub fn write_embeddings(
        &self,
        document_id: &str,
        records: &[EmbeddingRecord],
    ) -> Result<(), IngestError> {
        write_jsonl(&self.embeddings_path(document_id), records)
    }

    pub fn read_embeddings(&self, document_id: &str) -> Result<Vec<EmbeddingRecord>, IngestError> {
        read_jsonl(&self.embeddings_path(document_id))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

pub fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("jsonl.tmp");
    {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        for item in items {
            serde_json::to_writer(&mut writer, item)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, IngestError> {
    let reader = BufReader::new(File::open(path)?);
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        items.push(serde_json::from_str(&line)?);
    }
    Ok(items)
}
