use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Raw text of one PDF page, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub source_path: String,
    pub content_hash: String,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
    pub extracted_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn source_file(&self) -> &str {
        std::path::Path::new(&self.source_path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.source_path)
    }
}

/// Contents of `extracted/{id}.pages.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub document: DocumentRecord,
    pub pages: Vec<PageText>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOffset {
    pub page: u32,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedDocument {
    pub text: String,
    pub page_offsets: Vec<PageOffset>,
}

impl NormalizedDocument {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Page containing the byte at `offset`.
    pub fn page_at(&self, offset: usize) -> Option<u32> {
        let index = self
            .page_offsets
            .partition_point(|entry| entry.offset <= offset);
        if index == 0 {
            self.page_offsets.first().map(|entry| entry.page)
        } else {
            Some(self.page_offsets[index - 1].page)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub sequence: usize,
    pub token_start: usize,
    pub token_end: usize,
    pub token_count: usize,
    pub page_start: u32,
    pub page_end: u32,
    pub overlaps_previous: bool,
    pub text: String,
}

pub fn chunk_id(document_id: &str, sequence: usize) -> String {
    format!("{document_id}-{sequence}")
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub source_file: String,
    pub page_start: u32,
    pub page_end: u32,
    pub title: String,
    pub date: Option<String>,
    pub sequence: usize,
    pub token_count: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

impl EmbeddingRecord {
    pub fn from_chunk(
        chunk: &Chunk,
        document: &DocumentRecord,
        vector: Vec<f32>,
        metadata_text_chars: usize,
    ) -> Self {
        Self {
            id: chunk.id.clone(),
            vector,
            metadata: ChunkMetadata {
                document_id: chunk.document_id.clone(),
                source_file: document.source_file().to_string(),
                page_start: chunk.page_start,
                page_end: chunk.page_end,
                title: document.metadata.title.clone(),
                date: document.metadata.date.clone(),
                sequence: chunk.sequence,
                token_count: chunk.token_count,
                text: chunk.text.chars().take(metadata_text_chars).collect(),
            },
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub document_id: Option<String>,
    pub source_file: Option<String>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.source_file.is_none()
    }

    /// `(field, value)` pairs that must all match.
    pub fn conditions(&self) -> Vec<(&'static str, &str)> {
        let mut conditions = Vec::new();
        if let Some(document_id) = &self.document_id {
            conditions.push(("document_id", document_id.as_str()));
        }
        if let Some(source_file) = &self.source_file {
            conditions.push(("source_file", source_file.as_str()));
        }
        conditions
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub vector: Vec<f32>,
    pub top_k: usize,
    pub filter: MetadataFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    pub id: String,
    pub score: f64,
    pub metadata: Option<ChunkMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub dimension: usize,
    pub total_vectors: u64,
}
