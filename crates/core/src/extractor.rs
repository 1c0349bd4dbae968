use crate::error::IngestError;
use crate::models::{DocumentMetadata, PageText};
use lopdf::Document;
use regex::RegexBuilder;
use std::path::Path;

const MAX_TITLE_CHARS: usize = 200;

const DATE_PATTERN: &str = r"\b\d{1,2}\s+(?:jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?,?\s+\d{4}\b|\b\d{4}-\d{2}-\d{2}\b";

pub trait PdfExtractor: Send + Sync {
    /// Text of every page in order, including pages with no text.
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(format!("page {page_no}: {error}")))?;
            pages.push(PageText {
                number: page_no,
                text,
            });
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf has no pages: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Best-effort title and date taken from the first page that has text.
pub fn document_metadata(pages: &[PageText]) -> Result<DocumentMetadata, IngestError> {
    let Some(first) = pages.iter().find(|page| !page.text.trim().is_empty()) else {
        return Ok(DocumentMetadata::default());
    };

    let title = first
        .text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(MAX_TITLE_CHARS).collect())
        .unwrap_or_default();

    let date_re = RegexBuilder::new(DATE_PATTERN)
        .case_insensitive(true)
        .build()?;
    let date = date_re
        .find(&first.text)
        .map(|found| found.as_str().to_string());

    Ok(DocumentMetadata { title, date })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn page(number: u32, text: &str) -> PageText {
        PageText {
            number,
            text: text.to_string(),
        }
    }

    #[test]
    fn title_is_first_non_empty_line() -> Result<(), IngestError> {
        let pages = vec![
            page(1, "   \n"),
            page(2, "\n  State v. Sharma  \nDecided on 14 March 2019\n"),
        ];

        let metadata = document_metadata(&pages)?;
        assert_eq!(metadata.title, "State v. Sharma");
        assert_eq!(metadata.date.as_deref(), Some("14 March 2019"));
        Ok(())
    }

    #[test]
    fn iso_dates_are_recognized() -> Result<(), IngestError> {
        let metadata = document_metadata(&[page(1, "Circular\nIssued 2021-07-01 by the registry")])?;
        assert_eq!(metadata.date.as_deref(), Some("2021-07-01"));
        Ok(())
    }

    #[test]
    fn blank_documents_have_empty_metadata() -> Result<(), IngestError> {
        let metadata = document_metadata(&[page(1, "")])?;
        assert_eq!(metadata, DocumentMetadata::default());
        Ok(())
    }

    #[test]
    fn corrupt_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = LopdfExtractor.extract_pages(&path);
        assert!(matches!(result, Err(IngestError::PdfParse(_))));
        Ok(())
    }
}
