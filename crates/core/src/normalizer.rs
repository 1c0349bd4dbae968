//! Page text cleanup ahead of chunking.
//!
//! Repeated running headers and footers are detected by comparing the first
//! and last few lines of every page. Lines are compared through a key that
//! ignores case, spacing and digits, so `Page 3 of 10` and `Page 4 of 10`
//! count as the same footer.

use crate::error::IngestError;
use crate::models::{NormalizedDocument, PageOffset, PageText};
use regex::Regex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizerConfig {
    /// Non-empty lines at the top and bottom of a page inspected for repeats.
    pub edge_lines: usize,
    /// Share of pages a line must appear on to be treated as header/footer.
    pub repeat_fraction: f64,
    /// Documents shorter than this keep all their lines.
    pub min_pages_for_detection: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            edge_lines: 2,
            repeat_fraction: 0.5,
            min_pages_for_detection: 3,
        }
    }
}

pub struct Normalizer {
    config: NormalizerConfig,
    hyphenation_re: Regex,
    paragraph_re: Regex,
    digits_re: Regex,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Result<Self, IngestError> {
        if !(0.0..=1.0).contains(&config.repeat_fraction) {
            return Err(IngestError::InvalidArgument(format!(
                "repeat_fraction must be within [0, 1], got {}",
                config.repeat_fraction
            )));
        }

        Ok(Self {
            config,
            hyphenation_re: Regex::new(r"(\w)-[ \t]*\r?\n[ \t]*(\p{Ll})")?,
            paragraph_re: Regex::new(r"\n\s*\n")?,
            digits_re: Regex::new(r"\d+")?,
        })
    }

    pub fn normalize(&self, pages: &[PageText]) -> NormalizedDocument {
        let repeated = self.detect_repeated_lines(pages);
        let mut text = String::new();
        let mut page_offsets = Vec::new();

        for page in pages {
            let stripped = self.strip_edges(&page.text, &repeated);
            let cleaned = self.clean_page(&stripped);
            if cleaned.is_empty() {
                continue;
            }

            if !text.is_empty() {
                text.push_str("\n\n");
            }
            page_offsets.push(PageOffset {
                page: page.number,
                offset: text.len(),
            });
            text.push_str(&cleaned);
        }

        NormalizedDocument { text, page_offsets }
    }

    /// Keys of lines that repeat in the edge zone of enough pages.
    pub fn detect_repeated_lines(&self, pages: &[PageText]) -> HashSet<String> {
        if pages.len() < self.config.min_pages_for_detection.max(1) {
            return HashSet::new();
        }

        let mut counts = HashMap::<String, usize>::new();
        for page in pages {
            let lines = non_empty_lines(&page.text);
            let keys = edge_indices(lines.len(), self.config.edge_lines)
                .into_iter()
                .map(|index| self.line_key(lines[index]))
                .collect::<HashSet<_>>();

            for key in keys {
                *counts.entry(key).or_default() += 1;
            }
        }

        let total = pages.len() as f64;
        counts
            .into_iter()
            .filter(|(_, count)| *count as f64 / total >= self.config.repeat_fraction)
            .map(|(key, _)| key)
            .collect()
    }

    fn strip_edges(&self, text: &str, repeated: &HashSet<String>) -> String {
        if repeated.is_empty() {
            return text.to_string();
        }

        let lines = text.lines().collect::<Vec<_>>();
        let non_empty = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, _)| index)
            .collect::<Vec<_>>();

        let dropped = edge_indices(non_empty.len(), self.config.edge_lines)
            .into_iter()
            .map(|position| non_empty[position])
            .filter(|index| repeated.contains(&self.line_key(lines[*index])))
            .collect::<HashSet<_>>();

        lines
            .iter()
            .enumerate()
            .filter(|(index, _)| !dropped.contains(index))
            .map(|(_, line)| *line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn clean_page(&self, text: &str) -> String {
        let dehyphenated = self.hyphenation_re.replace_all(text, "$1$2");
        self.paragraph_re
            .split(&dehyphenated)
            .map(|paragraph| paragraph.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|paragraph| !paragraph.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn line_key(&self, line: &str) -> String {
        let collapsed = line
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        self.digits_re.replace_all(&collapsed, "#").into_owned()
    }
}

fn non_empty_lines(text: &str) -> Vec<&str> {
    text.lines().filter(|line| !line.trim().is_empty()).collect()
}

fn edge_indices(len: usize, edge: usize) -> Vec<usize> {
    let head = edge.min(len);
    let tail_start = len.saturating_sub(edge).max(head);
    (0..head).chain(tail_start..len).collect()
}
