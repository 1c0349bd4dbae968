use crate::error::ConfigError;
use crate::models::{chunk_id, Chunk, NormalizedDocument};
use crate::tokenizer::{Token, Tokenizer, WhitespaceTokenizer};
use std::ops::Range;

pub const DEFAULT_SENTENCE_TERMINATORS: &[char] = &['.', '!', '?'];

const CLOSING_PUNCTUATION: &[char] = &['"', '\'', ')', ']', '\u{201d}', '\u{2019}'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    pub max_tokens: usize,
    pub min_tokens: usize,
    pub overlap_tokens: usize,
    pub sentence_terminators: &'static [char],
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 600,
            max_tokens: 800,
            min_tokens: 50,
            overlap_tokens: 100,
            sentence_terminators: DEFAULT_SENTENCE_TERMINATORS,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name, details: String| Err(ConfigError::Invalid { name, details });

        if self.target_tokens == 0 {
            return invalid("target_tokens", "must be greater than zero".to_string());
        }
        if self.overlap_tokens >= self.target_tokens {
            return invalid(
                "overlap_tokens",
                format!(
                    "overlap {} must be smaller than target {}",
                    self.overlap_tokens, self.target_tokens
                ),
            );
        }
        if self.target_tokens > self.max_tokens {
            return invalid(
                "max_tokens",
                format!(
                    "max {} must be at least target {}",
                    self.max_tokens, self.target_tokens
                ),
            );
        }
        if self.min_tokens > self.target_tokens {
            return invalid(
                "min_tokens",
                format!(
                    "min {} must not exceed target {}",
                    self.min_tokens, self.target_tokens
                ),
            );
        }
        if self.max_tokens + self.overlap_tokens < 2 * self.min_tokens {
            return invalid(
                "min_tokens",
                format!(
                    "max + overlap ({}) must be at least twice min ({})",
                    self.max_tokens + self.overlap_tokens,
                    self.min_tokens
                ),
            );
        }

        Ok(())
    }
}

/// Token windows `[start, end)` covering `token_count` tokens.
///
/// `is_boundary(b)` reports whether a cut before token `b` ends a sentence.
/// Consecutive windows share exactly `overlap_tokens` tokens, no window is
/// longer than `max_tokens`, and only a sole window may be shorter than
/// `min_tokens`.
pub fn plan_windows(
    token_count: usize,
    config: &ChunkingConfig,
    is_boundary: impl Fn(usize) -> bool,
) -> Vec<Range<usize>> {
    let total = token_count;
    let mut windows = Vec::new();
    if total == 0 {
        return windows;
    }

    let mut cursor = 0;
    loop {
        let mut end = window_end(cursor, total, config, &is_boundary);

        if end < total {
            let tail = total - (end - config.overlap_tokens);
            if tail < config.min_tokens {
                end = if total - cursor <= config.max_tokens {
                    total
                } else {
                    total + config.overlap_tokens - config.min_tokens
                };
            }
        }

        windows.push(cursor..end);
        if end >= total {
            break;
        }
        cursor = end - config.overlap_tokens;
    }

    windows
}

fn window_end(
    cursor: usize,
    total: usize,
    config: &ChunkingConfig,
    is_boundary: &impl Fn(usize) -> bool,
) -> usize {
    let soft = cursor + config.target_tokens;
    if total <= soft {
        return total;
    }

    let hard = (cursor + config.max_tokens).min(total);
    (soft..=hard)
        .find(|&cut| cut == total || is_boundary(cut))
        .unwrap_or(hard)
}

pub struct Chunker<T = WhitespaceTokenizer> {
    config: ChunkingConfig,
    tokenizer: T,
}

impl Chunker<WhitespaceTokenizer> {
    pub fn new(config: ChunkingConfig) -> Result<Self, ConfigError> {
        Self::with_tokenizer(config, WhitespaceTokenizer)
    }
}

impl<T: Tokenizer> Chunker<T> {
    pub fn with_tokenizer(config: ChunkingConfig, tokenizer: T) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, tokenizer })
    }

    pub fn chunk(&self, document_id: &str, document: &NormalizedDocument) -> Vec<Chunk> {
        let text = document.text.as_str();
        let tokens = self.tokenizer.tokenize(text);
        let is_boundary =
            |cut: usize| ends_sentence(tokens[cut - 1].as_str(text), self.config.sentence_terminators);

        plan_windows(tokens.len(), &self.config, is_boundary)
            .into_iter()
            .enumerate()
            .map(|(sequence, window)| build_chunk(document_id, document, &tokens, sequence, window))
            .collect()
    }
}

fn build_chunk(
    document_id: &str,
    document: &NormalizedDocument,
    tokens: &[Token],
    sequence: usize,
    window: Range<usize>,
) -> Chunk {
    let first = tokens[window.start];
    let last = tokens[window.end - 1];

    Chunk {
        id: chunk_id(document_id, sequence),
        document_id: document_id.to_string(),
        sequence,
        token_start: window.start,
        token_end: window.end,
        token_count: window.len(),
        page_start: document.page_at(first.start).unwrap_or(1),
        page_end: document.page_at(last.start).unwrap_or(1),
        overlaps_previous: sequence > 0,
        text: document.text[first.start..last.end].to_string(),
    }
}

fn ends_sentence(token: &str, terminators: &[char]) -> bool {
    token
        .trim_end_matches(CLOSING_PUNCTUATION)
        .ends_with(terminators)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageOffset;

    fn config(target: usize, max: usize, min: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            target_tokens: target,
            max_tokens: max,
            min_tokens: min,
            overlap_tokens: overlap,
            ..ChunkingConfig::default()
        }
    }

    fn document_with_words(words: &[String]) -> NormalizedDocument {
        NormalizedDocument {
            text: words.join(" "),
            page_offsets: vec![PageOffset { page: 1, offset: 0 }],
        }
    }

    #[test]
    fn thousand_tokens_split_at_sentence_boundary() {
        let words = (0..1000)
            .map(|index| {
                if index == 699 {
                    "end.".to_string()
                } else {
                    format!("w{index}")
                }
            })
            .collect::<Vec<_>>();

        let chunker = Chunker::new(config(600, 800, 50, 100)).expect("valid config");
        let chunks = chunker.chunk("doc", &document_with_words(&words));

        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].token_start, chunks[0].token_end), (0, 700));
        assert_eq!((chunks[1].token_start, chunks[1].token_end), (600, 1000));
        assert!(chunks[0].text.ends_with("end."));
        assert!(chunks[1].text.starts_with("w600 "));
        assert!(!chunks[0].overlaps_previous);
        assert!(chunks[1].overlaps_previous);
        assert_eq!(chunks[1].id, "doc-1");
    }

    #[test]
    fn no_boundary_cuts_exactly_at_max() {
        let windows = plan_windows(2000, &ChunkingConfig::default(), |_| false);
        assert_eq!(windows[0], 0..800);
        assert_eq!(windows[1], 700..1500);
        assert_eq!(windows[2], 1400..2000);
    }

    #[test]
    fn first_boundary_after_target_wins() {
        let windows = plan_windows(2000, &ChunkingConfig::default(), |cut| cut % 50 == 0);
        assert_eq!(windows[0], 0..600);
        assert_eq!(windows[1], 500..1100);
    }

    #[test]
    fn small_tail_merges_into_previous_chunk() {
        let cfg = config(600, 800, 50, 10);
        let windows = plan_windows(640, &cfg, |cut| cut == 610);
        assert_eq!(windows, vec![0..640]);
    }

    #[test]
    fn small_tail_pulls_previous_chunk_back_when_merge_would_exceed_max() {
        let cfg = config(600, 800, 50, 10);
        let windows = plan_windows(820, &cfg, |_| false);
        assert_eq!(windows, vec![0..780, 770..820]);
    }

    #[test]
    fn short_document_is_a_single_undersized_chunk() {
        let windows = plan_windows(12, &ChunkingConfig::default(), |_| false);
        assert_eq!(windows, vec![0..12]);
        assert!(plan_windows(0, &ChunkingConfig::default(), |_| false).is_empty());
    }

    #[test]
    fn windows_respect_bounds_and_overlap_for_many_lengths() {
        let configs = [config(20, 30, 8, 5), config(20, 27, 15, 3), config(10, 10, 4, 0)];

        for cfg in configs {
            cfg.validate().expect("test config is valid");
            for total in 1..400 {
                for boundary_every in [0usize, 3, 7, 23] {
                    let windows = plan_windows(total, &cfg, |cut| {
                        boundary_every != 0 && cut % boundary_every == 0
                    });

                    assert_eq!(windows[0].start, 0);
                    assert_eq!(windows[windows.len() - 1].end, total);
                    for window in &windows {
                        assert!(window.len() <= cfg.max_tokens, "{cfg:?} {total} {window:?}");
                        if windows.len() > 1 {
                            assert!(window.len() >= cfg.min_tokens, "{cfg:?} {total} {window:?}");
                        }
                    }
                    for pair in windows.windows(2) {
                        assert_eq!(pair[1].start, pair[0].end - cfg.overlap_tokens);
                        assert!(pair[1].end > pair[0].end);
                    }
                }
            }
        }
    }

    #[test]
    fn chunks_reproduce_text_without_loss() {
        let text = (0..900)
            .map(|index| {
                if index % 37 == 0 {
                    format!("s{index}.")
                } else {
                    format!("t{index}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        let document = NormalizedDocument {
            text: text.clone(),
            page_offsets: vec![PageOffset { page: 1, offset: 0 }],
        };
        let cfg = config(120, 160, 20, 25);
        let chunks = Chunker::new(cfg).expect("valid config").chunk("doc", &document);

        let mut rebuilt = Vec::new();
        for (index, chunk) in chunks.iter().enumerate() {
            let words = chunk.text.split_whitespace().collect::<Vec<_>>();
            assert_eq!(words.len(), chunk.token_count);
            let skip = if index == 0 { 0 } else { cfg.overlap_tokens };
            rebuilt.extend(words.into_iter().skip(skip));
        }
        assert_eq!(rebuilt, text.split_whitespace().collect::<Vec<_>>());

        for pair in chunks.windows(2) {
            let previous = pair[0].text.split_whitespace().collect::<Vec<_>>();
            let next = pair[1].text.split_whitespace().collect::<Vec<_>>();
            assert_eq!(
                previous[previous.len() - cfg.overlap_tokens..],
                next[..cfg.overlap_tokens]
            );
        }
    }

    #[test]
    fn chunks_carry_page_ranges() {
        let first = vec!["a"; 30].join(" ");
        let second = vec!["b"; 30].join(" ");
        let text = format!("{first}\n\n{second}");
        let document = NormalizedDocument {
            page_offsets: vec![
                PageOffset { page: 4, offset: 0 },
                PageOffset {
                    page: 5,
                    offset: first.len() + 2,
                },
            ],
            text,
        };

        let chunks = Chunker::new(config(40, 45, 5, 5))
            .expect("valid config")
            .chunk("doc", &document);

        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].page_start, chunks[0].page_end), (4, 5));
        assert_eq!((chunks[1].page_start, chunks[1].page_end), (5, 5));
    }

    #[test]
    fn trailing_quotes_still_end_a_sentence() {
        assert!(ends_sentence("done.\"", DEFAULT_SENTENCE_TERMINATORS));
        assert!(ends_sentence("(really?)", DEFAULT_SENTENCE_TERMINATORS));
        assert!(!ends_sentence("e.g", DEFAULT_SENTENCE_TERMINATORS));
    }

    #[test]
    fn overlap_must_be_smaller_than_target() {
        assert!(config(100, 200, 10, 100).validate().is_err());
        assert!(config(300, 200, 10, 50).validate().is_err());
        assert!(ChunkingConfig::default().validate().is_ok());
    }
}
