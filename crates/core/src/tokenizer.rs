/// Byte span of one token inside the text it was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn as_str<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

pub trait Tokenizer {
    /// Tokens in reading order; spans must lie on char boundaries of `text`.
    fn tokenize(&self, text: &str) -> Vec<Token>;
}

/// Splits on Unicode whitespace. One token per word, punctuation attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut start = None;

        for (index, character) in text.char_indices() {
            match (character.is_whitespace(), start) {
                (true, Some(begin)) => {
                    tokens.push(Token {
                        start: begin,
                        end: index,
                    });
                    start = None;
                }
                (false, None) => start = Some(index),
                _ => {}
            }
        }

        if let Some(begin) = start {
            tokens.push(Token {
                start: begin,
                end: text.len(),
            });
        }

        tokens
    }
}
