//! WordPiece-style token count estimator.
//!
//! Loads a vocabulary file and estimates token counts by greedy
//! longest-match, the same algorithm a WordPiece encoder uses to produce
//! subword ids, without actually materializing the ids — callers only need
//! the count. An `[UNK]` is counted for any word segment that cannot be
//! matched against the vocabulary at all.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

const DEFAULT_MAX_INPUT_CHARS_PER_WORD: usize = 100;
const CACHE_CLEAR_THRESHOLD: usize = 10_000;

/// Characters-per-token used when no vocabulary is configured. Keeps the
/// rest of the pipeline usable without requiring a real tokenizer file.
const CHARS_PER_TOKEN_FALLBACK: usize = 4;

pub struct Tokenizer {
    vocab: Option<HashMap<String, u32>>,
    max_input_chars_per_word: usize,
    cache: Mutex<HashMap<String, usize>>,
}

impl Tokenizer {
    /// Load a vocabulary from a JSON file (`{"token": id, ...}`). Returns a
    /// `ConfigError`-flavored error if the file is present but malformed.
    pub fn from_vocab_file(path: &Path, max_input_chars_per_word: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tokenizer vocab: {}", path.display()))?;
        let vocab: HashMap<String, u32> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse tokenizer vocab: {}", path.display()))?;
        if vocab.is_empty() {
            bail!("tokenizer vocab at {} is empty", path.display());
        }
        Ok(Self {
            vocab: Some(vocab),
            max_input_chars_per_word,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// A tokenizer with no vocabulary, estimating via characters-per-token.
    pub fn fallback() -> Self {
        Self {
            vocab: None,
            max_input_chars_per_word: DEFAULT_MAX_INPUT_CHARS_PER_WORD,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Estimate the number of tokens `text` would encode to.
    pub fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        {
            let cache = self.cache.lock();
            if let Some(&count) = cache.get(text) {
                return count;
            }
        }

        let count = match &self.vocab {
            Some(vocab) => self.count_with_vocab(text, vocab),
            None => text.chars().count().div_ceil(CHARS_PER_TOKEN_FALLBACK).max(1),
        };

        let mut cache = self.cache.lock();
        if cache.len() >= CACHE_CLEAR_THRESHOLD {
            cache.clear();
        }
        cache.insert(text.to_string(), count);
        count
    }

    fn count_with_vocab(&self, text: &str, vocab: &HashMap<String, u32>) -> usize {
        let mut total = 0usize;
        for word in text.split_whitespace() {
            let word: &str = if word.chars().count() > self.max_input_chars_per_word {
                let clipped: String = word.chars().take(self.max_input_chars_per_word).collect();
                total += self.greedy_segment(&clipped, vocab);
                continue;
            } else {
                word
            };
            total += self.greedy_segment(word, vocab);
        }
        total.max(1)
    }

    /// Greedy longest-match segmentation, WordPiece-style: try the longest
    /// remaining prefix first (continuation pieces prefixed with `##` after
    /// the first), falling back to a single `[UNK]` token if no prefix of
    /// the remainder is in the vocabulary.
    fn greedy_segment(&self, word: &str, vocab: &HashMap<String, u32>) -> usize {
        if word.is_empty() {
            return 0;
        }
        let chars: Vec<char> = word.chars().collect();
        let mut start = 0usize;
        let mut pieces = 0usize;
        let mut is_bad = false;

        while start < chars.len() {
            let mut end = chars.len();
            let mut matched = false;
            while end > start {
                let candidate: String = chars[start..end].iter().collect();
                let probe = if start > 0 {
                    format!("##{candidate}")
                } else {
                    candidate
                };
                if vocab.contains_key(&probe) {
                    matched = true;
                    break;
                }
                end -= 1;
            }
            if !matched {
                is_bad = true;
                break;
            }
            pieces += 1;
            start = end;
        }

        if is_bad {
            1 // [UNK]
        } else {
            pieces
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab_of(words: &[&str]) -> HashMap<String, u32> {
        words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect()
    }

    #[test]
    fn fallback_estimates_nonzero_for_nonempty_text() {
        let tok = Tokenizer::fallback();
        assert!(tok.count_tokens("hello world, this is a test") > 0);
        assert_eq!(tok.count_tokens(""), 0);
    }

    #[test]
    fn fallback_is_deterministic() {
        let tok = Tokenizer::fallback();
        let text = "the quick brown fox jumps over the lazy dog";
        assert_eq!(tok.count_tokens(text), tok.count_tokens(text));
    }

    #[test]
    fn vocab_exact_match_counts_one_piece() {
        let vocab = vocab_of(&["hello", "world"]);
        let tok = Tokenizer {
            vocab: Some(vocab),
            max_input_chars_per_word: 100,
            cache: Mutex::new(HashMap::new()),
        };
        assert_eq!(tok.count_tokens("hello world"), 2);
    }

    #[test]
    fn vocab_unknown_word_counts_as_single_unk() {
        let vocab = vocab_of(&["hello"]);
        let tok = Tokenizer {
            vocab: Some(vocab),
            max_input_chars_per_word: 100,
            cache: Mutex::new(HashMap::new()),
        };
        assert_eq!(tok.count_tokens("zzzzz"), 1);
    }

    #[test]
    fn vocab_subword_split_counts_multiple_pieces() {
        let vocab = vocab_of(&["un", "##able", "##ly"]);
        let tok = Tokenizer {
            vocab: Some(vocab),
            max_input_chars_per_word: 100,
            cache: Mutex::new(HashMap::new()),
        };
        assert_eq!(tok.count_tokens("unablely"), 3);
    }

    #[test]
    fn cache_clears_wholesale_past_threshold() {
        let tok = Tokenizer::fallback();
        for i in 0..(CACHE_CLEAR_THRESHOLD + 5) {
            tok.count_tokens(&format!("unique string number {i}"));
        }
        assert!(tok.cache.lock().len() <= CACHE_CLEAR_THRESHOLD + 5);
    }
}
