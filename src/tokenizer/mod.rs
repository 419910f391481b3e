#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::{debug, warn};

/// Sub-tokens longer than this count as a single unknown token.
const MAX_INPUT_CHARS_PER_WORD: usize = 100;

/// Deterministic token counter for UTF-8 text.
///
/// With a vocabulary loaded, counts via greedy longest-match WordPiece
/// (continuation pieces carry a `##` prefix). Without one, falls back to
/// a length-tier heuristic. Shared across concurrent chunker calls; the
/// per-word cache is mutex-guarded.
pub struct TokenCounter {
    vocab: HashSet<String>,
    cache: Mutex<HashMap<String, usize>>,
}

#[derive(Deserialize)]
struct TokenizerFile {
    model: TokenizerModel,
}

#[derive(Deserialize)]
struct TokenizerModel {
    #[serde(default)]
    vocab: HashMap<String, u32>,
}

impl TokenCounter {
    /// Load the vocabulary from a HuggingFace-style `tokenizer.json`.
    /// A missing or unreadable file yields a vocabulary-free counter.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        let path = config_path.as_ref();
        let vocab = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<TokenizerFile>(&content) {
                Ok(file) => {
                    debug!(
                        "Loaded tokenizer vocabulary with {} entries from {}",
                        file.model.vocab.len(),
                        path.display()
                    );
                    file.model.vocab.into_keys().collect()
                }
                Err(e) => {
                    warn!("Failed to parse tokenizer config {}: {}", path.display(), e);
                    HashSet::new()
                }
            },
            Err(_) => {
                if !path.as_os_str().is_empty() {
                    warn!(
                        "Tokenizer config {} not readable, using heuristic estimation",
                        path.display()
                    );
                }
                HashSet::new()
            }
        };

        Self {
            vocab,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Counter with no vocabulary; always estimates heuristically.
    pub fn without_vocab() -> Self {
        Self {
            vocab: HashSet::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_vocab(&self) -> bool {
        !self.vocab.is_empty()
    }

    /// Count tokens in `text`. `add_special_tokens` accounts for CLS/SEP.
    pub fn count(&self, text: &str, add_special_tokens: bool) -> usize {
        let padded = pad_cjk_chars(text);
        let mut total = if add_special_tokens { 2 } else { 0 };

        for word in padded.split_whitespace() {
            for sub in split_on_punct(word) {
                total += if self.vocab.is_empty() {
                    estimate_sub_token(&sub)
                } else {
                    self.wordpiece_count(&sub)
                };
            }
        }
        total
    }

    fn wordpiece_count(&self, word: &str) -> usize {
        if word.len() > MAX_INPUT_CHARS_PER_WORD {
            return 1; // [UNK]
        }

        if let Some(&cached) = self.cache.lock().expect("token cache poisoned").get(word) {
            return cached;
        }

        let mut tokens = 0;
        let mut start = 0;
        while start < word.len() {
            let mut best_end = start + 1;
            for end in (start + 1..=word.len()).rev() {
                if !word.is_char_boundary(end) {
                    continue;
                }
                let candidate = if start > 0 {
                    format!("##{}", &word[start..end])
                } else {
                    word[start..end].to_string()
                };
                if self.vocab.contains(&candidate) {
                    best_end = end;
                    break;
                }
            }
            while !word.is_char_boundary(best_end) && best_end < word.len() {
                best_end += 1;
            }
            tokens += 1;
            start = best_end;
        }

        self.cache
            .lock()
            .expect("token cache poisoned")
            .insert(word.to_string(), tokens);
        tokens
    }
}

/// Length-tier heuristic, roughly one token per four characters.
fn estimate_sub_token(sub: &str) -> usize {
    match sub.len() {
        0 => 0,
        1..=4 => 1,
        5..=8 => 2,
        n => (n + 3) / 4,
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{F900}'..='\u{FAFF}')
}

/// Surround CJK codepoints with spaces so each counts as its own word.
/// Other non-ASCII codepoints are dropped, matching the embedder's
/// ASCII-only input cleaning.
fn pad_cjk_chars(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for c in text.chars() {
        if is_cjk(c) {
            result.push(' ');
            result.push(c);
            result.push(' ');
        } else if c.is_ascii() {
            result.push(c);
        }
    }
    result
}

/// Split a word around ASCII punctuation; each punctuation char is its
/// own sub-token.
fn split_on_punct(word: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    for c in word.chars() {
        if c.is_ascii_punctuation() {
            if !current.is_empty() {
                result.push(std::mem::take(&mut current));
            }
            result.push(c.to_string());
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        result.push(current);
    }
    result
}
