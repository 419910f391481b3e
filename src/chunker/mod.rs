
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::ChunkingSettings;
use crate::tokenizer::TokenCounter;

/// Indicator share of lines above which a document counts as code.
const CODE_LINE_RATIO: f64 = 0.3;
/// Indicator share of characters used instead for texts under three lines.
const CODE_CHAR_RATIO: f64 = 0.09;
/// Overlap never exceeds this share of the chunk budget.
const MAX_OVERLAP_RATIO: f32 = 0.6;
/// Cleaned embedder input is capped at this many characters.
const EMBED_TEXT_CAP: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    Char,
    Line,
}

impl ChunkUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkUnit::Char => "char",
            ChunkUnit::Line => "line",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Code,
    Text,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Code => "code",
            ContentType::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMetadata {
    pub token_count: usize,
    /// Start position; a character offset for `Char` chunks, a line
    /// index for `Line` chunks.
    pub start: usize,
    pub end: usize,
    pub unit: ChunkUnit,
    pub chunk_type: ContentType,
}

/// A token-bounded slice of a document, the unit of embedding and
/// retrieval. Immutable once persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub doc_uri: String,
    /// Ordinal within the document; the store assigns the global id.
    pub ordinal: usize,
    pub text: String,
    pub raw: String,
    pub metadata: ChunkMetadata,
}

/// Splits text into token-bounded, optionally overlapping chunks.
///
/// Code-like content is split on line boundaries, prose on
/// whitespace/punctuation units over a normalized string.
pub struct Chunker {
    counter: Arc<TokenCounter>,
    min_tokens: usize,
    max_tokens: usize,
    overlap_tokens: usize,
    token_cache: Mutex<HashMap<String, usize>>,
}

struct Unit {
    text: String,
    tokens: usize,
    start: usize,
    end: usize,
}

impl Chunker {
    pub fn new(counter: Arc<TokenCounter>, settings: &ChunkingSettings) -> Self {
        let max_tokens = settings.nof_max_tokens.max(1);
        let overlap = settings.overlap_percentage.clamp(0.0, 1.0);
        let effective = overlap.min(MAX_OVERLAP_RATIO);
        let overlap_tokens = (max_tokens as f32 * effective) as usize;

        Self {
            counter,
            min_tokens: settings.nof_min_tokens,
            max_tokens,
            overlap_tokens,
            token_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Split `text` into an ordered sequence of chunks attributed to
    /// `doc_uri`. The `semantic` flag is reserved for boundary-aware
    /// splitting and currently selects the same strategies.
    pub fn chunk(&self, text: &str, doc_uri: &str, _semantic: bool) -> Vec<Chunk> {
        let chunk_type = detect_content_type(text, doc_uri);
        let chunks = match chunk_type {
            ContentType::Code => self.split_into_line_chunks(text, doc_uri),
            ContentType::Text => self.split_into_unit_chunks(text, doc_uri),
        };
        self.post_process(chunks)
    }

    pub fn token_count(&self, text: &str) -> usize {
        if let Some(&cached) = self
            .token_cache
            .lock()
            .expect("chunker cache poisoned")
            .get(text)
        {
            return cached;
        }
        let count = self.counter.count(text, false);
        self.token_cache
            .lock()
            .expect("chunker cache poisoned")
            .insert(text.to_string(), count);
        count
    }

    /// Line-based chunking for code. Oversized single lines are
    /// re-split into token-bounded pieces first.
    fn split_into_line_chunks(&self, text: &str, doc_uri: &str) -> Vec<Chunk> {
        let mut lines: Vec<String> = Vec::new();
        for line in text.lines() {
            lines.extend(self.split_oversized_line(line));
        }

        let mut chunks = Vec::new();
        let mut ordinal = 0;
        let mut start = 0;

        while start < lines.len() {
            let mut tokens = 0;
            let mut end = start;
            let mut chunk_text = String::new();

            while end < lines.len() {
                let line_tokens = self.token_count(&lines[end]);
                if tokens + line_tokens > self.max_tokens && end > start {
                    break;
                }
                tokens += line_tokens;
                chunk_text.push_str(&lines[end]);
                end += 1;
                if tokens > self.max_tokens {
                    break; // single line over budget, taken alone
                }
            }

            chunks.push(Chunk {
                doc_uri: doc_uri.to_string(),
                ordinal,
                raw: chunk_text.clone(),
                text: chunk_text,
                metadata: ChunkMetadata {
                    token_count: tokens,
                    start,
                    end,
                    unit: ChunkUnit::Line,
                    chunk_type: ContentType::Code,
                },
            });
            ordinal += 1;

            if end >= lines.len() {
                break;
            }
            start = self.overlap_restart(start, end, |i| self.token_count(&lines[i]));
        }

        chunks
    }

    /// Unit-based chunking for prose over the whitespace-normalized
    /// string. Offsets index the normalized text.
    fn split_into_unit_chunks(&self, text: &str, doc_uri: &str) -> Vec<Chunk> {
        let normalized = normalize_whitespace(text);
        let units = split_units(&normalized)
            .into_iter()
            .scan(0usize, |pos, text| {
                let start = *pos;
                *pos += text.len();
                let tokens = self.token_count(&text);
                Some(Unit {
                    end: start + text.len(),
                    start,
                    tokens,
                    text,
                })
            })
            .collect::<Vec<_>>();

        let mut chunks = Vec::new();
        let mut ordinal = 0;
        let mut start = 0;

        while start < units.len() {
            let mut tokens = 0;
            let mut end = start;
            while end < units.len() && tokens + units[end].tokens <= self.max_tokens {
                tokens += units[end].tokens;
                end += 1;
            }
            if end == start {
                // A single unit over budget is taken alone.
                tokens = units[start].tokens;
                end = start + 1;
            }

            let start_char = units[start].start;
            let end_char = units[end - 1].end;
            let raw = normalized[start_char..end_char].to_string();
            if !raw.trim().is_empty() {
                chunks.push(Chunk {
                    doc_uri: doc_uri.to_string(),
                    ordinal,
                    text: raw.clone(),
                    raw,
                    metadata: ChunkMetadata {
                        token_count: tokens,
                        start: start_char,
                        end: end_char,
                        unit: ChunkUnit::Char,
                        chunk_type: ContentType::Text,
                    },
                });
                ordinal += 1;
            }

            if end >= units.len() {
                break;
            }
            start = self.overlap_restart(start, end, |i| units[i].tokens);
        }

        chunks
    }

    /// Next chunk start so the new chunk includes trailing elements
    /// summing to at least `overlap_tokens`. Always makes progress.
    fn overlap_restart(
        &self,
        start: usize,
        end: usize,
        tokens_at: impl Fn(usize) -> usize,
    ) -> usize {
        if self.overlap_tokens == 0 {
            return end;
        }
        let mut overlap = 0;
        let mut count = 0;
        while count < end - start - 1 && overlap < self.overlap_tokens {
            overlap += tokens_at(end - 1 - count);
            count += 1;
        }
        let restart = end - count;
        if restart <= start { end } else { restart }
    }

    /// Re-split one line into token-bounded pieces when it alone
    /// exceeds the chunk budget.
    fn split_oversized_line(&self, line: &str) -> Vec<String> {
        let with_newline = format!("{}\n", line);
        if self.token_count(&with_newline) <= self.max_tokens {
            return vec![with_newline];
        }

        let mut pieces = Vec::new();
        let mut current = String::new();
        let mut tokens = 0;
        for unit in split_units(line) {
            let unit_tokens = self.token_count(&unit);
            if tokens + unit_tokens > self.max_tokens && !current.is_empty() {
                current.push('\n');
                pieces.push(std::mem::take(&mut current));
                tokens = 0;
            }
            current.push_str(&unit);
            tokens += unit_tokens;
        }
        if !current.is_empty() {
            current.push('\n');
            pieces.push(current);
        }
        pieces
    }

    /// Merge a too-small chunk into its successor when the pair stays
    /// within budget.
    fn post_process(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
        let mut processed: Vec<Chunk> = Vec::with_capacity(chunks.len());
        let mut iter = chunks.into_iter().peekable();

        while let Some(mut chunk) = iter.next() {
            if chunk.metadata.token_count < self.min_tokens {
                if let Some(next) = iter.peek() {
                    if next.doc_uri == chunk.doc_uri {
                        let combined = format!("{}{}", chunk.text, next.text);
                        let combined_tokens = self.token_count(&combined);
                        if combined_tokens <= self.max_tokens {
                            let next = iter.next().expect("peeked chunk");
                            chunk.text = combined;
                            chunk.raw.push_str(&next.raw);
                            chunk.metadata.token_count = combined_tokens;
                            chunk.metadata.end = next.metadata.end;
                        }
                    }
                }
            }
            processed.push(chunk);
        }

        for (ordinal, chunk) in processed.iter_mut().enumerate() {
            chunk.ordinal = ordinal;
        }
        processed
    }
}

/// Classify content as code or text, by extension first and by a
/// line-indicator scan otherwise.
pub fn detect_content_type(text: &str, doc_uri: &str) -> ContentType {
    const CODE_EXTENSIONS: &[&str] = &[
        ".cpp", ".cc", ".h", ".hpp", ".c", ".py", ".js", ".ts", ".java", ".cs", ".rs", ".go",
    ];
    const TEXT_EXTENSIONS: &[&str] = &[".md", ".txt"];

    if CODE_EXTENSIONS.iter().any(|ext| doc_uri.ends_with(ext)) {
        return ContentType::Code;
    }
    if TEXT_EXTENSIONS.iter().any(|ext| doc_uri.ends_with(ext)) {
        return ContentType::Text;
    }

    let total_lines = text.lines().count();
    if total_lines >= 3 {
        let indicator_lines = text.lines().filter(|l| line_indicators(l) > 0).count();
        if indicator_lines as f64 > total_lines as f64 * CODE_LINE_RATIO {
            return ContentType::Code;
        }
    } else {
        let occurrences: usize = text.lines().map(line_indicators).sum();
        if occurrences as f64 > text.len() as f64 * CODE_CHAR_RATIO {
            return ContentType::Code;
        }
    }
    ContentType::Text
}

fn line_indicators(line: &str) -> usize {
    const KEYWORDS: &[&str] = &["class ", "struct ", "def ", "function ", "#include", "import "];

    let mut count = KEYWORDS.iter().filter(|k| line.contains(*k)).count();
    count += line.matches('{').count();
    let semicolons = line.matches(';').count();
    if semicolons > 1 {
        count += semicolons;
    }
    count
}

/// Collapse intra-line whitespace to single spaces and blank-line runs
/// to a single newline; the result is trimmed.
pub fn normalize_whitespace(text: &str) -> String {
    // First pass: collapse non-newline whitespace runs.
    let mut collapsed = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.trim().chars() {
        if c == '\n' {
            collapsed.push('\n');
            in_space = false;
        } else if c.is_whitespace() {
            if !in_space {
                collapsed.push(' ');
                in_space = true;
            }
        } else {
            collapsed.push(c);
            in_space = false;
        }
    }

    // Second pass: collapse whitespace runs containing newlines.
    let mut result = String::with_capacity(collapsed.len());
    let mut chars = collapsed.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\n' {
            result.push(c);
            continue;
        }
        let mut trailing_space = false;
        while let Some(&next) = chars.peek() {
            match next {
                '\n' => {
                    trailing_space = false;
                    chars.next();
                }
                ' ' => {
                    trailing_space = true;
                    chars.next();
                }
                _ => break,
            }
        }
        result.push('\n');
        if trailing_space {
            result.push(' ');
        }
    }
    result
}

/// Split into interleaved units: whitespace runs, single punctuation
/// characters, and runs of everything else.
fn split_units(text: &str) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut ws = String::new();

    for c in text.chars() {
        if c.is_whitespace() {
            if !buf.is_empty() {
                result.push(std::mem::take(&mut buf));
            }
            ws.push(c);
        } else {
            if !ws.is_empty() {
                result.push(std::mem::take(&mut ws));
            }
            if c.is_ascii_punctuation() {
                if !buf.is_empty() {
                    result.push(std::mem::take(&mut buf));
                }
                result.push(c.to_string());
            } else {
                buf.push(c);
            }
        }
    }
    if !buf.is_empty() {
        result.push(buf);
    }
    if !ws.is_empty() {
        result.push(ws);
    }
    result
}

/// Prepare text for the embedding endpoint: optional prepend phrase,
/// whitespace normalization, `\n` escape expansion, ASCII filtering,
/// and a length cap.
pub fn clean_text_for_embedding(text: &str, prepend_phrase: &str) -> String {
    let prepend = prepend_phrase.trim();
    let body = normalize_whitespace(text);
    let mut s = if prepend.is_empty() {
        body
    } else {
        format!("{} {}", prepend, body)
    };

    s = s.replace("\\n", "\n");
    s.retain(|c| c.is_ascii());
    let mut s = s.trim().to_string();
    if s.len() > EMBED_TEXT_CAP {
        let mut cut = EMBED_TEXT_CAP;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}
