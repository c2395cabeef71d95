//! Content-aware chunker.
//!
//! Classifies input as binary, code, or prose, then splits it into
//! token-budgeted, overlap-respecting chunks with stable, deterministic
//! ids. The classification step intentionally avoids heavyweight parsing:
//! it scans a bounded window of lines and accumulates structural
//! indicators (brace/semicolon/indent ratios, keyword patterns) rather
//! than trying to parse any particular language.

use crate::models::{Chunk, ChunkType, ChunkUnit};
use crate::tokenizer::Tokenizer;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

const CODE_RATIO_STRONG: f64 = 0.25;
const CODE_RATIO_WEAK: f64 = 0.1;
const BRACE_RATIO_STRONG: f64 = 0.15;
const BRACE_RATIO_WEAK: f64 = 0.05;
const SEMICOLON_RATIO_STRONG: f64 = 0.2;
const SEMICOLON_RATIO_WEAK: f64 = 0.1;
const INDENT_RATIO_THRESHOLD: f64 = 0.6;
const INDENT_RATIO_STRONG: f64 = 0.5;
const MIN_CODE_INDICATORS: usize = 2;
const STRONG_CODE_INDICATORS: usize = 5;
const EARLY_EXIT_THRESHOLD: usize = 5;
const MAX_LINES_TO_SCAN: usize = 200;
const MIN_LINES_FOR_ANALYSIS: usize = 3;
const BINARY_THRESHOLD: f64 = 0.3;
const BINARY_CHECK_BYTES: usize = 1024;
const MARKDOWN_FENCE_SCAN_LINES: usize = 75;
const TOKEN_CACHE_CLEAR_THRESHOLD: usize = 10_000;

/// Content-type classification of a source, shared by the chunker and the
/// collector's binary-skip check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Code,
    Text,
    Binary,
}

struct Patterns {
    class_struct: Regex,
    function_def: Regex,
    access_modifiers: Regex,
    imports: Regex,
    var_declarations: Regex,
    control_flow: Regex,
    arrow_functions: Regex,
    lone_braces: Regex,
    comments: Regex,
    markdown_fence: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        class_struct: Regex::new(r"\b(class|struct|interface|enum|trait)\s+\w+").unwrap(),
        function_def: Regex::new(r"\b(def|function|func|fn|lambda|const\s+\w+\s*=\s*\([^)]*\)\s*=>)\s*")
            .unwrap(),
        access_modifiers: Regex::new(
            r"\b(public|private|protected|static|final|virtual|override|async|await)\b",
        )
        .unwrap(),
        imports: Regex::new(r"^[ \t]*(#include|#import|import\s+\{|from\s+\S+\s+import|using\s+\w+)")
            .unwrap(),
        var_declarations: Regex::new(r"\b(var|let|const|auto|int|float|double|bool|void|string)\s+\w+\s*[=;:]")
            .unwrap(),
        control_flow: Regex::new(r"\bif\s*\(.*\)\s*\{|\bfor\s*\(.*\)|\bwhile\s*\(").unwrap(),
        arrow_functions: Regex::new(r"=>\s*\{|function\s*\(|:\s*function").unwrap(),
        lone_braces: Regex::new(r"^\s*[\{\}]\s*$").unwrap(),
        comments: Regex::new(r"^[ \t]*/[/*]|^[ \t]*\*|^[ \t]*//").unwrap(),
        markdown_fence: Regex::new(r"^```").unwrap(),
    })
}

fn code_extensions() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            ".cpp", ".h", ".hpp", ".c", ".cc", ".cxx", ".py", ".js", ".ts", ".jsx", ".tsx", ".java",
            ".cs", ".php", ".rb", ".go", ".rs", ".swift", ".kt", ".scala", ".m", ".mm", ".html",
            ".css", ".scss", ".xml", ".json", ".yaml", ".yml", ".sh", ".bash", ".sql",
        ]
        .into_iter()
        .collect()
    })
}

fn text_extensions() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| [".md", ".txt", ".rst", ".tex", ".org", ".adoc"].into_iter().collect())
}

fn extension_of(uri: &str) -> String {
    std::path::Path::new(uri)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn is_binary(text: &str) -> bool {
    if text.contains('\0') {
        return true;
    }
    let bytes = text.as_bytes();
    let checked = bytes.len().min(BINARY_CHECK_BYTES);
    if checked == 0 {
        return false;
    }
    let non_printable = bytes[..checked]
        .iter()
        .filter(|&&c| c < 32 && c != b'\n' && c != b'\r' && c != b'\t')
        .count();
    (non_printable as f64 / checked as f64) > BINARY_THRESHOLD
}

fn has_markdown_code_blocks(text: &str) -> bool {
    let mut fence_count = 0;
    for line in text.lines().take(MARKDOWN_FENCE_SCAN_LINES) {
        if patterns().markdown_fence.is_match(line) {
            fence_count += 1;
        }
        if fence_count >= 2 {
            return true;
        }
    }
    false
}

/// Detect whether `text` (sourced from `uri`) is binary, code, or prose.
pub fn detect_content_type(text: &str, uri: &str) -> ContentType {
    if is_binary(text) {
        return ContentType::Binary;
    }

    let ext = extension_of(uri);
    if code_extensions().contains(ext.as_str()) {
        return ContentType::Code;
    }
    if text_extensions().contains(ext.as_str()) {
        return ContentType::Text;
    }

    let p = patterns();
    let mut total_lines = 0usize;
    let mut non_empty_lines = 0usize;
    let mut code_indicators = 0usize;
    let mut indented_lines = 0usize;
    let mut lines_with_semicolons = 0usize;
    let mut lines_with_braces = 0usize;

    for line in text.lines() {
        if total_lines >= MAX_LINES_TO_SCAN {
            break;
        }
        total_lines += 1;

        let first_non_ws = line.find(|c: char| !matches!(c, ' ' | '\t' | '\r' | '\n'));
        let Some(first_non_ws) = first_non_ws else {
            continue;
        };
        non_empty_lines += 1;

        if first_non_ws > 0 {
            indented_lines += 1;
        }

        if code_indicators >= EARLY_EXIT_THRESHOLD && non_empty_lines >= 10 {
            return ContentType::Code;
        }

        let matched = p.class_struct.is_match(line)
            || p.function_def.is_match(line)
            || p.access_modifiers.is_match(line)
            || p.imports.is_match(line)
            || p.var_declarations.is_match(line)
            || p.control_flow.is_match(line)
            || p.arrow_functions.is_match(line)
            || p.lone_braces.is_match(line)
            || p.comments.is_match(line);

        if matched {
            code_indicators += 1;
        }
        if line.contains('{') || line.contains('}') {
            lines_with_braces += 1;
        }
        if line.contains(';') {
            lines_with_semicolons += 1;
        }
    }

    if non_empty_lines < MIN_LINES_FOR_ANALYSIS {
        return if text.contains('{') || text.contains("function") || text.contains("class ") {
            ContentType::Code
        } else {
            ContentType::Text
        };
    }

    if has_markdown_code_blocks(text) {
        return ContentType::Text;
    }

    let code_ratio = code_indicators as f64 / non_empty_lines as f64;
    let brace_ratio = lines_with_braces as f64 / non_empty_lines as f64;
    let semicolon_ratio = lines_with_semicolons as f64 / non_empty_lines as f64;
    let indent_ratio = indented_lines as f64 / non_empty_lines as f64;

    if code_ratio > CODE_RATIO_STRONG
        || (brace_ratio > BRACE_RATIO_STRONG && code_indicators > MIN_CODE_INDICATORS)
        || (semicolon_ratio > SEMICOLON_RATIO_STRONG && code_indicators > MIN_CODE_INDICATORS)
        || (code_indicators > STRONG_CODE_INDICATORS && indent_ratio > INDENT_RATIO_STRONG)
    {
        return ContentType::Code;
    }

    if code_ratio > CODE_RATIO_WEAK
        && indent_ratio > INDENT_RATIO_THRESHOLD
        && (brace_ratio > BRACE_RATIO_WEAK || semicolon_ratio > SEMICOLON_RATIO_WEAK)
    {
        return ContentType::Code;
    }

    ContentType::Text
}

/// Split `text` into atomic units: runs of non-whitespace/non-punctuation
/// ("words"), single punctuation characters, and runs of whitespace.
fn split_units(text: &str) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    let mut buf = String::new();

    let flush = |buf: &mut String, result: &mut Vec<String>| {
        if !buf.is_empty() {
            result.push(std::mem::take(buf));
        }
    };

    for c in text.chars() {
        if c.is_whitespace() {
            flush(&mut buf, &mut result);
            if let Some(last) = result.last_mut() {
                if last.chars().all(|x| x.is_whitespace()) {
                    last.push(c);
                    continue;
                }
            }
            result.push(c.to_string());
        } else if c.is_ascii_punctuation() {
            flush(&mut buf, &mut result);
            result.push(c.to_string());
        } else {
            buf.push(c);
        }
    }
    flush(&mut buf, &mut result);
    result
}

/// Collapse whitespace runs (except newlines) to a single space, collapse
/// blank lines to a single newline, and trim the ends.
fn normalize_whitespace(text: &str) -> String {
    let trimmed = text.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\r' | '\n'));

    let ws_run = Regex::new(r"[^\S\n]+").unwrap();
    let collapsed = ws_run.replace_all(trimmed, " ");

    let blank_lines = Regex::new(r"\n\s*\n").unwrap();
    blank_lines.replace_all(&collapsed, "\n").into_owned()
}

struct Unit {
    text: String,
    tokens: usize,
    start_char: usize,
    end_char: usize,
}

/// Configuration driving the splitting step; mirrors `chunking.*` in the
/// configuration file.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_fraction: f64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_tokens: 50,
            max_tokens: 500,
            overlap_fraction: 0.1,
        }
    }
}

pub struct Chunker {
    tokenizer: Arc<Tokenizer>,
    config: ChunkerConfig,
    /// Token-count cache keyed by exact chunk text, distinct from the
    /// tokenizer's own word-level cache (spec §5: "chunk-token cache").
    cache: Mutex<HashMap<String, usize>>,
}

impl Chunker {
    pub fn new(tokenizer: Arc<Tokenizer>, config: ChunkerConfig) -> Self {
        Self {
            tokenizer,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn overlap_tokens(&self) -> usize {
        let raw = (self.config.max_tokens as f64 * self.config.overlap_fraction) as usize;
        let cap = (self.config.max_tokens as f64 * 0.6) as usize;
        raw.min(cap)
    }

    fn token_count(&self, text: &str) -> usize {
        {
            let cache = self.cache.lock();
            if let Some(&n) = cache.get(text) {
                return n;
            }
        }
        let n = self.tokenizer.count_tokens(text);
        let mut cache = self.cache.lock();
        if cache.len() > TOKEN_CACHE_CLEAR_THRESHOLD {
            cache.clear();
        }
        cache.insert(text.to_string(), n);
        n
    }

    /// Classify, split, and post-process `text` sourced from `uri` into a
    /// deterministic sequence of chunks. Returns an empty list for binary
    /// content or empty input.
    pub fn chunk(&self, text: &str, uri: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }
        match detect_content_type(text, uri) {
            ContentType::Text => self.post_process(self.split_into_text_chunks(text, uri), ChunkType::Text),
            ContentType::Code => self.post_process(self.split_into_line_chunks(text, uri), ChunkType::Code),
            ContentType::Binary => {
                tracing::debug!(uri, "binary content skipped by chunker");
                Vec::new()
            }
        }
    }

    fn post_process(&self, chunks: Vec<Chunk>, chunk_type: ChunkType) -> Vec<Chunk> {
        let mut processed = Vec::with_capacity(chunks.len());
        let mut i = 0usize;
        let mut chunks = chunks;
        for c in chunks.iter_mut() {
            c.chunk_type = chunk_type;
        }
        while i < chunks.len() {
            let mut chunk = chunks[i].clone();
            if chunk.token_count < self.config.min_tokens && i + 1 < chunks.len() {
                let next = chunks[i + 1].clone();
                let combined_text = format!("{}{}", chunk.text, next.text);
                let combined_tokens = self.token_count(&combined_text);
                if combined_tokens <= self.config.max_tokens && chunk.doc_uri == next.doc_uri {
                    chunk.text = combined_text;
                    chunk.token_count = combined_tokens;
                    chunk.end = next.end;
                    i += 1;
                }
            }
            processed.push(chunk);
            i += 1;
        }
        processed
    }

    fn split_into_text_chunks(&self, text: &str, uri: &str) -> Vec<Chunk> {
        let overlap = self.overlap_tokens();
        let normalized = normalize_whitespace(text);
        let raw_units = split_units(&normalized);

        let mut units = Vec::with_capacity(raw_units.len());
        let mut char_pos = 0usize;
        for u in raw_units {
            let tokens = self.token_count(&u);
            let len = u.chars().count();
            units.push(Unit {
                text: u,
                tokens,
                start_char: char_pos,
                end_char: char_pos + len,
            });
            char_pos += len;
        }

        let mut chunks = Vec::new();
        let mut chunk_id = 0usize;
        let mut start = 0usize;

        while start < units.len() {
            let mut token_cnt = 0usize;
            let mut end = start;
            while end < units.len() && token_cnt + units[end].tokens <= self.config.max_tokens {
                token_cnt += units[end].tokens;
                end += 1;
            }
            // Guarantee progress on an oversized single unit.
            if end == start {
                end = start + 1;
                token_cnt = units[start].tokens;
            }

            if start < end {
                let start_char = units[start].start_char;
                let end_char = units[end - 1].end_char;
                let chunk_text: String = units[start..end].iter().map(|u| u.text.as_str()).collect();
                chunks.push(Chunk::new(
                    uri,
                    chunk_id,
                    chunk_text,
                    token_cnt,
                    start_char,
                    end_char,
                    ChunkUnit::Char,
                    ChunkType::Text,
                ));
                chunk_id += 1;
            }

            if end >= units.len() {
                break;
            }

            if overlap > 0 {
                let mut overlap_tokens = 0usize;
                let mut overlap_units = 0usize;
                while start + overlap_units < end && overlap_tokens < overlap {
                    overlap_tokens += units[end - 1 - overlap_units].tokens;
                    overlap_units += 1;
                }
                start = end - overlap_units;
            } else {
                start = end;
            }
        }

        chunks
    }

    /// Re-split a single line whose token count exceeds `max_tokens` using
    /// the text-path unit splitter, guaranteeing each returned piece ends
    /// with a newline.
    fn split_into_lines(&self, text: &str) -> Vec<String> {
        if self.token_count(text) <= self.config.max_tokens {
            let mut s = text.to_string();
            if !s.ends_with('\n') {
                s.push('\n');
            }
            return vec![s];
        }

        let units = split_units(text);
        let mut result = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for u in units {
            let u_tokens = self.token_count(&u);
            if current_tokens + u_tokens > self.config.max_tokens && !current.is_empty() {
                if !current.ends_with('\n') {
                    current.push('\n');
                }
                result.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current.push_str(&u);
            current_tokens += u_tokens;
        }
        if !current.is_empty() {
            if !current.ends_with('\n') {
                current.push('\n');
            }
            result.push(current);
        }
        result
    }

    fn split_into_line_chunks(&self, text: &str, uri: &str) -> Vec<Chunk> {
        let mut lines: Vec<String> = Vec::new();
        for line in text.lines() {
            lines.extend(self.split_into_lines(line));
        }
        if lines.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut chunk_id = 0usize;
        let mut start = 0usize;
        let overlap_tokens = self.overlap_tokens();

        while start < lines.len() {
            let mut token_cnt = 0usize;
            let mut end = start;
            let mut chunk_text = String::new();
            while end < lines.len() {
                let line_tokens = self.token_count(&lines[end]);
                if token_cnt + line_tokens > self.config.max_tokens && end > start {
                    break;
                }
                token_cnt += line_tokens;
                chunk_text.push_str(&lines[end]);
                end += 1;
            }

            if start < end {
                chunks.push(Chunk::new(
                    uri,
                    chunk_id,
                    chunk_text,
                    token_cnt,
                    start,
                    end,
                    ChunkUnit::Line,
                    ChunkType::Code,
                ));
                chunk_id += 1;
            }

            if end >= lines.len() {
                break;
            }

            if overlap_tokens > 0 {
                let mut acc_tokens = 0usize;
                let mut overlap_lines = 0usize;
                while start < end.saturating_sub(overlap_lines + 1) {
                    acc_tokens += self.token_count(&lines[end - 1 - overlap_lines]);
                    if acc_tokens < overlap_tokens {
                        overlap_lines += 1;
                    } else {
                        break;
                    }
                }
                start = end - overlap_lines;
            } else {
                start = end;
            }
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(min: usize, max: usize, overlap: f64) -> Chunker {
        Chunker::new(
            Arc::new(Tokenizer::fallback()),
            ChunkerConfig {
                min_tokens: min,
                max_tokens: max,
                overlap_fraction: overlap,
            },
        )
    }

    #[test]
    fn detects_code_by_extension() {
        assert_eq!(detect_content_type("anything", "a.rs"), ContentType::Code);
        assert_eq!(detect_content_type("anything", "a.md"), ContentType::Text);
    }

    #[test]
    fn detects_binary_by_nul_byte() {
        let text = "hello\0world";
        assert_eq!(detect_content_type(text, "a.unknown"), ContentType::Binary);
    }

    #[test]
    fn markdown_with_two_fences_is_text() {
        let text = "Some prose.\n```\ncode here\n```\nmore prose.";
        assert_eq!(detect_content_type(text, "a.unknown"), ContentType::Text);
    }

    #[test]
    fn short_snippet_with_brace_is_code() {
        assert_eq!(detect_content_type("{ }", "a.unknown"), ContentType::Code);
    }

    #[test]
    fn short_snippet_without_indicators_is_text() {
        assert_eq!(detect_content_type("hello there friend", "a.unknown"), ContentType::Text);
    }

    #[test]
    fn chunk_is_deterministic() {
        let c = chunker(5, 10, 0.1);
        let text = "void f() {\n  int x = 1;\n  if (x) { g(); }\n}";
        let a = c.chunk(text, "a.cpp");
        let b = c.chunk(text, "a.cpp");
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.chunk_id, y.chunk_id);
        }
    }

    #[test]
    fn chunk_code_path_produces_line_unit_chunks() {
        let c = chunker(5, 10, 0.1);
        let text = "void f() {\n  int x = 1;\n  if (x) { g(); }\n}";
        let chunks = c.chunk(text, "a.cpp");
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.unit == ChunkUnit::Line));
        assert!(chunks.iter().all(|c| c.chunk_type == ChunkType::Code));
        assert!(chunks[0].text.starts_with("void f() {"));
        let reconstructed: String = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("");
        // Lines are re-emitted verbatim (each ends with '\n' as stored); the
        // original input joined back should match modulo the trailing
        // newline splitIntoLines always appends.
        assert!(reconstructed.contains("void f() {"));
        assert!(reconstructed.contains("int x = 1;"));
    }

    #[test]
    fn every_chunk_respects_max_tokens() {
        let c = chunker(1, 10, 0.1);
        let text = (0..200).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let chunks = c.chunk(&text, "a.txt");
        for chunk in &chunks {
            assert!(chunk.token_count <= 10, "chunk exceeded max_tokens: {}", chunk.token_count);
        }
    }

    #[test]
    fn consecutive_chunks_share_unit() {
        let c = chunker(1, 10, 0.1);
        let text = (0..200).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let chunks = c.chunk(&text, "a.txt");
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].unit, pair[1].unit);
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let c = chunker(5, 10, 0.1);
        assert!(c.chunk("", "a.txt").is_empty());
    }

    #[test]
    fn short_chunks_are_merged_in_post_processing() {
        let c = chunker(50, 60, 0.0);
        let text = "one two three four five six seven eight nine ten";
        let chunks = c.chunk(text, "a.txt");
        // With a high min_tokens relative to content, chunks should merge
        // down to as few as possible rather than leaving tiny fragments.
        assert!(chunks.len() <= 2);
    }
}
