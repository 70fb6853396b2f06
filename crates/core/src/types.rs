//! Core data model (spec.md §3): Chunk, TrackedFile, IndexJob, SparseDoc,
//! SearchResult, and the Store identity/metadata types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalize a path to forward slashes, as required everywhere a path
/// crosses a component boundary (spec.md §3, §4.2).
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Lowercased-extension → language table (spec.md §4.1). Unknown
/// extensions fall back to `"text"`.
pub fn language_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "ts" => "typescript",
        "tsx" => "typescript",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascript",
        "py" | "pyi" => "python",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => "cpp",
        "java" => "java",
        "rb" => "ruby",
        "php" => "php",
        "cs" => "csharp",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        _ => "text",
    }
}

/// A single atomic indexed unit (spec.md §3, Chunk).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub doc_id: String,
    pub path: String,
    pub language: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub symbols: Vec<String>,
    /// Present once the embedding queue has successfully embedded this
    /// chunk; absent on chunks fresh out of the chunker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

/// Reason a chunker invocation produced no chunks for a file (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSkipReason {
    Binary,
    TooLarge,
}

/// Annotation attached to a successful but degraded chunk result — parser
/// failures downgrade to line-window chunking rather than failing the file
/// (spec.md §4.1, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkMethod {
    #[default]
    Ast,
    ParseErrorFallback,
    LineWindow,
}

/// Outcome of chunking a single file.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub chunks: Vec<Chunk>,
    pub method: ChunkMethod,
    pub skip_reason: Option<ChunkSkipReason>,
}

impl ChunkResult {
    pub fn skipped(reason: ChunkSkipReason) -> Self {
        Self { chunks: Vec::new(), method: ChunkMethod::Ast, skip_reason: Some(reason) }
    }
}

/// Per-store tracked-file entry (spec.md §3, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedFile {
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub indexed_at: chrono::DateTime<chrono::Utc>,
    pub chunk_ids: Vec<String>,
}

/// On-disk snapshot of a store's tracker state (spec.md §6.2, tracker.json).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrackerSnapshot {
    pub version: u32,
    pub files: BTreeMap<String, TrackedFile>,
}

/// A single chunk carried inside an [`IndexJob`] bound for the embedding
/// queue (spec.md §3, IndexJob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJobChunk {
    pub doc_id: String,
    pub path: String,
    pub language: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

const MAX_EMBED_INPUT_CHARS: usize = 8000;

impl IndexJobChunk {
    /// Build the embedder input text: `"<path>\n<symbols>\n<content>"`,
    /// truncated to the embedder's max input (spec.md §3, IndexJob).
    pub fn from_chunk(chunk: &Chunk) -> Self {
        let joined_symbols = chunk.symbols.join(" ");
        let mut text = format!("{}\n{}\n{}", chunk.path, joined_symbols, chunk.content);
        if text.len() > MAX_EMBED_INPUT_CHARS {
            let mut end = MAX_EMBED_INPUT_CHARS;
            while !text.is_char_boundary(end) && end > 0 {
                end -= 1;
            }
            text.truncate(end);
        }
        Self {
            doc_id: chunk.doc_id.clone(),
            path: chunk.path.clone(),
            language: chunk.language.clone(),
            chunk_index: chunk.chunk_index,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            text,
        }
    }
}

/// Durable FIFO unit consumed by the embedding queue (spec.md §3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJob {
    pub job_id: String,
    pub store: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub chunks: Vec<IndexJobChunk>,
}

/// Document shape handed to the sparse segment (spec.md §3, SparseDoc).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseDoc {
    pub doc_id: String,
    pub path: String,
    pub language: String,
    pub symbols: Vec<String>,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl SparseDoc {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            doc_id: chunk.doc_id.clone(),
            path: chunk.path.clone(),
            language: chunk.language.clone(),
            symbols: chunk.symbols.clone(),
            content: chunk.content.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
        }
    }
}

/// A single hybrid-search hit (spec.md §3, SearchResult).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub path: String,
    pub language: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub symbols: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dense_score: Option<f32>,
    pub fused_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    /// Not part of the wire shape directly but used internally by postrank
    /// (group-by-file) before the field is dropped on serialization.
    #[serde(skip)]
    pub representative: bool,
}

/// Store identity + metadata (spec.md §3, Store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// Default store name; spec.md §3 requires the default store to exist for
/// the server's lifetime.
pub const DEFAULT_STORE: &str = "default";

/// Validate a store name against `[a-zA-Z0-9_-]`, non-empty (spec.md §3).
pub fn validate_store_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("store name must not be empty");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err("store name must match [a-zA-Z0-9_-]");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_backslashes() {
        assert_eq!(normalize_path("src\\main.rs"), "src/main.rs");
    }

    #[test]
    fn language_table_covers_common_exts() {
        assert_eq!(language_for_extension("TS"), "typescript");
        assert_eq!(language_for_extension("py"), "python");
        assert_eq!(language_for_extension("weird"), "text");
    }

    #[test]
    fn store_name_validation() {
        assert!(validate_store_name("demo-1").is_ok());
        assert!(validate_store_name("").is_err());
        assert!(validate_store_name("bad name").is_err());
    }

    #[test]
    fn embed_text_truncates_at_char_boundary() {
        let chunk = Chunk {
            doc_id: "d".into(),
            path: "a.rs".into(),
            language: "rust".into(),
            chunk_index: 0,
            start_line: 1,
            end_line: 1,
            content: "x".repeat(9000),
            symbols: vec![],
            vector: None,
        };
        let job_chunk = IndexJobChunk::from_chunk(&chunk);
        assert!(job_chunk.text.len() <= MAX_EMBED_INPUT_CHARS);
    }
}
