//! C3 — Sparse Segment: inverted index over (path, symbols, content,
//! language); BM25 query with field boosts `symbols > path > content`
//! (spec.md §4.3). Backed by a real `tantivy` index per store — the teacher
//! has no sparse-text dependency, but the spec names "Tantivy Write Queue"
//! explicitly and the rest of the retrieved pack (cruxe, pleme-codesearch,
//! coderag) reaches for the same crate for this exact job.

use crate::error::{CoreError, CoreResult};
use crate::types::SparseDoc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING, TEXT};
use tantivy::tokenizer::{LowerCaser, TextAnalyzer, Token, TokenStream, Tokenizer};
use tantivy::{doc, Index, IndexReader, IndexWriter, Term};

const SYMBOLS_TOKENIZER: &str = "code_ident";

/// A BM25 hit (spec.md §4.3, `Query(...) -> []{doc_id, score}`).
#[derive(Debug, Clone)]
pub struct SparseHit {
    pub doc_id: String,
    pub score: f32,
}

/// Optional filter applied to sparse/dense retrieval alike (spec.md §4.10).
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub path_prefix: Option<String>,
    pub languages: Option<Vec<String>>,
}

impl SearchFilter {
    fn accepts(&self, path: &str, language: &str) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(langs) = &self.languages {
            if !langs.iter().any(|l| l == language) {
                return false;
            }
        }
        true
    }
}

struct Fields {
    doc_id: tantivy::schema::Field,
    path: tantivy::schema::Field,
    language: tantivy::schema::Field,
    symbols: tantivy::schema::Field,
    content: tantivy::schema::Field,
    start_line: tantivy::schema::Field,
    end_line: tantivy::schema::Field,
}

/// Split text on non-alphanumeric boundaries *and* on camelCase/PascalCase
/// transitions, so `getUserById` tokenizes as `get`, `user`, `by`, `id`
/// (spec.md §4.3, "identifier tokenizer, split on camelCase/underscore").
fn split_code_identifier(text: &str) -> Vec<(usize, usize, String)> {
    let mut tokens = Vec::new();
    let mut cur_start: Option<usize> = None;
    let chars: Vec<(usize, char)> = text.char_indices().collect();

    let flush = |start: usize, end: usize, tokens: &mut Vec<(usize, usize, String)>| {
        if end > start {
            tokens.push((start, end, text[start..end].to_lowercase()));
        }
    };

    for (i, (byte_idx, ch)) in chars.iter().enumerate() {
        if !ch.is_alphanumeric() {
            if let Some(s) = cur_start.take() {
                flush(s, *byte_idx, &mut tokens);
            }
            continue;
        }
        if cur_start.is_none() {
            cur_start = Some(*byte_idx);
            continue;
        }
        let prev_ch = chars[i - 1].1;
        let boundary = prev_ch.is_lowercase() && ch.is_uppercase();
        if boundary {
            let s = cur_start.take().unwrap();
            flush(s, *byte_idx, &mut tokens);
            cur_start = Some(*byte_idx);
        }
    }
    if let Some(s) = cur_start {
        flush(s, text.len(), &mut tokens);
    }
    tokens
}

struct MaterializedStream {
    tokens: Vec<(usize, usize, String)>,
    idx: usize,
    current: Token,
}

impl TokenStream for MaterializedStream {
    fn advance(&mut self) -> bool {
        if self.idx >= self.tokens.len() {
            return false;
        }
        let (start, end, text) = &self.tokens[self.idx];
        self.current = Token {
            offset_from: *start,
            offset_to: *end,
            position: self.idx,
            text: text.clone(),
            position_length: 1,
        };
        self.idx += 1;
        true
    }

    fn token(&self) -> &Token {
        &self.current
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.current
    }
}

pub struct SparseSegment {
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    fields: Fields,
    /// path -> set of doc_ids currently indexed under that path, maintained
    /// in memory to answer `DeleteByPathPrefix` without a full index scan.
    path_index: DashMap<String, HashSet<String>>,
}

impl SparseSegment {
    pub fn open(dir: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(dir)?;

        let mut schema_builder = Schema::builder();
        let ident_indexing =
            TextFieldIndexing::default().set_tokenizer(SYMBOLS_TOKENIZER).set_index_option(
                tantivy::schema::IndexRecordOption::WithFreqsAndPositions,
            );
        let ident_options = TextOptions::default().set_indexing_options(ident_indexing).set_stored();

        let doc_id = schema_builder.add_text_field("doc_id", STRING | STORED);
        let path = schema_builder.add_text_field("path", TEXT | STORED);
        let language = schema_builder.add_text_field("language", STRING | STORED);
        let symbols = schema_builder.add_text_field("symbols", ident_options);
        let content = schema_builder.add_text_field("content", TEXT | STORED);
        let start_line = schema_builder.add_u64_field("start_line", STORED);
        let end_line = schema_builder.add_u64_field("end_line", STORED);
        let schema = schema_builder.build();

        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)?
        } else {
            Index::create_in_dir(dir, schema.clone())?
        };

        index.tokenizers().register(
            SYMBOLS_TOKENIZER,
            TextAnalyzer::builder(IdentTokenizerAdapter)
                .filter(LowerCaser)
                .build(),
        );

        let writer: IndexWriter = index.writer(50_000_000)?;
        let reader = index.reader()?;

        let fields = Fields { doc_id, path, language, symbols, content, start_line, end_line };
        let path_index = DashMap::new();

        let segment = Self { index, writer: Mutex::new(writer), reader, fields, path_index };
        segment.rebuild_path_index()?;
        Ok(segment)
    }

    /// Rebuild the in-memory `path -> doc_ids` side index from whatever is
    /// already committed on disk, so a restarted server can still answer
    /// `DeleteByPathPrefix` without a fresh full reindex.
    fn rebuild_path_index(&self) -> CoreResult<()> {
        self.reader.reload()?;
        let searcher = self.reader.searcher();
        for (segment_ord, segment_reader) in searcher.segment_readers().iter().enumerate() {
            for doc_id in 0..segment_reader.max_doc() {
                if segment_reader.is_deleted(doc_id) {
                    continue;
                }
                let address = tantivy::DocAddress::new(segment_ord as u32, doc_id);
                let Ok(doc) = searcher.doc::<tantivy::TantivyDocument>(address) else { continue };
                let path_val =
                    doc.get_first(self.fields.path).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let doc_id_val = doc
                    .get_first(self.fields.doc_id)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if !doc_id_val.is_empty() {
                    self.path_index.entry(path_val).or_default().insert(doc_id_val);
                }
            }
        }
        Ok(())
    }

    /// `Upsert([]SparseDoc)` (spec.md §4.3).
    pub fn upsert(&self, docs: &[SparseDoc]) -> CoreResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        for d in docs {
            writer.delete_term(Term::from_field_text(self.fields.doc_id, &d.doc_id));
            let tantivy_doc = doc!(
                self.fields.doc_id => d.doc_id.clone(),
                self.fields.path => d.path.clone(),
                self.fields.language => d.language.clone(),
                self.fields.symbols => d.symbols.join(" "),
                self.fields.content => d.content.clone(),
                self.fields.start_line => d.start_line as u64,
                self.fields.end_line => d.end_line as u64,
            );
            writer.add_document(tantivy_doc)?;
        }
        writer.commit()?;
        drop(writer);
        self.reader.reload()?;

        for d in docs {
            self.path_index.entry(d.path.clone()).or_default().insert(d.doc_id.clone());
        }
        Ok(())
    }

    /// `DeleteByPath(path)` — exact path match.
    pub fn delete_by_path(&self, path: &str) -> CoreResult<usize> {
        let Some((_, doc_ids)) = self.path_index.remove(path) else {
            return Ok(0);
        };
        self.delete_doc_ids(&doc_ids)?;
        Ok(doc_ids.len())
    }

    /// `DeleteByPathPrefix(prefix)`.
    pub fn delete_by_path_prefix(&self, prefix: &str) -> CoreResult<usize> {
        let matching: Vec<String> =
            self.path_index.iter().filter(|e| e.key().starts_with(prefix)).map(|e| e.key().clone()).collect();
        let mut total = HashSet::new();
        for path in &matching {
            if let Some((_, ids)) = self.path_index.remove(path) {
                total.extend(ids);
            }
        }
        self.delete_doc_ids(&total)?;
        Ok(total.len())
    }

    fn delete_doc_ids(&self, doc_ids: &HashSet<String>) -> CoreResult<()> {
        if doc_ids.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        for id in doc_ids {
            writer.delete_term(Term::from_field_text(self.fields.doc_id, id));
        }
        writer.commit()?;
        drop(writer);
        self.reader.reload()?;
        Ok(())
    }

    /// `Query(store, query_text, filter, k) -> []{doc_id, score}`, BM25
    /// scored with boosts `symbols (3x) > path (2x) > content (1x)`.
    pub fn query(&self, query_text: &str, filter: &SearchFilter, k: usize) -> CoreResult<Vec<SparseHit>> {
        if query_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        let mut parser = QueryParser::for_index(
            &self.index,
            vec![self.fields.content, self.fields.symbols, self.fields.path],
        );
        parser.set_field_boost(self.fields.symbols, 3.0);
        parser.set_field_boost(self.fields.path, 2.0);
        parser.set_field_boost(self.fields.content, 1.0);

        let query = parser
            .parse_query(&sanitize_query(query_text))
            .map_err(|e| CoreError::Validation(format!("bad query: {e}")))?;

        // Overfetch, then apply the path/language filter on stored fields —
        // keeps the query builder simple and correct rather than composing
        // exotic prefix/range queries.
        let overfetch = (k * 4).max(k + 50);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(overfetch))?;

        let mut hits = Vec::with_capacity(k);
        for (score, address) in top_docs {
            let doc: tantivy::TantivyDocument = searcher.doc(address)?;
            let path = doc.get_first(self.fields.path).and_then(|v| v.as_str()).unwrap_or_default();
            let language =
                doc.get_first(self.fields.language).and_then(|v| v.as_str()).unwrap_or_default();
            if !filter.accepts(path, language) {
                continue;
            }
            let doc_id =
                doc.get_first(self.fields.doc_id).and_then(|v| v.as_str()).unwrap_or_default();
            hits.push(SparseHit { doc_id: doc_id.to_string(), score });
            if hits.len() >= k {
                break;
            }
        }
        Ok(hits)
    }

    /// Hydrate a stored [`SparseDoc`] by `doc_id`, used to feed content into
    /// the reranker (spec.md §4.10 step 6).
    pub fn get(&self, doc_id: &str) -> CoreResult<Option<SparseDoc>> {
        let searcher = self.reader.searcher();
        let term = Term::from_field_text(self.fields.doc_id, doc_id);
        let query = tantivy::query::TermQuery::new(term, tantivy::schema::IndexRecordOption::Basic);
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        let Some((_, address)) = top.into_iter().next() else { return Ok(None) };
        let doc: tantivy::TantivyDocument = searcher.doc(address)?;
        let get_str = |f| doc.get_first(f).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let get_u64 = |f| doc.get_first(f).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        Ok(Some(SparseDoc {
            doc_id: get_str(self.fields.doc_id),
            path: get_str(self.fields.path),
            language: get_str(self.fields.language),
            symbols: get_str(self.fields.symbols).split_whitespace().map(str::to_string).collect(),
            content: get_str(self.fields.content),
            start_line: get_u64(self.fields.start_line),
            end_line: get_u64(self.fields.end_line),
        }))
    }

    pub fn doc_count(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }
}

/// `QueryParser` syntax treats several code characters specially; escape
/// them so symbols like `get_user()` don't throw a parse error.
fn sanitize_query(q: &str) -> String {
    q.chars()
        .map(|c| match c {
            '(' | ')' | '[' | ']' | '{' | '}' | '^' | '~' | '*' | '?' | ':' | '"' => ' ',
            other => other,
        })
        .collect()
}

/// Adapter so [`CodeIdentTokenizer`] can be registered through
/// `TextAnalyzer::builder`, which expects the token stream's lifetime to be
/// independent of materialization timing.
#[derive(Clone, Default)]
struct IdentTokenizerAdapter;

impl Tokenizer for IdentTokenizerAdapter {
    type TokenStream<'a> = MaterializedStream;

    fn token_stream<'a>(&mut self, text: &'a str) -> MaterializedStream {
        MaterializedStream { tokens: split_code_identifier(text), idx: 0, current: Token::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn doc(doc_id: &str, path: &str, symbols: &[&str], content: &str) -> SparseDoc {
        SparseDoc {
            doc_id: doc_id.into(),
            path: path.into(),
            language: "python".into(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            content: content.into(),
            start_line: 1,
            end_line: 2,
        }
    }

    #[test]
    fn upsert_and_query_roundtrip() {
        let dir = tempdir().unwrap();
        let seg = SparseSegment::open(dir.path()).unwrap();
        seg.upsert(&[doc("d1", "src/auth.py", &["authenticate"], "def authenticate(user, pw): ...")])
            .unwrap();

        let hits = seg.query("authenticate", &SearchFilter::default(), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d1");
    }

    #[test]
    fn delete_by_path_prefix_removes_matches() {
        let dir = tempdir().unwrap();
        let seg = SparseSegment::open(dir.path()).unwrap();
        seg.upsert(&[
            doc("d1", "src/x.go", &["x"], "func x() {}"),
            doc("d2", "src/y.go", &["y"], "func y() {}"),
            doc("d3", "docs/z.md", &[], "# z"),
        ])
        .unwrap();

        let deleted = seg.delete_by_path_prefix("src/").unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(seg.doc_count(), 1);

        let hits = seg.query("y", &SearchFilter::default(), 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn filter_by_language_excludes_others() {
        let dir = tempdir().unwrap();
        let seg = SparseSegment::open(dir.path()).unwrap();
        let mut d1 = doc("d1", "a.py", &["run"], "def run(): pass");
        d1.language = "python".into();
        let mut d2 = doc("d2", "a.go", &["run"], "func run() {}");
        d2.language = "go".into();
        seg.upsert(&[d1, d2]).unwrap();

        let filter = SearchFilter { path_prefix: None, languages: Some(vec!["go".to_string()]) };
        let hits = seg.query("run", &filter, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d2");
    }

    #[test]
    fn upsert_is_idempotent_on_same_doc_id() {
        let dir = tempdir().unwrap();
        let seg = SparseSegment::open(dir.path()).unwrap();
        seg.upsert(&[doc("d1", "a.py", &["f"], "def f(): pass")]).unwrap();
        seg.upsert(&[doc("d1", "a.py", &["f"], "def f(): return 1")]).unwrap();
        assert_eq!(seg.doc_count(), 1);
    }

    #[test]
    fn camelcase_identifier_tokenizer_splits_compound_names() {
        let dir = tempdir().unwrap();
        let seg = SparseSegment::open(dir.path()).unwrap();
        seg.upsert(&[doc("d1", "a.ts", &["getUserById"], "function getUserById(id) {}")]).unwrap();
        let hits = seg.query("user", &SearchFilter::default(), 10).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
