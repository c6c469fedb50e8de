//! A small in-memory document index backing the agent's search tool.
//!
//! Plain-text and markdown files under a directory are split into
//! overlapping chunks and ranked by term overlap with the query.

use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

const CHUNK_CHARS: usize = 1000;
const CHUNK_OVERLAP: usize = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentHit {
    pub content: String,
    pub source: String,
    pub relevance: f32,
}

#[derive(Debug, Clone)]
struct Chunk {
    source: String,
    content: String,
    terms: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct DocumentIndex {
    chunks: Vec<Chunk>,
}

impl DocumentIndex {
    /// Loads every `.txt` and `.md` file below `dir`. Unreadable files are
    /// skipped with a warning; a missing directory yields an empty index.
    pub async fn load(dir: &Path) -> Self {
        let mut index = Self::default();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %current.display(), "cannot read document directory: {}", e);
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                match entry.file_type().await {
                    Ok(ft) if ft.is_dir() => pending.push(path),
                    Ok(ft) if ft.is_file() && is_document(&path) => {
                        match tokio::fs::read_to_string(&path).await {
                            Ok(text) => index.add(&path.display().to_string(), &text),
                            Err(e) => {
                                tracing::warn!(path = %path.display(), "skipping unreadable document: {}", e)
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        tracing::info!(chunks = index.len(), dir = %dir.display(), "document index loaded");
        index
    }

    pub fn add(&mut self, source: &str, text: &str) {
        for content in split_chunks(text) {
            let terms = terms_of(&content);
            if terms.is_empty() {
                continue;
            }
            self.chunks.push(Chunk {
                source: source.to_string(),
                content,
                terms,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Top `limit` chunks sharing at least one term with `query`, best first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<DocumentHit> {
        let query_terms = terms_of(query);
        if query_terms.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<DocumentHit> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let shared = query_terms.intersection(&chunk.terms).count();
                (shared > 0).then(|| DocumentHit {
                    content: chunk.content.clone(),
                    source: chunk.source.clone(),
                    relevance: shared as f32 / query_terms.len() as f32,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        hits.truncate(limit);
        hits
    }
}

fn is_document(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("txt") | Some("md")
    )
}

fn split_chunks(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= CHUNK_CHARS {
        return vec![text.trim().to_string()];
    }
    let step = CHUNK_CHARS - CHUNK_OVERLAP;
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + CHUNK_CHARS).min(chars.len());
        chunks.push(chars[start..end].iter().collect::<String>().trim().to_string());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Lowercased alphanumeric words, plus each CJK character on its own since
/// those scripts do not separate words with spaces.
fn terms_of(text: &str) -> HashSet<String> {
    let mut terms = HashSet::new();
    let mut word = String::new();
    for c in text.chars() {
        if is_cjk(c) {
            if !word.is_empty() {
                terms.insert(std::mem::take(&mut word));
            }
            terms.insert(c.to_string());
        } else if c.is_alphanumeric() {
            word.extend(c.to_lowercase());
        } else if !word.is_empty() {
            terms.insert(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        terms.insert(word);
    }
    terms
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{3040}'..='\u{30FF}')
}
