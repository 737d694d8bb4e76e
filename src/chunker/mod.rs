//! Splits source files into retrievable chunks with stable identity.
//!
//! Structural splitting via tree-sitter where a grammar exists; fixed-size
//! line windows with 20% overlap everywhere else. Pure and deterministic:
//! the same content always yields the same chunk ids and boundaries.

pub mod languages;

use languages::LanguageConfig;
use std::collections::HashMap;
use tracing::warn;
use tree_sitter::{Parser, Query, QueryCursor, StreamingIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Function,
    Class,
    Window,
    WholeFile,
}

impl ChunkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Class => "class",
            ChunkKind::Window => "window",
            ChunkKind::WholeFile => "whole_file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(ChunkKind::Function),
            "class" => Some(ChunkKind::Class),
            "window" => Some(ChunkKind::Window),
            "whole_file" => Some(ChunkKind::WholeFile),
            _ => None,
        }
    }
}

/// A contiguous unit of source text with stable identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Hash of file path + chunk ordinal + content hash.
    pub id: String,
    pub file_path: String,
    /// 1-based, inclusive.
    pub line_start: usize,
    /// 1-based, inclusive.
    pub line_end: usize,
    pub language: String,
    pub kind: ChunkKind,
    pub content: String,
    pub content_hash: String,
    /// Bumped by the index manager whenever the vector is recomputed.
    pub index_version: u64,
}

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Hard upper bound on chunk size in characters.
    pub max_chunk_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 2000,
        }
    }
}

pub struct Chunker {
    queries: HashMap<String, Query>,
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut queries = HashMap::new();
        for lang in LanguageConfig::get_all() {
            let query = Query::new(&lang.language, lang.symbol_query)?;
            queries.insert(lang.name.to_string(), query);
        }
        Ok(Self { queries, config })
    }

    /// Split `content` into ordered chunks. Never fails on malformed source:
    /// parse problems degrade to window chunking for the whole file.
    pub fn chunk(&self, file_path: &str, content: &str, language: &str) -> Vec<Chunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let lines: Vec<&str> = content.lines().collect();

        let mut pieces = match self.structural_pieces(content, language) {
            Some(p) if !p.is_empty() => p,
            _ => fallback_pieces(&lines, self.config.max_chunk_chars),
        };

        // Structural units over budget get re-split into windows over their
        // own line range, so line continuity is preserved.
        pieces = pieces
            .into_iter()
            .flat_map(|p| {
                if p.content.chars().count() > self.config.max_chunk_chars {
                    let sub_lines: Vec<&str> = p.content.lines().collect();
                    window_pieces(&sub_lines, p.line_start, self.config.max_chunk_chars)
                } else {
                    vec![p]
                }
            })
            .collect();

        pieces
            .into_iter()
            .enumerate()
            .map(|(ordinal, p)| {
                let content_hash = hash_hex(p.content.as_bytes());
                let id = chunk_id(file_path, ordinal, &content_hash);
                Chunk {
                    id,
                    file_path: file_path.to_string(),
                    line_start: p.line_start,
                    line_end: p.line_end,
                    language: language.to_string(),
                    kind: p.kind,
                    content: p.content,
                    content_hash,
                    index_version: 0,
                }
            })
            .collect()
    }

    /// Extract function/class symbols using the language's query.
    /// `None` means fallback chunking should be used instead.
    fn structural_pieces(&self, content: &str, language: &str) -> Option<Vec<Piece>> {
        let config = LanguageConfig::get_by_name(language)?;
        let query = self.queries.get(language)?;

        let mut parser = Parser::new();
        if parser.set_language(&config.language).is_err() {
            warn!(language, "grammar rejected by parser, using window fallback");
            return None;
        }
        let Some(tree) = parser.parse(content, None) else {
            warn!(language, "parse failed, using window fallback");
            return None;
        };

        let source = content.as_bytes();
        let mut cursor = QueryCursor::new();
        let mut pieces = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let mut matches = cursor.matches(query, tree.root_node(), source);
        while let Some(m) = matches.next() {
            for cap in m.captures {
                let capture_name = &query.capture_names()[cap.index as usize];
                let kind = match *capture_name {
                    "function" => ChunkKind::Function,
                    "class" => ChunkKind::Class,
                    _ => continue,
                };

                let node = cap.node;
                if !seen.insert((node.start_byte(), node.end_byte())) {
                    continue;
                }
                let Ok(text) = node.utf8_text(source) else {
                    continue;
                };
                pieces.push(Piece {
                    content: text.to_string(),
                    line_start: node.start_position().row + 1,
                    line_end: node.end_position().row + 1,
                    kind,
                });
            }
        }

        pieces.sort_by_key(|p| (p.line_start, p.line_end));
        Some(pieces)
    }
}

struct Piece {
    content: String,
    line_start: usize,
    line_end: usize,
    kind: ChunkKind,
}

/// Whole-file chunk when it fits the budget, line windows otherwise.
fn fallback_pieces(lines: &[&str], max_chars: usize) -> Vec<Piece> {
    let total: usize = lines.iter().map(|l| l.chars().count() + 1).sum();
    if total <= max_chars {
        return vec![Piece {
            content: lines.join("\n"),
            line_start: 1,
            line_end: lines.len().max(1),
            kind: ChunkKind::WholeFile,
        }];
    }
    window_pieces(lines, 1, max_chars)
}

/// Sliding line windows bounded by `max_chars`, stepping back 20% of each
/// window's lines for overlap. A single line over the budget (minified
/// sources) is split at character boundaries instead, keeping its line
/// number, so no piece ever exceeds `max_chars`.
fn window_pieces(lines: &[&str], first_line: usize, max_chars: usize) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].chars().count() > max_chars {
            split_long_line(lines[i], first_line + i, max_chars, &mut pieces);
            i += 1;
            continue;
        }

        let mut j = i;
        let mut used = 0;
        while j < lines.len() {
            let cost = lines[j].chars().count() + 1;
            if used > 0 && used + cost > max_chars {
                break;
            }
            used += cost;
            j += 1;
        }

        pieces.push(Piece {
            content: lines[i..j].join("\n"),
            line_start: first_line + i,
            line_end: first_line + j - 1,
            kind: ChunkKind::Window,
        });

        if j >= lines.len() {
            break;
        }
        let overlap = (j - i) / 5;
        i = (j - overlap).max(i + 1);
    }

    pieces
}

fn split_long_line(line: &str, line_no: usize, max_chars: usize, pieces: &mut Vec<Piece>) {
    let chars: Vec<char> = line.chars().collect();
    let step = max_chars.max(1);
    let mut start = 0;
    while start < chars.len() {
        let end = (start + step).min(chars.len());
        pieces.push(Piece {
            content: chars[start..end].iter().collect(),
            line_start: line_no,
            line_end: line_no,
            kind: ChunkKind::Window,
        });
        start = end;
    }
}

fn hash_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn chunk_id(file_path: &str, ordinal: usize, content_hash: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(file_path.as_bytes());
    hasher.update(&[0]);
    hasher.update(&ordinal.to_le_bytes());
    hasher.update(&[0]);
    hasher.update(content_hash.as_bytes());
    hasher.finalize().to_hex().to_string()
}
