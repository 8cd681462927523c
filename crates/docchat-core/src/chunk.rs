//! Overlapping text chunker.
//!
//! Splits a [`DocumentSource`] into [`Chunk`]s of at most `chunk_size`
//! units that overlap their neighbour by `chunk_overlap` units. Every chunk
//! is a contiguous slice of the source text and carries a SHA-256 hash of
//! that slice, which the embedding cache uses as its content address.
//!
//! # Modes
//!
//! - **Sliding window** (no separator): a fixed window of `chunk_size`
//!   units advancing by `chunk_size - chunk_overlap`. A text of length `L`
//!   produces `ceil((L - overlap) / (size - overlap))` chunks (one chunk
//!   when `L <= size`).
//! - **Separator merge** (separator set, e.g. `"\n"`): the text is cut into
//!   separator-delimited pieces which are merged greedily while the merged
//!   slice fits `chunk_size`. The next chunk restarts at the trailing pieces
//!   that fit inside `chunk_overlap`. Boundaries always sit on a separator;
//!   a single piece longer than `chunk_size` is emitted whole.
//!
//! # Units
//!
//! Lengths are measured in characters or in estimated tokens. Token counts
//! use a fixed 4 chars ≈ 1 token ratio ([`estimate_tokens`]), the same
//! heuristic the memory budget uses.
//!
//! # Example
//!
//! ```rust
//! use docchat_core::chunk::{ChunkingOptions, LengthUnit, TextSplitter};
//! use docchat_core::models::DocumentSource;
//!
//! let splitter = TextSplitter::new(ChunkingOptions {
//!     chunk_size: 4,
//!     chunk_overlap: 1,
//!     separator: None,
//!     unit: LengthUnit::Chars,
//! })
//! .unwrap();
//! let source = DocumentSource::new("notes.txt", "abcdefghij");
//! let texts: Vec<String> = splitter.split(&source).map(|c| c.text).collect();
//! assert_eq!(texts, vec!["abcd", "defg", "ghij"]);
//! ```

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::PipelineError;
use crate::models::{Chunk, DocumentSource};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of `text`: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Unit in which `chunk_size` and `chunk_overlap` are expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    #[default]
    Chars,
    Tokens,
}

impl LengthUnit {
    /// Convert a character count into this unit.
    fn from_chars(self, chars: usize) -> usize {
        match self {
            LengthUnit::Chars => chars,
            LengthUnit::Tokens => chars.div_ceil(CHARS_PER_TOKEN),
        }
    }

    /// Number of characters covered by `n` units.
    fn to_chars(self, n: usize) -> usize {
        match self {
            LengthUnit::Chars => n,
            LengthUnit::Tokens => n * CHARS_PER_TOKEN,
        }
    }
}

/// Chunker parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separator: Option<String>,
    pub unit: LengthUnit,
}

/// Validated chunker. Construct with [`TextSplitter::new`].
#[derive(Debug, Clone)]
pub struct TextSplitter {
    options: ChunkingOptions,
}

impl TextSplitter {
    /// Validate `options` and build a splitter.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] when `chunk_size` is 0, when
    /// `chunk_overlap >= chunk_size`, or when the separator is empty.
    pub fn new(options: ChunkingOptions) -> Result<Self, PipelineError> {
        if options.chunk_size == 0 {
            return Err(PipelineError::Config("chunk_size must be > 0".into()));
        }
        if options.chunk_overlap >= options.chunk_size {
            return Err(PipelineError::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                options.chunk_overlap, options.chunk_size
            )));
        }
        if matches!(options.separator.as_deref(), Some("")) {
            return Err(PipelineError::Config("separator must not be empty".into()));
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &ChunkingOptions {
        &self.options
    }

    /// Lazily chunk one source. The returned iterator is `Clone`, so a
    /// sequence can be replayed; calling `split` again yields identical
    /// chunks.
    pub fn split<'a>(&'a self, source: &'a DocumentSource) -> Chunks<'a> {
        let text = source.text.as_str();
        let blank = text.trim().is_empty();

        let mode = match self.options.separator.as_deref() {
            _ if blank => Mode::Done,
            None => Mode::Window(Window::new(text, &self.options)),
            Some(sep) => Mode::Merge(Merge::new(text, sep)),
        };

        Chunks {
            source,
            options: &self.options,
            mode,
            next_index: 0,
        }
    }
}

/// Iterator over the chunks of one source. See [`TextSplitter::split`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    source: &'a DocumentSource,
    options: &'a ChunkingOptions,
    mode: Mode,
    next_index: usize,
}

#[derive(Debug, Clone)]
enum Mode {
    Window(Window),
    Merge(Merge),
    Done,
}

/// Sliding-window state, in characters.
#[derive(Debug, Clone)]
struct Window {
    /// Byte offset of every char, plus the text length as a sentinel.
    boundaries: Vec<usize>,
    window: usize,
    step: usize,
    start: usize,
}

impl Window {
    fn new(text: &str, options: &ChunkingOptions) -> Self {
        let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        boundaries.push(text.len());
        Self {
            boundaries,
            window: options.unit.to_chars(options.chunk_size),
            step: options.unit.to_chars(options.chunk_size - options.chunk_overlap),
            start: 0,
        }
    }

    fn char_len(&self) -> usize {
        self.boundaries.len() - 1
    }
}

/// A separator-delimited piece, as byte and char ranges.
#[derive(Debug, Clone, Copy)]
struct Piece {
    start_byte: usize,
    end_byte: usize,
    start_char: usize,
    end_char: usize,
}

/// Separator-merge state.
#[derive(Debug, Clone)]
struct Merge {
    pieces: Vec<Piece>,
    pos: usize,
}

impl Merge {
    fn new(text: &str, separator: &str) -> Self {
        let mut pieces = Vec::new();
        let mut start_byte = 0;
        let mut start_char = 0;

        let mut push = |start_byte: usize, end_byte: usize, start_char: usize| {
            let piece = &text[start_byte..end_byte];
            let end_char = start_char + piece.chars().count();
            if !piece.trim().is_empty() {
                pieces.push(Piece {
                    start_byte,
                    end_byte,
                    start_char,
                    end_char,
                });
            }
            end_char
        };

        let sep_chars = separator.chars().count();
        for (at, _) in text.match_indices(separator) {
            let end_char = push(start_byte, at, start_char);
            start_byte = at + separator.len();
            start_char = end_char + sep_chars;
        }
        push(start_byte, text.len(), start_char);

        Self { pieces, pos: 0 }
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let text = self.source.text.as_str();
        let (offset, slice) = match &mut self.mode {
            Mode::Done => return None,
            Mode::Window(w) => {
                let len = w.char_len();
                let start = w.start;
                let end = (start + w.window).min(len);
                let slice = &text[w.boundaries[start]..w.boundaries[end]];
                if end == len {
                    self.mode = Mode::Done;
                } else {
                    w.start += w.step;
                }
                (start, slice)
            }
            Mode::Merge(m) => {
                if m.pos >= m.pieces.len() {
                    self.mode = Mode::Done;
                    return None;
                }
                let (offset, slice, next) = merge_step(text, m, self.options);
                m.pos = next;
                (offset, slice)
            }
        };

        let index = self.next_index;
        self.next_index += 1;
        Some(make_chunk(self.source, index, offset, slice))
    }
}

/// Take one merged chunk starting at `m.pos`. Returns the chunk's char
/// offset, its text, and the piece index the next chunk starts at.
fn merge_step<'t>(text: &'t str, m: &Merge, options: &ChunkingOptions) -> (usize, &'t str, usize) {
    let pieces = &m.pieces;
    let pos = m.pos;
    let units = |from: usize, to: usize| {
        options
            .unit
            .from_chars(pieces[to].end_char - pieces[from].start_char)
    };

    let first = units(pos, pos);
    if first > options.chunk_size {
        warn!(
            length = first,
            chunk_size = options.chunk_size,
            "piece longer than chunk_size kept whole"
        );
    }

    let mut end = pos + 1;
    while end < pieces.len() && units(pos, end) <= options.chunk_size {
        end += 1;
    }

    let slice = &text[pieces[pos].start_byte..pieces[end - 1].end_byte];
    let offset = pieces[pos].start_char;

    if end == pieces.len() {
        return (offset, slice, end);
    }

    let mut next = end;
    while next > pos + 1 && units(next - 1, end - 1) <= options.chunk_overlap {
        next -= 1;
    }
    (offset, slice, next)
}

/// Build a [`Chunk`] with a deterministic id and SHA-256 content hash.
fn make_chunk(source: &DocumentSource, index: usize, offset: usize, text: &str) -> Chunk {
    Chunk {
        id: format!("{}#{}", source.id, index),
        source_id: source.id.clone(),
        index,
        offset,
        text: text.to_string(),
        hash: sha256_hex(text.as_bytes()),
        metadata: source.metadata.clone(),
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(size: usize, overlap: usize, sep: Option<&str>) -> TextSplitter {
        TextSplitter::new(ChunkingOptions {
            chunk_size: size,
            chunk_overlap: overlap,
            separator: sep.map(str::to_string),
            unit: LengthUnit::Chars,
        })
        .unwrap()
    }

    fn texts(s: &TextSplitter, text: &str) -> Vec<String> {
        let source = DocumentSource::new("doc", text);
        s.split(&source).map(|c| c.text).collect()
    }

    #[test]
    fn test_overlap_not_smaller_than_size_is_config_error() {
        let err = TextSplitter::new(ChunkingOptions {
            chunk_size: 10,
            chunk_overlap: 10,
            separator: None,
            unit: LengthUnit::Chars,
        })
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_zero_size_is_config_error() {
        let err = TextSplitter::new(ChunkingOptions {
            chunk_size: 0,
            chunk_overlap: 0,
            separator: None,
            unit: LengthUnit::Tokens,
        })
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(texts(&splitter(10, 2, None), "").is_empty());
        assert!(texts(&splitter(10, 2, Some("\n")), "  \n \n").is_empty());
    }

    #[test]
    fn test_window_count_matches_formula() {
        for (size, overlap) in [(4, 1), (10, 3), (7, 0), (5, 4)] {
            let s = splitter(size, overlap, None);
            for len in 1..60usize {
                let text: String = "x".repeat(len);
                let n = texts(&s, &text).len();
                let expected = if len <= size {
                    1
                } else {
                    (len - overlap).div_ceil(size - overlap)
                };
                assert_eq!(n, expected, "size={size} overlap={overlap} len={len}");
            }
        }
    }

    #[test]
    fn test_window_adjacent_chunks_overlap() {
        let s = splitter(8, 3, None);
        let text = "the quick brown fox jumps over the lazy dog";
        let chunks = texts(&s, text);
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().skip(pair[0].chars().count() - 3).collect();
            let head: String = pair[1].chars().take(3).collect();
            assert_eq!(tail, head);
        }
        assert!(text.ends_with(chunks.last().unwrap().as_str()));
    }

    #[test]
    fn test_window_offsets_advance_by_step() {
        let source = DocumentSource::new("doc", "abcdefghijklmno");
        let s = splitter(6, 2, None);
        let offsets: Vec<usize> = s.split(&source).map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8, 12]);
    }

    #[test]
    fn test_deterministic_and_restartable() {
        let s = splitter(12, 4, Some("\n"));
        let source = DocumentSource::new("doc", "alpha\nbeta\ngamma\ndelta\nepsilon\nzeta");
        let iter = s.split(&source);
        let replay = iter.clone();
        let a: Vec<Chunk> = iter.collect();
        let b: Vec<Chunk> = replay.collect();
        let c: Vec<Chunk> = s.split(&source).collect();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_separator_boundaries_are_respected() {
        let s = splitter(12, 0, Some("\n"));
        let text = "alpha\nbeta\ngamma\ndelta\nepsilon";
        let source = DocumentSource::new("doc", text);
        for chunk in s.split(&source) {
            let start = text
                .char_indices()
                .nth(chunk.offset)
                .map(|(i, _)| i)
                .unwrap();
            assert!(start == 0 || text[..start].ends_with('\n'));
            let end = start + chunk.text.len();
            assert!(end == text.len() || text[end..].starts_with('\n'));
        }
        assert_eq!(
            texts(&s, text),
            vec!["alpha\nbeta", "gamma\ndelta", "epsilon"]
        );
    }

    #[test]
    fn test_separator_overlap_repeats_trailing_piece() {
        let s = splitter(11, 5, Some("\n"));
        let chunks = texts(&s, "aaaa\nbbbb\ncccc\ndddd");
        assert_eq!(chunks, vec!["aaaa\nbbbb", "bbbb\ncccc", "cccc\ndddd"]);
    }

    #[test]
    fn test_oversized_piece_is_kept_whole() {
        let s = splitter(5, 1, Some("\n"));
        let chunks = texts(&s, "ab\nthis line is long\ncd");
        assert_eq!(chunks, vec!["ab", "this line is long", "cd"]);
    }

    #[test]
    fn test_token_unit_scales_window() {
        let s = TextSplitter::new(ChunkingOptions {
            chunk_size: 2,
            chunk_overlap: 0,
            separator: None,
            unit: LengthUnit::Tokens,
        })
        .unwrap();
        let chunks = texts(&s, &"y".repeat(20));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 8);
    }

    #[test]
    fn test_multibyte_text() {
        let s = splitter(3, 1, None);
        let chunks = texts(&s, "┌──┐│é│└──┘");
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.chars().count() <= 3);
        }
    }

    #[test]
    fn test_chunk_ids_hashes_and_metadata() {
        let source = DocumentSource::new("https://a.dev/x", "one two three four five")
            .with_lastmod("2024-01-02");
        let s = splitter(10, 2, None);
        let chunks: Vec<Chunk> = s.split(&source).collect();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.id, format!("https://a.dev/x#{i}"));
            assert_eq!(c.hash, sha256_hex(c.text.as_bytes()));
            assert_eq!(c.metadata.lastmod.as_deref(), Some("2024-01-02"));
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
