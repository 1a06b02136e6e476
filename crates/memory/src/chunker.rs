//! Semantic chunking of long source text.
//!
//! Text is cut on paragraph boundaries first. A paragraph too large for one
//! chunk is cut on sentence boundaries, and a sentence too large for one
//! chunk is cut into word windows. Pieces are then packed greedily, small
//! chunks are folded into a neighbour, and each chunk after the first is
//! prefixed with the tail of its predecessor so retrieval keeps continuity
//! across boundaries.

use lorekeep_core::error::Error;
use lorekeep_core::token::{estimate_tokens, truncate_to_tokens};

/// Splits text into overlapping, token-bounded chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    max_tokens: usize,
    overlap_tokens: usize,
    min_chunk_tokens: usize,
}

/// A paragraph and the pieces it splits into when it must be broken up.
#[derive(Debug)]
struct Paragraph<'a> {
    text: &'a str,
    pieces: Vec<&'a str>,
}

impl Chunker {
    /// Create a chunker. `overlap_tokens` must be smaller than `max_tokens`.
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self, Error> {
        if max_tokens == 0 {
            return Err(Error::Input("max_tokens must be greater than zero".into()));
        }
        if overlap_tokens >= max_tokens {
            return Err(Error::Input(format!(
                "overlap_tokens ({overlap_tokens}) must be smaller than max_tokens ({max_tokens})"
            )));
        }
        Ok(Self {
            max_tokens,
            overlap_tokens,
            min_chunk_tokens: max_tokens / 5,
        })
    }

    /// Chunks smaller than this are merged into a neighbour when they fit.
    pub fn with_min_chunk_tokens(mut self, min_chunk_tokens: usize) -> Self {
        self.min_chunk_tokens = min_chunk_tokens;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    /// Room left for a chunk's own text once the overlap prefix and its
    /// joining space are accounted for.
    fn body_budget(&self) -> usize {
        if self.overlap_tokens == 0 {
            self.max_tokens
        } else {
            self.max_tokens
                .saturating_sub(self.overlap_tokens + 1)
                .max(1)
        }
    }

    /// Split `text` into ordered chunk texts.
    pub fn chunk(&self, text: &str) -> Result<Vec<String>, Error> {
        if text.trim().is_empty() {
            return Err(Error::Input("cannot chunk empty text".into()));
        }

        let budget = self.body_budget();
        let bodies = self.pack(&split_paragraphs(text, budget), budget);

        let mut chunks = Vec::with_capacity(bodies.len());
        for (i, body) in bodies.iter().enumerate() {
            if i == 0 || self.overlap_tokens == 0 {
                chunks.push(body.clone());
                continue;
            }
            let tail = tail_within(&bodies[i - 1], self.overlap_tokens);
            if tail.is_empty() {
                chunks.push(body.clone());
            } else {
                chunks.push(format!("{tail} {body}"));
            }
        }

        tracing::debug!(
            chunks = chunks.len(),
            max_tokens = self.max_tokens,
            overlap_tokens = self.overlap_tokens,
            "Chunked source text"
        );
        Ok(chunks)
    }

    /// Greedily pack paragraphs into bodies of at most `budget` tokens.
    ///
    /// A paragraph that fits is kept whole. When it does not fit next to
    /// an undersized body, the paragraph is fed in piece by piece instead,
    /// so the small body is merged forward rather than emitted alone.
    fn pack(&self, paragraphs: &[Paragraph<'_>], budget: usize) -> Vec<String> {
        let mut bodies = Vec::new();
        let mut current = String::new();

        for para in paragraphs {
            if fits(&current, "\n\n", para.text, budget) {
                append(&mut current, "\n\n", para.text);
                continue;
            }
            if !current.is_empty() && estimate_tokens(&current) >= self.min_chunk_tokens {
                bodies.push(std::mem::take(&mut current));
            }
            if current.is_empty() && estimate_tokens(para.text) <= budget {
                current.push_str(para.text);
                continue;
            }
            for (i, piece) in para.pieces.iter().enumerate() {
                let sep = if i == 0 { "\n\n" } else { " " };
                if !fits(&current, sep, piece, budget) {
                    bodies.push(std::mem::take(&mut current));
                }
                append(&mut current, sep, piece);
            }
        }
        if !current.is_empty() {
            bodies.push(current);
        }
        bodies
    }
}

fn fits(current: &str, sep: &str, piece: &str, budget: usize) -> bool {
    if current.is_empty() {
        return estimate_tokens(piece) <= budget;
    }
    estimate_tokens(current) + estimate_tokens(sep) + estimate_tokens(piece) <= budget
}

fn append(current: &mut String, sep: &str, piece: &str) {
    if !current.is_empty() {
        current.push_str(sep);
    }
    current.push_str(piece);
}

/// Chunk with the default minimum chunk size.
pub fn chunk(text: &str, max_tokens: usize, overlap_tokens: usize) -> Result<Vec<String>, Error> {
    Chunker::new(max_tokens, overlap_tokens)?.chunk(text)
}

/// Paragraphs with their sentence pieces; a sentence larger than `budget`
/// is further cut into word windows.
fn split_paragraphs(text: &str, budget: usize) -> Vec<Paragraph<'_>> {
    paragraphs(text)
        .into_iter()
        .map(|para| {
            let mut pieces = Vec::new();
            for sentence in sentences(para) {
                if estimate_tokens(sentence) <= budget {
                    pieces.push(sentence);
                } else {
                    pieces.extend(word_windows(sentence, budget));
                }
            }
            Paragraph { text: para, pieces }
        })
        .collect()
}

/// Non-empty paragraphs separated by blank lines, trimmed.
pub fn paragraphs(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                out.push(text[s..end].trim());
            }
        } else {
            if start.is_none() {
                start = Some(offset);
            }
            end = offset + line.len();
        }
        offset += line.len();
    }
    if let Some(s) = start {
        out.push(text[s..end].trim());
    }
    out
}

/// Sentences ending in `.`, `!` or `?` followed by whitespace.
fn sentences(paragraph: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = paragraph.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
            if at_boundary {
                let end = i + c.len_utf8();
                let sentence = paragraph[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = end;
            }
        }
    }
    let rest = paragraph[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Byte offsets where each whitespace-delimited word starts.
fn word_starts(text: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut prev_ws = true;
    for (i, c) in text.char_indices() {
        if !c.is_whitespace() && prev_ws {
            starts.push(i);
        }
        prev_ws = c.is_whitespace();
    }
    starts
}

/// Contiguous slices of whole words, each at most `budget` tokens. A single
/// word larger than the budget is cut on char boundaries.
fn word_windows(sentence: &str, budget: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = sentence.trim();

    while !rest.is_empty() {
        let starts = word_starts(rest);
        let word_ends = starts
            .iter()
            .skip(1)
            .map(|&next| rest[..next].trim_end().len())
            .chain(std::iter::once(rest.len()));
        // Extend the window word by word while it still fits.
        let mut end = 0;
        for word_end in word_ends {
            if estimate_tokens(&rest[..word_end]) <= budget {
                end = word_end;
            } else {
                break;
            }
        }
        if end == 0 {
            end = truncate_to_tokens(rest, budget).len();
            if end == 0 {
                // budget smaller than one char; take the first char
                end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
            }
        }
        out.push(rest[..end].trim());
        rest = rest[end..].trim_start();
    }
    out
}

/// The longest suffix of whole words of `text` that fits in `max_tokens`.
fn tail_within(text: &str, max_tokens: usize) -> &str {
    let mut tail = "";
    for &start in word_starts(text).iter().rev() {
        let candidate = &text[start..];
        if estimate_tokens(candidate) <= max_tokens {
            tail = candidate;
        } else {
            break;
        }
    }
    tail
}
