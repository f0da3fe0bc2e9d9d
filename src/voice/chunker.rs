//! Text chunking for streaming synthesis
//!
//! The streaming provider synthesizes best when it receives sentence-sized
//! pieces. This module splits arbitrary text into segments of at most
//! [`MAX_SEGMENT_CHARS`] characters, preferring sentence boundaries, then
//! clause boundaries, then the last whitespace before the limit.
//!
//! Segments are contiguous slices of the trimmed input, so concatenating them
//! reproduces the text (minus pieces that carry no words).

use std::sync::LazyLock;

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

/// Maximum segment length, in characters
pub const MAX_SEGMENT_CHARS: usize = 200;

/// Clause boundaries: `, and ` style conjunctions, or `;` / `:` followed by whitespace.
/// The split point is the end of the captured group.
static CLAUSE_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(,\s+)(?:and|but|or|so|yet)\s|([;:]\s+)").expect("valid regex")
});

/// Split `text` into ordered segments of at most [`MAX_SEGMENT_CHARS`] characters.
///
/// Returns an empty vector for empty or whitespace-only input. Pieces with no
/// alphanumeric character are dropped.
#[must_use]
pub fn chunk(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut sentences: Vec<&str> = trimmed.split_sentence_bounds().collect();
    if sentences.is_empty() {
        sentences.push(trimmed);
    }

    let mut segments = Vec::new();
    for sentence in sentences {
        if char_len(sentence) <= MAX_SEGMENT_CHARS {
            segments.push(sentence);
        } else {
            segments.extend(split_at_clauses(sentence));
        }
    }

    segments
        .into_iter()
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .map(ToString::to_string)
        .collect()
}

/// Split an oversized sentence at clause boundaries, hard-splitting any piece
/// that is still too long
fn split_at_clauses(text: &str) -> Vec<&str> {
    let boundaries: Vec<usize> = CLAUSE_BOUNDARY
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)).map(|m| m.end()))
        .collect();

    if boundaries.is_empty() {
        return split_by_length(text);
    }

    let mut parts = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0;
    for end in boundaries {
        if end > start {
            parts.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        parts.push(&text[start..]);
    }

    let mut result = Vec::new();
    for part in parts {
        if part.trim().is_empty() {
            continue;
        }
        if char_len(part) <= MAX_SEGMENT_CHARS {
            result.push(part);
        } else {
            result.extend(split_by_length(part));
        }
    }
    result
}

/// Split at the last whitespace within each window, or exactly at the limit
/// when the window has none
fn split_by_length(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        // Byte offset just past the first MAX_SEGMENT_CHARS characters
        let Some((window_end, _)) = remaining.char_indices().nth(MAX_SEGMENT_CHARS) else {
            pieces.push(remaining);
            break;
        };

        let window = &remaining[..window_end];
        let split_at = window
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map_or(window_end, |(i, c)| i + c.len_utf8());

        pieces.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }

    pieces
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
