//! Overlapping text chunker and the reassembler that undoes the overlap.
//!
//! Payloads look like `{"text": "...", "overlap_chars": 200}`, where
//! `overlap_chars` counts the leading characters repeated from the end of
//! the previous chunk. Processor results are expected to carry a `text`
//! field (or be a bare JSON string).

use serde_json::json;

use crate::processor::{ChunkPart, Chunker, Reassembler};

/// Fixed-size character windows with a configurable overlap, breaking on
/// whitespace where possible.
#[derive(Debug, Clone)]
pub struct OverlapChunker {
    chunk_chars: usize,
    overlap_chars: usize,
}

impl OverlapChunker {
    /// The overlap is clamped below half a window so every chunk advances.
    pub fn new(chunk_chars: usize, overlap_chars: usize) -> Self {
        let chunk_chars = chunk_chars.max(1);
        Self {
            chunk_chars,
            overlap_chars: overlap_chars.min((chunk_chars - 1) / 2),
        }
    }
}

impl Chunker for OverlapChunker {
    fn split(&self, input: &str) -> Vec<serde_json::Value> {
        if input.trim().is_empty() {
            return Vec::new();
        }
        let chars: Vec<char> = input.chars().collect();
        let len = chars.len();

        let mut payloads = Vec::new();
        let mut start: usize = 0;
        let mut prev_end: usize = 0;
        loop {
            let mut end = (start + self.chunk_chars).min(len);
            if end < len {
                // Prefer ending right after whitespace in the back half.
                let floor = start + self.chunk_chars / 2;
                if let Some(ws) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                    end = ws + 1;
                }
            }

            let text: String = chars[start..end].iter().collect();
            payloads.push(json!({
                "text": text,
                "overlap_chars": prev_end.saturating_sub(start),
            }));

            if end >= len {
                break;
            }
            prev_end = end;
            start = end.saturating_sub(self.overlap_chars).max(start + 1);
        }
        payloads
    }
}

/// Joins chunk results in sequence order, trimming the text each chunk
/// repeats from its predecessor and marking chunks that did not succeed.
///
/// The job result is `{"text", "gaps", "chunk_count"}`.
#[derive(Debug, Clone, Default)]
pub struct OverlapReassembler;

impl Reassembler for OverlapReassembler {
    fn reassemble(&self, parts: &[ChunkPart]) -> Result<serde_json::Value, String> {
        if parts.is_empty() {
            return Err("no chunks to reassemble".to_string());
        }
        let mut ordered: Vec<&ChunkPart> = parts.iter().collect();
        ordered.sort_by_key(|p| p.sequence_index);

        let mut text = String::new();
        let mut gaps = Vec::new();
        let mut previous_succeeded = false;

        for part in ordered {
            let index = part.sequence_index;
            match &part.result {
                None => {
                    gaps.push(index);
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&format!("[chunk {index} missing]\n"));
                    previous_succeeded = false;
                }
                Some(result) => {
                    let piece = result_text(result)
                        .ok_or_else(|| format!("chunk {index} result has no text"))?;
                    let overlap = part
                        .payload
                        .get("overlap_chars")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as usize;
                    let piece = if previous_succeeded {
                        trim_overlap(&text, piece, overlap)
                    } else {
                        piece
                    };
                    text.push_str(piece);
                    previous_succeeded = true;
                }
            }
        }

        Ok(json!({
            "text": text,
            "gaps": gaps,
            "chunk_count": parts.len(),
        }))
    }
}

fn result_text(result: &serde_json::Value) -> Option<&str> {
    result
        .get("text")
        .and_then(|t| t.as_str())
        .or_else(|| result.as_str())
}

/// Drop the prefix of `piece` that `assembled` already ends with.
///
/// Tries the full overlap first, then shorter prefixes down to half of it,
/// since a processor may shorten text slightly.
fn trim_overlap<'a>(assembled: &str, piece: &'a str, overlap: usize) -> &'a str {
    if overlap == 0 {
        return piece;
    }
    for k in (overlap.div_ceil(2)..=overlap).rev() {
        let Some(split) = char_offset(piece, k) else {
            continue;
        };
        if assembled.ends_with(&piece[..split]) {
            return &piece[split..];
        }
    }
    piece
}

/// Byte offset of the `k`-th character, or `len` when `k` is the char count.
fn char_offset(s: &str, k: usize) -> Option<usize> {
    match s.char_indices().nth(k) {
        Some((offset, _)) => Some(offset),
        None if s.chars().count() == k => Some(s.len()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_parts(payloads: &[serde_json::Value]) -> Vec<ChunkPart> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| ChunkPart {
                sequence_index: i as i32,
                payload: p.clone(),
                result: Some(json!({ "text": p["text"] })),
            })
            .collect()
    }

    const DOC: &str = "The quick brown fox jumps over the lazy dog. \
        Pack my box with five dozen liquor jugs. \
        How vexingly quick daft zebras jump!";

    #[test]
    fn blank_input_yields_no_chunks() {
        let chunker = OverlapChunker::new(100, 10);
        assert!(chunker.split("").is_empty());
        assert!(chunker.split("  \n\t ").is_empty());
    }

    #[test]
    fn short_input_is_a_single_chunk() {
        let payloads = OverlapChunker::new(100, 10).split("hello world");
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["text"], "hello world");
        assert_eq!(payloads[0]["overlap_chars"], 0);
    }

    #[test]
    fn windows_respect_size_and_overlap() {
        let payloads = OverlapChunker::new(30, 6).split(DOC);
        assert!(payloads.len() > 3);
        for (i, p) in payloads.iter().enumerate() {
            let text = p["text"].as_str().unwrap();
            assert!(text.chars().count() <= 30);
            let overlap = p["overlap_chars"].as_u64().unwrap();
            if i == 0 {
                assert_eq!(overlap, 0);
            } else {
                assert_eq!(overlap, 6);
            }
        }
    }

    #[test]
    fn split_is_deterministic() {
        let chunker = OverlapChunker::new(25, 5);
        assert_eq!(chunker.split(DOC), chunker.split(DOC));
    }

    #[test]
    fn identity_round_trip_restores_input() {
        for (size, overlap) in [(30, 6), (17, 3), (12, 0)] {
            let payloads = OverlapChunker::new(size, overlap).split(DOC);
            let result = OverlapReassembler.reassemble(&identity_parts(&payloads)).unwrap();
            assert_eq!(result["text"], DOC, "size {size} overlap {overlap}");
            assert_eq!(result["gaps"], json!([]));
        }
    }

    #[test]
    fn multibyte_text_round_trips() {
        let doc = "Grüße aus Köln, naïve café crème brûlée, déjà vu über alles.";
        let payloads = OverlapChunker::new(16, 4).split(doc);
        let result = OverlapReassembler.reassemble(&identity_parts(&payloads)).unwrap();
        assert_eq!(result["text"], doc);
    }

    #[test]
    fn failed_chunks_are_recorded_as_gaps() {
        let payloads = OverlapChunker::new(30, 6).split(DOC);
        let mut parts = identity_parts(&payloads);
        parts[1].result = None;

        let result = OverlapReassembler.reassemble(&parts).unwrap();
        assert_eq!(result["gaps"], json!([1]));
        assert_eq!(result["chunk_count"], payloads.len());
        assert!(result["text"].as_str().unwrap().contains("[chunk 1 missing]"));
    }

    #[test]
    fn parts_are_ordered_by_sequence_index() {
        let parts = vec![
            ChunkPart {
                sequence_index: 1,
                payload: json!({"overlap_chars": 0}),
                result: Some(json!("world")),
            },
            ChunkPart {
                sequence_index: 0,
                payload: json!({"overlap_chars": 0}),
                result: Some(json!("hello ")),
            },
        ];
        let result = OverlapReassembler.reassemble(&parts).unwrap();
        assert_eq!(result["text"], "hello world");
    }

    #[test]
    fn result_without_text_is_an_error() {
        let parts = vec![ChunkPart {
            sequence_index: 0,
            payload: json!({}),
            result: Some(json!({"tokens": 3})),
        }];
        assert!(OverlapReassembler.reassemble(&parts).is_err());
        assert!(OverlapReassembler.reassemble(&[]).is_err());
    }
}
