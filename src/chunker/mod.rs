//! Document chunking
//!
//! Splits raw document text into overlapping, sentence-boundary-respecting
//! segments sized for the embedding model's context window.

use serde::{Deserialize, Serialize};

/// Chunker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Approximate tokens per chunk
    pub chunk_size: usize,
    /// Overlap between consecutive chunks, in tokens
    pub chunk_overlap: usize,
    /// Rough characters-per-token estimate used for sizing
    pub chars_per_token: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            chars_per_token: 4,
        }
    }
}

/// A contiguous, whitespace-trimmed slice of a source document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
    /// Byte offset of the untrimmed chunk start in the source document
    pub start_position: usize,
    /// Byte offset one past the untrimmed chunk end
    pub end_position: usize,
    /// Sequential index within one `chunk_document` call
    pub chunk_index: usize,
}

/// Splits documents into chunks at sentence boundaries
#[derive(Debug, Clone, Default)]
pub struct DocumentChunker {
    config: ChunkerConfig,
}

impl DocumentChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Split a document into overlapping chunks.
    ///
    /// Empty input yields an empty vector. Identical input always yields
    /// identical output.
    pub fn chunk_document(&self, text: &str) -> Vec<TextChunk> {
        if text.is_empty() {
            return Vec::new();
        }

        let boundaries = find_sentence_boundaries(text);
        self.split_by_boundaries(text, &boundaries)
    }

    /// Cheap token-count heuristic used for chunk-size planning only
    pub fn estimate_tokens(&self, text: &str) -> usize {
        text.len() / self.config.chars_per_token.max(1)
    }

    fn split_by_boundaries(&self, text: &str, boundaries: &[usize]) -> Vec<TextChunk> {
        // Overlap must trail the chunk length or the scan cannot advance
        let chunk_chars = (self.config.chunk_size * self.config.chars_per_token).max(1);
        let overlap_chars =
            (self.config.chunk_overlap * self.config.chars_per_token).min(chunk_chars - 1);

        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut start_pos = 0usize;

        while start_pos < text.len() {
            // End at the nearest sentence boundary at or after the target
            // length, or at end-of-text when no boundary remains.
            let target_end = start_pos + chunk_chars;
            let end_pos = boundaries
                .iter()
                .copied()
                .find(|&b| b >= target_end)
                .unwrap_or(text.len());

            // A trailing fragment shorter than half a chunk merges into the
            // previous chunk instead of becoming a near-empty chunk.
            if end_pos - start_pos < chunk_chars / 2 && !chunks.is_empty() {
                let tail = text[start_pos..].trim();
                if !tail.is_empty() {
                    if let Some(last) = chunks.last_mut() {
                        last.text.push(' ');
                        last.text.push_str(tail);
                        last.end_position = text.len();
                    }
                }
                break;
            }

            let trimmed = text[start_pos..end_pos].trim();
            if !trimmed.is_empty() {
                chunks.push(TextChunk {
                    text: trimmed.to_string(),
                    start_position: start_pos,
                    end_position: end_pos,
                    chunk_index: chunks.len(),
                });
            }

            if end_pos >= text.len() {
                break;
            }

            // Back up to create overlap; when the backup cannot make
            // progress the next chunk starts at the boundary itself.
            start_pos = if end_pos > overlap_chars {
                end_pos - overlap_chars
            } else {
                end_pos
            };
            while !text.is_char_boundary(start_pos) {
                start_pos += 1;
            }
        }

        chunks
    }
}

/// Offsets immediately following `.`, `!`, `?`, or newline when followed by
/// whitespace, with 0 and `text.len()` as implicit boundaries.
fn find_sentence_boundaries(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut boundaries = vec![0];

    for i in 0..bytes.len() {
        match bytes[i] {
            b'.' | b'!' | b'?' | b'\n' => {
                if i + 1 < bytes.len() && bytes[i + 1].is_ascii_whitespace() {
                    boundaries.push(i + 1);
                }
            }
            _ => {}
        }
    }

    boundaries.push(text.len());
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunker(chunk_size: usize, overlap: usize) -> DocumentChunker {
        DocumentChunker::new(ChunkerConfig {
            chunk_size,
            chunk_overlap: overlap,
            chars_per_token: 4,
        })
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunker = DocumentChunker::default();
        assert!(chunker.chunk_document("").is_empty());
    }

    #[test]
    fn whitespace_only_input_yields_no_chunks() {
        let chunker = small_chunker(4, 0);
        assert!(chunker.chunk_document("   \n\t  ").is_empty());
    }

    #[test]
    fn short_document_is_one_chunk() {
        let chunker = DocumentChunker::default();
        let chunks = chunker.chunk_document("The sky is blue. Water is wet.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "The sky is blue. Water is wet.");
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn chunking_is_deterministic() {
        let chunker = small_chunker(8, 2);
        let text = "One sentence here. Another sentence there. A third one follows. \
                    And a fourth for good measure. Then a fifth sentence arrives.";
        assert_eq!(chunker.chunk_document(text), chunker.chunk_document(text));
    }

    #[test]
    fn indices_are_contiguous_and_positions_bounded() {
        let chunker = small_chunker(8, 2);
        let text = "First sentence is short. Second sentence is a bit longer than that. \
                    Third sentence keeps going for a while longer still. Fourth one too.";
        let chunks = chunker.chunk_document(text);
        assert!(chunks.len() >= 2);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert!(chunk.start_position <= chunk.end_position);
            assert!(chunk.end_position <= text.len());
        }
    }

    #[test]
    fn chunks_are_trimmed_and_non_empty() {
        let chunker = small_chunker(8, 2);
        let text = "Alpha beta gamma delta epsilon.  \n Zeta eta theta iota kappa lambda. \
                    Mu nu xi omicron pi rho sigma. Tau upsilon phi chi psi omega again.";
        for chunk in chunker.chunk_document(text) {
            assert!(!chunk.text.is_empty());
            assert_eq!(chunk.text, chunk.text.trim());
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let chunker = small_chunker(8, 4);
        let text = "The quick brown fox jumps over the lazy dog near the river bank. \
                    A second sentence stretches the document well past a single chunk. \
                    The third sentence exists to force yet another chunk boundary here. \
                    Finally a fourth sentence closes out the whole test document nicely.";
        let chunks = chunker.chunk_document(text);
        assert!(chunks.len() >= 2, "expected multiple chunks, got {}", chunks.len());
        for pair in chunks.windows(2) {
            assert!(pair[1].start_position < pair[0].end_position);
        }
    }

    #[test]
    fn trailing_fragment_merges_into_previous_chunk() {
        let chunker = small_chunker(8, 0);
        // 32-char target; the last sentence is much shorter than 16 chars
        let text = "This first sentence runs long enough to fill one whole chunk. Tiny tail.";
        let chunks = chunker.chunk_document(text);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.ends_with("Tiny tail."));
        assert_eq!(chunks[0].end_position, text.len());
    }

    #[test]
    fn token_estimate_uses_char_heuristic() {
        let chunker = DocumentChunker::default();
        assert_eq!(chunker.estimate_tokens("abcdefgh"), 2);
        assert_eq!(chunker.estimate_tokens(""), 0);
    }
}
