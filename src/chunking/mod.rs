//! Splitting source text into bounded, overlapping chunks.
//!
//! Two chunkers share the same buffer-and-flush policy: [`markdown`] works on
//! line units (keeping fenced code blocks whole) and [`transcript`] works on
//! conversational exchanges. Token counts are a `chars / 4` estimate, not a
//! real tokenizer.

pub mod markdown;
pub mod transcript;

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;

pub use markdown::chunk_markdown;
pub use transcript::{chunk_transcript, parse_transcript_jsonl, TranscriptItem};

const CHARS_PER_TOKEN: usize = 4;

/// Buffer thresholds, all in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingOptions {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub min_tokens: usize,
    pub max_tokens: usize,
}

impl ChunkingOptions {
    pub fn markdown() -> Self {
        Self {
            target_tokens: 400,
            overlap_tokens: 80,
            min_tokens: 100,
            max_tokens: 600,
        }
    }

    /// Transcript chunks never carry overlap.
    pub fn transcript() -> Self {
        Self {
            target_tokens: 300,
            overlap_tokens: 0,
            min_tokens: 120,
            max_tokens: 520,
        }
    }

    pub fn markdown_from_config(config: &ChunkingConfig) -> Self {
        Self {
            target_tokens: config.target_tokens,
            overlap_tokens: config.overlap_tokens,
            min_tokens: config.min_tokens,
            max_tokens: config.max_tokens,
        }
    }

    pub fn transcript_from_config(config: &ChunkingConfig) -> Self {
        Self {
            target_tokens: config.transcript_target_tokens,
            overlap_tokens: 0,
            min_tokens: config.transcript_min_tokens,
            max_tokens: config.transcript_max_tokens,
        }
    }
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self::markdown()
    }
}

/// One chunk as produced by a chunker, before it has an embedding or a row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Deterministic key: source, line range and content hash prefix.
    pub chunk_id: String,
    /// First line (or transcript offset), 1-based and inclusive.
    pub start_line: usize,
    /// Last line (or transcript offset), inclusive.
    pub end_line: usize,
    pub content: String,
    pub content_hash: String,
    pub token_count: usize,
}

impl TextChunk {
    pub(crate) fn new(key_prefix: &str, start_line: usize, end_line: usize, content: String) -> Self {
        let content_hash = hash_text(&content);
        let chunk_id = format!(
            "{key_prefix}{start_line}-{end_line}:{}",
            short_hash(&content_hash)
        );
        let token_count = estimate_tokens(&content);
        Self {
            chunk_id,
            start_line,
            end_line,
            content,
            content_hash,
            token_count,
        }
    }
}

/// `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    tokens_for_chars(text.chars().count())
}

pub(crate) fn tokens_for_chars(chars: usize) -> usize {
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// SHA-256 of `text` as lowercase hex.
pub fn hash_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// First 16 hex characters of a content hash.
pub fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(16)]
}
