//! Exchange-aligned chunking for conversation transcripts.
//!
//! An exchange is one or more user turns followed by the assistant and tool
//! turns answering them. Exchanges are the atomic unit here, and exchanges
//! made only of acknowledgements ("ok", "thanks", 👍) or tool traffic are
//! folded into neighbouring content instead of being indexed on their own.

use serde::Deserialize;
use tracing::warn;

use super::{tokens_for_chars, ChunkingOptions, TextChunk};

/// One turn of a transcript, as stored one-per-line in `sessions/*.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptItem {
    User {
        #[serde(alias = "content", default)]
        text: String,
    },
    Assistant {
        #[serde(alias = "content", default)]
        text: String,
    },
    ToolCall {
        #[serde(alias = "tool", default)]
        name: String,
    },
    ToolResult {
        #[serde(alias = "tool", default)]
        name: String,
    },
    Tool {
        #[serde(alias = "tool", default)]
        name: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug)]
struct Turn {
    offset: usize,
    role: Role,
    text: String,
    ack: bool,
}

#[derive(Debug)]
struct Exchange {
    start: usize,
    end: usize,
    text: String,
    chars: usize,
    ack_only: bool,
}

const ACK_VOCABULARY: &[&str] = &[
    "ok", "okay", "okey", "k", "kk", "thanks", "thank you", "thanks a lot", "thx", "ty",
    "lol", "lmao", "haha", "hah", "cool", "nice", "great", "got it", "gotcha", "sure",
    "yes", "yep", "yeah", "yup", "no", "nope", "np", "alright", "sounds good", "perfect",
    "👍", "👌", "🙏", "✅", "🙂", "😂", "❤️",
];

fn is_ack(text: &str) -> bool {
    let normalized = text
        .trim_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .to_lowercase();
    ACK_VOCABULARY.contains(&normalized.as_str())
}

fn render(offset: usize, item: &TranscriptItem) -> Option<Turn> {
    let (role, text, ack) = match item {
        TranscriptItem::User { text } | TranscriptItem::Assistant { text } => {
            let body = text.trim();
            if body.is_empty() {
                return None;
            }
            let (role, label) = match item {
                TranscriptItem::User { .. } => (Role::User, "User"),
                _ => (Role::Assistant, "Assistant"),
            };
            (role, format!("[{label}] {body}"), is_ack(body))
        }
        TranscriptItem::ToolCall { name } => (Role::Tool, format!("[Tool Call: {name}]"), true),
        TranscriptItem::ToolResult { name } => (Role::Tool, format!("[Tool Result: {name}]"), true),
        TranscriptItem::Tool { name } => (Role::Tool, format!("[Tool: {name}]"), true),
        TranscriptItem::Unknown => return None,
    };
    Some(Turn {
        offset,
        role,
        text,
        ack,
    })
}

fn group_exchanges(turns: Vec<Turn>) -> Vec<Exchange> {
    let mut exchanges = Vec::new();
    let mut current: Vec<Turn> = Vec::new();
    let mut answered = false;

    for turn in turns {
        if turn.role == Role::User && answered {
            exchanges.push(finish_exchange(std::mem::take(&mut current)));
            answered = false;
        }
        if turn.role == Role::Assistant {
            answered = true;
        }
        current.push(turn);
    }
    if !current.is_empty() {
        exchanges.push(finish_exchange(current));
    }
    exchanges
}

fn finish_exchange(turns: Vec<Turn>) -> Exchange {
    let start = turns.first().map(|t| t.offset).unwrap_or_default();
    let end = turns.last().map(|t| t.offset).unwrap_or_default();
    let ack_only = turns.iter().all(|t| t.ack);
    let text = turns
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    Exchange {
        start,
        end,
        chars: text.chars().count(),
        text,
        ack_only,
    }
}

/// Split an ordered transcript into chunks keyed under `scope_id`.
///
/// Offsets are carried through as the chunk's line range. Overlap is never
/// applied, whatever `options.overlap_tokens` says.
pub fn chunk_transcript(
    scope_id: &str,
    items: &[(usize, TranscriptItem)],
    options: &ChunkingOptions,
) -> Vec<TextChunk> {
    let turns: Vec<Turn> = items
        .iter()
        .filter_map(|(offset, item)| render(*offset, item))
        .collect();
    let exchanges = group_exchanges(turns);

    let key_prefix = format!("{scope_id}:t:");
    let mut chunks = Vec::new();
    let mut buffer: Vec<Exchange> = Vec::new();

    for exchange in exchanges {
        let overflows =
            !buffer.is_empty() && tokens_with(&buffer, &exchange) > options.max_tokens;
        if exchange.ack_only {
            if buffer.is_empty() {
                continue;
            }
            // an ack never starts a chunk and never pushes one past the maximum
            if overflows {
                if tokens(&buffer) >= options.min_tokens {
                    emit(&mut buffer, &key_prefix, &mut chunks);
                }
                continue;
            }
        } else if overflows && tokens(&buffer) >= options.min_tokens {
            emit(&mut buffer, &key_prefix, &mut chunks);
        }

        buffer.push(exchange);

        let current = tokens(&buffer);
        if current >= options.target_tokens && current >= options.min_tokens {
            emit(&mut buffer, &key_prefix, &mut chunks);
        }
    }

    if !buffer.is_empty() {
        emit(&mut buffer, &key_prefix, &mut chunks);
    }

    chunks
}

fn chars(buffer: &[Exchange]) -> usize {
    let content: usize = buffer.iter().map(|e| e.chars).sum();
    content + buffer.len().saturating_sub(1)
}

fn tokens(buffer: &[Exchange]) -> usize {
    tokens_for_chars(chars(buffer))
}

fn tokens_with(buffer: &[Exchange], next: &Exchange) -> usize {
    tokens_for_chars(chars(buffer) + 1 + next.chars)
}

fn emit(buffer: &mut Vec<Exchange>, key_prefix: &str, chunks: &mut Vec<TextChunk>) {
    let (Some(first), Some(last)) = (buffer.first(), buffer.last()) else {
        return;
    };
    let content = buffer
        .iter()
        .map(|e| e.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    chunks.push(TextChunk::new(key_prefix, first.start, last.end, content));
    buffer.clear();
}

/// Parse a JSON Lines transcript. Offsets are 1-based line numbers; blank and
/// malformed lines are skipped.
pub fn parse_transcript_jsonl(text: &str) -> Vec<(usize, TranscriptItem)> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str::<TranscriptItem>(line) {
            Ok(item) => Some((idx + 1, item)),
            Err(e) => {
                warn!(line = idx + 1, error = %e, "skipping malformed transcript line");
                None
            }
        })
        .collect()
}
