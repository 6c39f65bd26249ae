//! Line-based markdown chunking that never splits a fenced code block.

use super::{tokens_for_chars, ChunkingOptions, TextChunk};

/// A run of lines that is always kept together: a single line, or a whole
/// fenced code block.
#[derive(Debug, Clone)]
struct Unit {
    start_line: usize,
    end_line: usize,
    text: String,
    chars: usize,
}

/// Split `text` into ordered chunks keyed under `path`.
///
/// Units accumulate into a buffer which is flushed when the next unit would
/// push it over `max_tokens` (once it holds at least `min_tokens`) or when it
/// reaches `target_tokens`. Each flush seeds the next buffer with trailing
/// whole units worth up to `overlap_tokens`.
pub fn chunk_markdown(path: &str, text: &str, options: &ChunkingOptions) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let units = parse_units(text);
    let key_prefix = format!("{path}:");
    let mut chunks = Vec::new();

    let mut buffer: Vec<Unit> = Vec::new();
    // false while the buffer holds only carried-over overlap
    let mut fresh = false;

    for unit in units {
        if fresh
            && buffer_tokens_with(&buffer, &unit) > options.max_tokens
            && buffer_tokens(&buffer) >= options.min_tokens
        {
            flush(&mut buffer, &mut fresh, &key_prefix, options, &mut chunks);
        }

        if !fresh && !buffer.is_empty() && buffer_tokens_with(&buffer, &unit) > options.max_tokens {
            buffer.clear();
        }

        buffer.push(unit);
        fresh = true;

        let tokens = buffer_tokens(&buffer);
        if tokens >= options.target_tokens && tokens >= options.min_tokens {
            flush(&mut buffer, &mut fresh, &key_prefix, options, &mut chunks);
        }
    }

    if fresh {
        emit(&buffer, &key_prefix, &mut chunks);
    }

    chunks
}

fn flush(
    buffer: &mut Vec<Unit>,
    fresh: &mut bool,
    key_prefix: &str,
    options: &ChunkingOptions,
    chunks: &mut Vec<TextChunk>,
) {
    emit(buffer, key_prefix, chunks);
    let keep = overlap_len(buffer, options.overlap_tokens);
    buffer.drain(..buffer.len() - keep);
    *fresh = false;
}

fn emit(buffer: &[Unit], key_prefix: &str, chunks: &mut Vec<TextChunk>) {
    let (Some(first), Some(last)) = (buffer.first(), buffer.last()) else {
        return;
    };
    let content = buffer
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if content.trim().is_empty() {
        return;
    }
    chunks.push(TextChunk::new(key_prefix, first.start_line, last.end_line, content));
}

/// Number of trailing units that fit in `overlap_tokens`. Always fewer than
/// the whole buffer.
fn overlap_len(buffer: &[Unit], overlap_tokens: usize) -> usize {
    if overlap_tokens == 0 {
        return 0;
    }
    let mut chars = 0usize;
    let mut keep = 0usize;
    for unit in buffer.iter().rev() {
        let next = if keep == 0 { unit.chars } else { chars + 1 + unit.chars };
        if tokens_for_chars(next) > overlap_tokens || keep + 1 >= buffer.len() {
            break;
        }
        chars = next;
        keep += 1;
    }
    keep
}

fn buffer_chars(buffer: &[Unit]) -> usize {
    let content: usize = buffer.iter().map(|u| u.chars).sum();
    content + buffer.len().saturating_sub(1)
}

fn buffer_tokens(buffer: &[Unit]) -> usize {
    tokens_for_chars(buffer_chars(buffer))
}

fn buffer_tokens_with(buffer: &[Unit], next: &Unit) -> usize {
    if buffer.is_empty() {
        return tokens_for_chars(next.chars);
    }
    tokens_for_chars(buffer_chars(buffer) + 1 + next.chars)
}

fn parse_units(text: &str) -> Vec<Unit> {
    let lines: Vec<&str> = text.lines().collect();
    let mut units = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let start = i;
        if let Some((marker, len)) = opening_fence(lines[i]) {
            i += 1;
            while i < lines.len() && !closes_fence(lines[i], marker, len) {
                i += 1;
            }
            // include the closing fence; an unclosed fence runs to EOF
            i = (i + 1).min(lines.len());
        } else {
            i += 1;
        }

        let text = lines[start..i].join("\n");
        units.push(Unit {
            start_line: start + 1,
            end_line: i,
            chars: text.chars().count(),
            text,
        });
    }

    units
}

/// A line opening a fence: three or more backticks or tildes. A backtick
/// fence's info string cannot itself contain a backtick.
fn opening_fence(line: &str) -> Option<(char, usize)> {
    let trimmed = line.trim_start();
    let marker = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|c| *c == marker).count();
    if len < 3 {
        return None;
    }
    if marker == '`' && trimmed[len..].contains('`') {
        return None;
    }
    Some((marker, len))
}

fn closes_fence(line: &str, marker: char, len: usize) -> bool {
    let trimmed = line.trim();
    trimmed.chars().count() >= len && trimmed.chars().all(|c| c == marker)
}
