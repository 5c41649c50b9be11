//! Discord message sizing.
//!
//! Discord rejects message content longer than 2000 characters. Long replies
//! are split at natural boundaries; interaction answers, which are a single
//! message, are truncated.

/// Maximum message length for Discord, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Split a message into chunks that fit Discord's character limit.
///
/// Prefers splitting after a newline, then after a space.
pub fn split_message(text: &str) -> Vec<String> {
    if text.chars().count() <= MAX_MESSAGE_LENGTH {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.chars().count() > MAX_MESSAGE_LENGTH {
        let split_point = find_split_point(remaining, MAX_MESSAGE_LENGTH);
        let (head, tail) = remaining.split_at(split_point);
        let head = head.trim_end_matches('\n');
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        remaining = tail;
    }

    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }

    chunks
}

/// Byte offset to split `text` at so the head holds at most `max_chars` characters.
fn find_split_point(text: &str, max_chars: usize) -> usize {
    let limit = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(i, _)| i);
    let window = &text[..limit];

    window
        .rfind('\n')
        .or_else(|| window.rfind(' '))
        .filter(|&pos| pos > 0)
        .map_or(limit, |pos| pos + 1)
}

/// Cut `text` down to Discord's limit, marking the cut.
pub fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_LENGTH {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_MESSAGE_LENGTH - 3).collect();
    cut.push_str("...");
    cut
}
