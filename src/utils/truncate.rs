//! Text Clipping
//!
//! Keeps prompt context bounded: long narratives and histories are clipped in
//! the middle so both the opening and the latest developments survive.

const APPROX_BYTES_PER_TOKEN: usize = 4;

/// Clips `content` to roughly `max_bytes`, keeping a prefix and a suffix on
/// UTF-8 boundaries with a marker noting how much was dropped.
pub fn clip_middle(content: &str, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }
    if max_bytes == 0 {
        return format!("[{} bytes omitted]", content.len());
    }

    let half = max_bytes / 2;
    let prefix_end = floor_boundary(content, half);
    let suffix_start = ceil_boundary(content, content.len() - half).max(prefix_end);

    let omitted = suffix_start - prefix_end;
    format!(
        "{} [... {} bytes omitted ...] {}",
        &content[..prefix_end],
        omitted,
        &content[suffix_start..]
    )
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Rough token count used for pre-call cost estimates.
pub fn approx_token_count(text: &str) -> usize {
    text.len().div_ceil(APPROX_BYTES_PER_TOKEN)
}
