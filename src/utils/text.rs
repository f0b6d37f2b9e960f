//! Output shaping helpers for rendered command results.

/// Cut overlong output down the middle, keeping `head` leading and `tail`
/// trailing characters around an elision marker that names the omitted count.
/// Inputs at or below `max_chars` pass through untouched.
pub fn truncate_middle(value: &str, max_chars: usize, head: usize, tail: usize) -> String {
    let total = value.chars().count();
    if total <= max_chars {
        return value.to_string();
    }
    let head_end = char_boundary(value, head);
    let tail_start = char_boundary(value, total.saturating_sub(tail));
    let omitted = total - head - tail;
    format!(
        "{}\n... [{} characters omitted] ...\n{}",
        &value[..head_end],
        omitted,
        &value[tail_start..]
    )
}

fn char_boundary(value: &str, nth_char: usize) -> usize {
    value
        .char_indices()
        .nth(nth_char)
        .map(|(idx, _)| idx)
        .unwrap_or(value.len())
}

pub fn truncate_utf8_prefix(value: &str, max_bytes: usize) -> String {
    if max_bytes == 0 {
        return String::new();
    }
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::limits;

    #[test]
    fn short_output_passes_through() {
        let text = "hello world";
        assert_eq!(
            truncate_middle(text, limits::MAX_RENDERED_CHARS, 3_000, 3_000),
            text
        );
    }

    #[test]
    fn long_output_keeps_head_and_tail_with_marker() {
        let text = "x".repeat(12_000);
        let out = truncate_middle(&text, 10_000, 3_000, 3_000);
        assert!(out.starts_with(&"x".repeat(3_000)));
        assert!(out.ends_with(&"x".repeat(3_000)));
        assert!(out.contains("[6000 characters omitted]"));
    }

    #[test]
    fn boundary_input_is_untouched() {
        let text = "y".repeat(10_000);
        assert_eq!(truncate_middle(&text, 10_000, 3_000, 3_000), text);
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let text = "é".repeat(11_000);
        let out = truncate_middle(&text, 10_000, 3_000, 3_000);
        assert!(out.starts_with(&"é".repeat(3_000)));
        assert!(out.contains("[5000 characters omitted]"));
    }

    #[test]
    fn truncate_utf8_prefix_does_not_split_chars() {
        assert_eq!(truncate_utf8_prefix("aé", 2), "a");
        assert_eq!(truncate_utf8_prefix("aé", 3), "aé");
    }
}
