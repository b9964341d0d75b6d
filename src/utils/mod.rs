// Utility functions and helpers

/// Keep at most `max` characters of `text`, marking a cut with `...`.
///
/// Cuts on a character boundary, so multi-byte text never splits.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
