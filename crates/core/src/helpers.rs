//! Helper functions for text normalization and speaker-line formatting.

use regex::Regex;
use std::sync::LazyLock;

// Any whitespace run that contains at least one newline
static NEWLINE_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\n\s*").unwrap());

/// Normalize a text block into canonical single-spaced-paragraph form.
///
/// Every run of whitespace containing a newline collapses to a single
/// newline; leading and trailing whitespace is trimmed. Idempotent.
/// Applied to every text field immediately before it is included in an
/// emitted sample.
pub fn normalize_message(text: &str) -> String {
    NEWLINE_RUN_RE.replace_all(text, "\n").trim().to_string()
}

/// Remove literal code-fence markers from knowledge content and trim.
///
/// Character books exported from chat frontends often wrap profiles in
/// ```` ```yaml ```` fences; the markers carry no information for the
/// model.
pub fn strip_code_fences(text: &str) -> String {
    text.replace("```yaml", "").replace("```", "").trim().to_string()
}

/// Render one turn as `[speaker]: text` with normalized text.
///
/// Used for the instruction encoding's `input` field and history pairs.
pub fn bracket_speaker_line(speaker: &str, text: &str) -> String {
    format!("[{}]: {}", speaker, normalize_message(text))
}

/// Render one transcript-history line as `**speaker**: text`, newline-terminated.
pub(crate) fn labeled_history_line(speaker: &str, text: &str) -> String {
    format!("**{}**: {}\n", speaker, normalize_message(text))
}
