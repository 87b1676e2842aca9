//! Text helpers shared by the hook path, the transcript reconciler and the
//! terminal bridge.
//!
//! Fingerprints are how a transcript entry is recognised as the same message
//! a hook already recorded. Normalisation rules:
//! - ANSI escape sequences are removed
//! - every run of whitespace (including newlines) becomes a single space
//! - leading/trailing whitespace is trimmed
//! - the result is cut to [`FINGERPRINT_CHARS`] characters
//!
//! Case and punctuation are preserved.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Prefix length that participates in a fingerprint. Hook payloads and
/// transcripts occasionally disagree on trailing content of long messages.
pub const FINGERPRINT_CHARS: usize = 500;

/// Strip ANSI escape sequences from a string.
pub fn strip_ansi(input: &str) -> String {
    // CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}

/// Canonical form used for fingerprinting.
pub fn normalize(input: &str) -> String {
    let stripped = strip_ansi(input);
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(FINGERPRINT_CHARS).collect()
}

/// True when the text carries no conversational content.
pub fn is_trivial(input: &str) -> bool {
    normalize(input).is_empty()
}

/// Hex SHA-256 of the normalised text, or `None` for trivial text.
pub fn fingerprint(input: &str) -> Option<String> {
    let normalized = normalize(input);
    if normalized.is_empty() {
        return None;
    }
    let digest = Sha256::digest(normalized.as_bytes());
    Some(format!("{digest:x}"))
}

/// Shorten text for log fields.
pub fn preview(input: &str, max_chars: usize) -> String {
    let normalized = normalize(input);
    if normalized.chars().count() <= max_chars {
        normalized
    } else {
        let head: String = normalized.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
