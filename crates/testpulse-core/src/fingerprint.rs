//! Failure fingerprints.
//!
//! Two failures are "the same defect" when their normalised messages match.
//! Normalisation erases the parts of a message that vary between runs of the
//! same bug (addresses, uuids, timings, whitespace); the fingerprint is the
//! SHA-256 of what is left.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use testpulse_state::TestId;

static RE_HEX_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("valid regex"));
static RE_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("valid regex")
});
static RE_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+(\.\d+)?\s?(ns|us|µs|ms|s|sec|secs|seconds)\b").expect("valid regex")
});
static RE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Erase run-specific noise from a failure message.
pub fn normalize(message: &str) -> String {
    let text = RE_UUID.replace_all(message, "<uuid>");
    let text = RE_HEX_ADDR.replace_all(&text, "0x?");
    let text = RE_DURATION.replace_all(&text, "<duration>");
    let text = RE_WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}

/// Fingerprint of a failure.
///
/// A failure without a message cannot be matched against other failures, so
/// it is keyed by its test instead.
pub fn fingerprint(message: Option<&str>, test_id: &TestId) -> String {
    match message.map(str::trim).filter(|m| !m.is_empty()) {
        Some(message) => {
            let mut hasher = Sha256::new();
            hasher.update(normalize(message).as_bytes());
            hex::encode(hasher.finalize())
        }
        None => format!("<no message>::{test_id}"),
    }
}
