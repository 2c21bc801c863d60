//! Terminal escape filtering for the output pipeline.
//!
//! Two views are produced per chunk: the display text (only the bracketed
//! paste mode toggles removed, colors kept) and the clean text (every escape
//! sequence removed) that the failure detector scans.

use regex::Regex;
use std::sync::LazyLock;

const BRACKETED_PASTE_ENABLE: &str = "\x1b[?2004h";
const BRACKETED_PASTE_DISABLE: &str = "\x1b[?2004l";

/// CSI sequences, OSC strings (BEL or ST terminated), charset designators and
/// the remaining two-byte escapes.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()*+][0-9A-Za-z]|\x1b[@-Z\x5c-_=>78]",
    )
    .expect("ANSI escape regex is valid")
});

/// Remove ANSI color/style/cursor escape sequences
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Remove the bracketed paste mode enable/disable toggles, leaving every
/// other sequence (and the paste start/end markers) untouched
pub fn strip_bracketed_paste(text: &str) -> String {
    if !text.contains("\x1b[?2004") {
        return text.to_string();
    }
    text.replace(BRACKETED_PASTE_ENABLE, "")
        .replace(BRACKETED_PASTE_DISABLE, "")
}
