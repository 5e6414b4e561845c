//! Turns raw sandbox bytes into user-visible text.
//!
//! The stages run in a fixed order: frame headers, control bytes, line
//! endings, attach artifacts. `sanitize` is pure and idempotent on its own
//! output.

use once_cell::sync::Lazy;
use regex::Regex;

/// Length of the multiplexing header: one stream tag byte, three zero
/// bytes, then a big-endian u32 payload length.
pub const FRAME_HEADER_LEN: usize = 8;

/// How the sandbox channel delivers stdout and stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Separate per-stream channels, no headers in the bytes.
    Demultiplexed,
    /// One combined channel where every frame carries a header.
    Multiplexed,
}

/// Boolean stream-capability flags that show up when attach negotiation
/// leaks into program output.
const ARTIFACT_KEYS: &[&str] = &["stream", "stdin", "stdout", "stderr", "logs", "hijack", "tty"];

static ARTIFACT_RE: Lazy<Regex> = Lazy::new(|| {
    let key = format!(r#""(?:{})"\s*:\s*(?:true|false)"#, ARTIFACT_KEYS.join("|"));
    Regex::new(&format!(r"\{{\s*{key}(?:\s*,\s*{key})*\s*\}}")).expect("artifact pattern is valid")
});

/// Sanitize one raw chunk.
pub fn sanitize(raw: &[u8], framing: Framing) -> String {
    let payload = match framing {
        Framing::Multiplexed => strip_frame_headers(raw),
        Framing::Demultiplexed => raw.to_vec(),
    };
    let text = String::from_utf8_lossy(&payload);
    let text = drop_control_chars(&text);
    let text = normalize_line_endings(&text);
    strip_artifacts(&text)
}

/// Remove every frame header from a multiplexed chunk, keeping payloads in
/// order. Bytes that do not start with a plausible header are passed
/// through untouched.
pub fn strip_frame_headers(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while rest.len() >= FRAME_HEADER_LEN && is_frame_header(&rest[..FRAME_HEADER_LEN]) {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = FRAME_HEADER_LEN.saturating_add(len).min(rest.len());
        out.extend_from_slice(&rest[FRAME_HEADER_LEN..end]);
        rest = &rest[end..];
    }
    out.extend_from_slice(rest);
    out
}

fn is_frame_header(header: &[u8]) -> bool {
    // 0 = stdin, 1 = stdout, 2 = stderr
    header[0] <= 2 && header[1..4] == [0, 0, 0]
}

fn drop_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| matches!(c, '\n' | '\t' | '\r') || !c.is_control())
        .collect()
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "")
}

/// Repeats until nothing matches: removing an inner artifact can join its
/// neighbours into a new one. Every pass shrinks the text, so this ends.
fn strip_artifacts(text: &str) -> String {
    let mut text = text.to_string();
    while ARTIFACT_RE.is_match(&text) {
        text = ARTIFACT_RE.replace_all(&text, "").into_owned();
    }
    text
}
