//! Guesses whether a program is blocked on a read.
//!
//! Nothing in the sandbox tells us a read is pending, so this is a
//! probabilistic classifier over the trailing output. A line that merely
//! ends in `:` is reported as a prompt (false positive) and a prompt with no
//! punctuation, glyph or keyword is missed (false negative). Both are
//! expected behavior.

use once_cell::sync::Lazy;
use regex::Regex;

/// Characters that conventionally end a shell or REPL prompt.
pub const PROMPT_GLYPHS: &[char] = &['>', '$', '\u{bb}'];

/// Output below this many characters counts as "short".
pub const SHORT_OUTPUT_CHARS: usize = 200;

/// Output with at most this many lines counts as "short".
pub const SHORT_OUTPUT_LINES: usize = 3;

/// Prompts longer than this get trimmed to their trailing clause.
pub const LONG_PROMPT_CHARS: usize = 80;

static KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:enter|input|name|password|passphrase|continue|select|choose|type|press|answer|guess|confirm)\b|[\(\[]y/n[\)\]]",
    )
    .expect("keyword pattern is valid")
});

static TRAILING_CLAUSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^.!?:]+[?:])\s*$").expect("clause pattern is valid"));

/// Classification of the output seen so far.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputWait {
    pub waiting_for_input: bool,
    pub input_prompt: Option<String>,
}

impl InputWait {
    fn not_waiting() -> Self {
        Self::default()
    }
}

/// Classify accumulated, sanitized output. Only the last non-empty line is
/// inspected, except for the short-output corroboration of keyword hits.
pub fn detect(output: &str) -> InputWait {
    let Some(line) = last_non_empty_line(output) else {
        return InputWait::not_waiting();
    };
    let tail = line.trim_end();

    let punctuated = tail.ends_with('?') || tail.ends_with(':');
    let glyph = tail.ends_with(PROMPT_GLYPHS);
    let keyword = KEYWORD_RE.is_match(tail) && is_short_output(output);

    if punctuated || glyph || keyword {
        InputWait {
            waiting_for_input: true,
            input_prompt: Some(extract_prompt(line)),
        }
    } else {
        InputWait::not_waiting()
    }
}

/// Human-readable prompt for a line. Long lines are cut down to the trailing
/// clause ending in `?` or `:` when one exists.
pub fn extract_prompt(line: &str) -> String {
    let line = line.trim();
    if line.chars().count() > LONG_PROMPT_CHARS {
        if let Some(clause) = TRAILING_CLAUSE_RE.captures(line).and_then(|c| c.get(1)) {
            return clause.as_str().trim().to_string();
        }
    }
    line.to_string()
}

fn last_non_empty_line(output: &str) -> Option<&str> {
    output.lines().rev().find(|line| !line.trim().is_empty())
}

fn is_short_output(output: &str) -> bool {
    output.chars().count() < SHORT_OUTPUT_CHARS
        && output.lines().count() <= SHORT_OUTPUT_LINES
        && !output.ends_with("\n\n")
}
