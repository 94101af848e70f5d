//! Pattern-based reading of tool output.
//!
//! Tool output is free text, so failure detection is a heuristic: a fixed
//! table of transient patterns (worth retrying the same attempt) and a fixed
//! table of failure signatures (the task did not do what it claims). Transient
//! patterns are checked first.

use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Clean,
    Transient {
        pattern: &'static str,
        snippet: String,
    },
    Failure {
        signature: &'static str,
        snippet: String,
    },
}

impl Classification {
    pub fn is_clean(&self) -> bool {
        matches!(self, Classification::Clean)
    }
}

fn table(entries: &[(&'static str, &str)]) -> Vec<(&'static str, Regex)> {
    entries
        .iter()
        .map(|(label, re)| (*label, Regex::new(re).expect("failure pattern")))
        .collect()
}

static TRANSIENT_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    table(&[
        ("rate limit", r"(?i)\brate[ -]?limit(ed)?\b|too many requests|\bHTTP[/ ]\S*\s*429\b|\bstatus:? 429\b"),
        ("timeout", r"(?i)\btimed out\b|\btimeout\b|\bETIMEDOUT\b|deadline exceeded"),
        ("connection reset", r"(?i)connection (reset|refused|aborted)|\bECONNRESET\b|\bECONNREFUSED\b|broken pipe|temporary failure in name resolution"),
        ("server error", r"(?i)\b(HTTP[/ ]\S*\s*|status:? )50[0234]\b|service unavailable|bad gateway|gateway timeout"),
    ])
});

static FAILURE_SIGNATURES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    table(&[
        ("test failure", r"(?m)^\s*(FAIL|FAILED)\b|test result: FAILED|\b[1-9]\d* (failed|failing)\b|AssertionError"),
        ("compiler error", r"(?m)^error(\[E\d+\])?:|\berror TS\d+:|\bSyntaxError:|\bTypeError:|cannot find symbol|could not compile"),
        ("nonzero exit", r"\bexit code [1-9]\d*\b|\bexited with (code|status) [1-9]\d*\b"),
        ("error", r"(?m)^\s*(Error|ERROR|FATAL)\b|\bpanicked at\b|Traceback \(most recent call last\)"),
    ])
});

/// Classifies one attempt's tool-output transcript.
pub fn classify(transcript: &str, window: usize) -> Classification {
    for (label, re) in TRANSIENT_PATTERNS.iter() {
        if let Some(m) = re.find(transcript) {
            return Classification::Transient {
                pattern: label,
                snippet: snippet(transcript, m.start(), m.end(), window),
            };
        }
    }
    for (label, re) in FAILURE_SIGNATURES.iter() {
        if let Some(m) = re.find(transcript) {
            return Classification::Failure {
                signature: label,
                snippet: snippet(transcript, m.start(), m.end(), window),
            };
        }
    }
    Classification::Clean
}

/// About `window` characters of context centred on `start..end`, cut on
/// char boundaries, with `…` where text was dropped.
pub fn snippet(text: &str, start: usize, end: usize, window: usize) -> String {
    let half = window / 2;
    let mut from = start.saturating_sub(half);
    while from > 0 && !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = end.saturating_add(half).min(text.len());
    while to < text.len() && !text.is_char_boundary(to) {
        to += 1;
    }

    let mut out = String::new();
    if from > 0 {
        out.push('…');
    }
    out.push_str(text[from..to].trim());
    if to < text.len() {
        out.push('…');
    }
    out
}

/// Caps `text` at `max` characters for display.
pub fn cap(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
