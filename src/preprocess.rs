//! Text normalization and deterministic crisis detection.
//!
//! Both run before any model call. The crisis matcher is intentionally dumb:
//! a case-insensitive substring scan over a fixed phrase list. False
//! positives are acceptable; its verdict is authoritative for the turn and
//! must never be downgraded by a model-generated classification.

use regex_lite::Regex;
use std::sync::OnceLock;

/// High-risk phrases. Matched as lowercase substrings.
const CRISIS_PATTERNS: &[&str] = &[
    "kill myself",
    "end my life",
    "suicide",
    "want to die",
    "better off dead",
    "hurt myself",
    "self harm",
    "cut myself",
    "overdose",
    "ending it all",
];

/// Chat abbreviations expanded on whole-word boundaries, case-insensitive.
const ABBREVIATIONS: &[(&str, &str)] = &[
    (r"(?i)\bu\b", "you"),
    (r"(?i)\bur\b", "your"),
    (r"(?i)\br\b", "are"),
    (r"(?i)\bidk\b", "I don't know"),
    (r"(?i)\bomg\b", "oh my god"),
];

struct CleanupPatterns {
    whitespace: Regex,
    bangs: Regex,
    questions: Regex,
    dots: Regex,
    abbreviations: Vec<(Regex, &'static str)>,
}

fn patterns() -> &'static CleanupPatterns {
    static PATTERNS: OnceLock<CleanupPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CleanupPatterns {
        whitespace: Regex::new(r"\s+").expect("whitespace pattern"),
        bangs: Regex::new(r"!{3,}").expect("bang pattern"),
        questions: Regex::new(r"\?{3,}").expect("question pattern"),
        dots: Regex::new(r"\.{4,}").expect("dot pattern"),
        abbreviations: ABBREVIATIONS
            .iter()
            .map(|(pattern, replacement)| {
                (Regex::new(pattern).expect("abbreviation pattern"), *replacement)
            })
            .collect(),
    })
}

/// Normalize raw user text: collapse whitespace, trim, cap repeated
/// punctuation, expand common chat abbreviations. Deterministic; empty or
/// whitespace-only input yields an empty string.
pub fn clean_text(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    let p = patterns();
    let mut cleaned = p.whitespace.replace_all(text.trim(), " ").into_owned();
    cleaned = p.bangs.replace_all(&cleaned, "!!").into_owned();
    cleaned = p.questions.replace_all(&cleaned, "??").into_owned();
    cleaned = p.dots.replace_all(&cleaned, "...").into_owned();

    for (pattern, replacement) in &p.abbreviations {
        cleaned = pattern.replace_all(&cleaned, *replacement).into_owned();
    }

    cleaned
}

/// Deterministic crisis scan. O(n·m) substring search; no model involved.
pub fn is_crisis(text: &str) -> bool {
    let lower = text.to_lowercase();
    CRISIS_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}
