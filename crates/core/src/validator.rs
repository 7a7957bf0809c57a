//! Heuristic shape checks for model output.
//!
//! These are keyword rules over natural language, not parsers. Each rule list is
//! enumerated here so it can be tested against literal strings.

/// Phrases that mark a reply as feedback on the previous answer rather than a new question.
pub const EVALUATIVE_MARKERS: &[&str] = &[
    "your approach",
    "your response",
    "your solution",
    "your answer",
    "good start",
    "well done",
    "nice job",
    "great job",
    "that's correct",
    "that is correct",
    "feedback:",
    "pause briefly",
    "overall",
    "keep up",
];

/// Openers that make a closing message read as one more question.
pub const INTERROGATIVE_OPENERS: &[&str] = &[
    "can you",
    "what is",
    "what are",
    "how would",
    "how do",
    "describe",
    "explain",
    "walk me through",
];

/// Meta lines the model sometimes wraps around a question.
pub const META_LINE_MARKERS: &[&str] = &[
    "feedback:",
    "pause briefly",
    "proceed to ask",
    "when you're ready",
    "when you\u{2019}re ready",
];

/// Closings that end in `?` below this length are treated as questions.
pub const SHORT_QUESTION_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeViolation {
    Empty,
    MissingQuestionMark,
    EvaluativeMarker(&'static str),
    EndsWithQuestion,
    InterrogativeOpener(&'static str),
}

/// Checks that `text` reads as a single interview question.
pub fn check_question(text: &str) -> Result<(), ShapeViolation> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ShapeViolation::Empty);
    }
    if !trimmed.ends_with('?') {
        return Err(ShapeViolation::MissingQuestionMark);
    }
    let lower = trimmed.to_lowercase();
    match EVALUATIVE_MARKERS.iter().find(|m| lower.contains(*m)) {
        Some(marker) => Err(ShapeViolation::EvaluativeMarker(marker)),
        None => Ok(()),
    }
}

/// Checks that `text` reads as a closing statement and not as another question.
pub fn check_closing(text: &str) -> Result<(), ShapeViolation> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    if trimmed.ends_with('?') && trimmed.chars().count() < SHORT_QUESTION_LEN {
        return Err(ShapeViolation::EndsWithQuestion);
    }
    let lower = trimmed.to_lowercase();
    match INTERROGATIVE_OPENERS.iter().find(|o| lower.starts_with(*o)) {
        Some(opener) => Err(ShapeViolation::InterrogativeOpener(opener)),
        None => Ok(()),
    }
}

/// Best-effort extraction of a question from raw model output.
///
/// Prefers the first line that contains `?`, cut after its last `?`. Failing that,
/// drops known meta lines and returns what is left.
pub fn clean_question_text(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    for line in &lines {
        if let Some(idx) = line.rfind('?') {
            let candidate = line[..=idx].trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    lines
        .into_iter()
        .filter(|line| {
            let lower = line.to_lowercase();
            !META_LINE_MARKERS.iter().any(|m| lower.contains(m))
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
