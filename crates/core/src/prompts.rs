//! Prompt builders. Each prompt has exactly one output contract.

use crate::llm::ChatMessage;
use crate::model::{InterviewMessage, MessageType, SessionConfig};

/// How many trailing transcript messages are replayed as history.
pub const HISTORY_WINDOW: usize = 10;

fn header(role_line: &str, config: &SessionConfig) -> String {
    format!(
        "{role_line}\nPosition: {}\nLevel: {}\nTotal questions: {}.\n",
        config.position, config.level, config.total_questions
    )
}

pub fn intro(config: &SessionConfig) -> Vec<ChatMessage> {
    let prompt = format!(
        "{}Briefly introduce yourself and the interview format. \
         Do NOT ask any questions yet. Keep it concise and welcoming.",
        header(
            "You are an AI interviewer. Conduct a structured mock interview.",
            config
        )
    );
    vec![ChatMessage::system(prompt)]
}

pub fn first_question(config: &SessionConfig) -> Vec<ChatMessage> {
    let prompt = format!(
        "{}Now ask the first interview question. \
         Only ask the question, no introduction or other text. \
         Keep the question concise and relevant to the position and level.",
        header("You are an AI interviewer conducting a mock interview.", config)
    );
    vec![ChatMessage::system(prompt)]
}

/// Feedback on one answer. The exact question and answer are passed in rather than
/// rebuilt from history.
pub fn feedback(
    config: &SessionConfig,
    question_number: i64,
    question: &str,
    answer: &str,
) -> Vec<ChatMessage> {
    let system = format!(
        "{}Current question number: {question_number}.\n\
         Provide brief, encouraging feedback ONLY on the candidate's answer below. \
         Be specific to what they said. Do NOT ask the next question. \
         Keep feedback concise and constructive (2-3 sentences max).",
        header("You are conducting a mock interview.", config)
    );
    let turn = format!(
        "Interview question: {question}\n\n\
         Candidate's answer: {answer}\n\n\
         Please provide brief feedback on this specific answer."
    );
    vec![ChatMessage::system(system), ChatMessage::user(turn)]
}

/// Next question, with recent questions and answers as history. Intro, system and
/// feedback messages are left out so the model does not drift into giving feedback.
pub fn next_question(
    config: &SessionConfig,
    question_number: i64,
    transcript: &[InterviewMessage],
) -> Vec<ChatMessage> {
    let system = format!(
        "{}Next question number: {question_number}.\n\
         Now ask the next interview question. \
         Output ONLY the question text ending with '?'. \
         No feedback, no commentary, no numbering. Just the question.",
        header("You are conducting a mock interview.", config)
    );

    let start = transcript.len().saturating_sub(HISTORY_WINDOW);
    let history = transcript[start..]
        .iter()
        .filter(|m| {
            !matches!(
                m.message_type,
                MessageType::Intro | MessageType::System | MessageType::Feedback
            )
        })
        .map(|m| ChatMessage {
            role: m.role.into(),
            content: m.content.clone(),
        });

    std::iter::once(ChatMessage::system(system))
        .chain(history)
        .collect()
}

/// Single-purpose retry used when a generated question fails the shape check.
pub fn strict_question(config: &SessionConfig, question_number: i64) -> Vec<ChatMessage> {
    let prompt = format!(
        "{}Next question number: {question_number}.\n\
         Output ONLY the next interview question as a single sentence that ends with '?'. \
         Do NOT include feedback, introductions, markdown formatting, quotes, or meta instructions. \
         Just the question text itself.",
        header("You are an AI interviewer conducting a mock interview.", config)
    );
    vec![ChatMessage::system(prompt)]
}

/// Closing statement. No history, so the model has nothing to ask a follow-up about.
pub fn closing(config: &SessionConfig) -> Vec<ChatMessage> {
    let system = format!(
        "You are an AI interview coach wrapping up a mock interview.\n\
         Position: {}\nLevel: {}\n\
         The candidate has completed all {} questions.\n\
         Your task: Write a brief, professional CLOSING message.\n\
         DO NOT ask any questions. DO NOT provide feedback on answers.\n\
         Simply thank the candidate, confirm the interview is complete, \
         and mention their results will be processed soon.\n\
         Keep it to 2-3 sentences max.",
        config.position, config.level, config.total_questions
    );
    vec![
        ChatMessage::system(system),
        ChatMessage::user(
            "The interview is now complete. Please provide a closing message \
             thanking me and confirming the session has ended.",
        ),
    ]
}

pub fn strict_closing() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "Output a brief closing message for a completed interview. \
             DO NOT ask any questions. Just say thank you and goodbye.",
        ),
        ChatMessage::user("Please close the interview session."),
    ]
}

/// One question/answer pair from a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

pub fn evaluation(config: &SessionConfig, pairs: &[QaPair]) -> Vec<ChatMessage> {
    let system = format!(
        "You are an expert interview evaluator. Assess the candidate's mock interview objectively.\n\n\
         Interview Details:\n\
         - Position: {}\n\
         - Level: {}\n\
         - Interview Type: {}\n\n\
         Your response MUST be a valid JSON object with exactly these fields:\n\
         - \"score\": an integer from 0 to 100 (0=poor, 100=excellent)\n\
         - \"feedback\": a 2-4 paragraph evaluation that assesses overall performance, \
         names strengths and areas for improvement, and ends with specific recommendations\n\n\
         Be constructive and specific. Reference actual answers when possible.",
        config.position, config.level, config.interview_type
    );

    let transcript = pairs
        .iter()
        .enumerate()
        .map(|(i, pair)| format!("Question {}: {}\nAnswer: {}", i + 1, pair.question, pair.answer))
        .collect::<Vec<_>>()
        .join("\n\n");

    let user = format!(
        "Please evaluate this interview:\n\n{transcript}\n\n\
         Respond with a JSON object containing 'score' and 'feedback'."
    );

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}
