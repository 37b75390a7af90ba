//! Transcript analysis: one fast-tier completion turns the full session
//! transcript into a structured [`SessionAnalysis`].
//!
//! The model's output is untrusted. Parsing is strict: a response that is
//! not the expected JSON shape is a retryable failure, never silently
//! patched with defaults — a half-understood session must not reach the
//! profile merge.

use serde::{Deserialize, Serialize};

use crate::providers::ProviderError;
use crate::quiz::QuizStatus;
use crate::traits::{LearnerProfile, Message, Mood, Role};

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are the learning-analysis stage of a tutoring system. You read one finished tutoring session and report what the learner worked on and how it went.

Respond with ONLY a JSON object in this shape:
{
  "synopsis": "2-4 sentence summary of the session",
  "mood": "engaged" | "frustrated" | "confused" | "confident" | "neutral",
  "topics": [
    {"name": "short topic name", "comprehension": 1-5 or null, "evidence": "why you assigned that level, or null"}
  ],
  "assessments": [
    {"topic": "...", "question": "...", "user_answer": "...", "is_correct": true/false, "confidence": 0.0-1.0}
  ],
  "observations": ["one-sentence learning-style observation", ...],
  "open_questions": ["question the learner should pick up next time", ...],
  "next_topic": "topic to resume with, or null",
  "flags": {"frustration": bool, "struggle": bool, "breakthrough": bool, "practice_requested": bool}
}

Rules:
- List only topics that were genuinely discussed. A session of greetings and small talk has an empty topics list.
- Set "comprehension" only when the transcript directly evidences it (the learner demonstrated, explained, or was graded). Otherwise null.
- "assessments" are moments where the tutor asked a direct knowledge check in prose and evaluated the answer as right or wrong. Do NOT include the formatted checkpoint quizzes (the system already recorded those), and do NOT include rhetorical or Socratic questions that were never evaluated.
- Observations are about how this learner learns (pacing, preferred explanation style). Skip anything already listed under "Known observations".
- Every flag defaults to false. Set one only on clear, repeated evidence in the learner's own words; when unsure, leave it false."#;

/// Structured result of the analysis completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAnalysis {
    pub synopsis: String,
    #[serde(default)]
    pub mood: Mood,
    #[serde(default)]
    pub topics: Vec<TopicAnalysis>,
    #[serde(default)]
    pub assessments: Vec<AssessmentMoment>,
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub next_topic: Option<String>,
    #[serde(default)]
    pub flags: BoundaryFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicAnalysis {
    pub name: String,
    #[serde(default)]
    pub comprehension: Option<u8>,
    #[serde(default)]
    pub evidence: Option<String>,
}

/// A prose knowledge check the tutor evaluated right/wrong. Formatted
/// checkpoint quizzes are excluded — those are materialized at submission
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentMoment {
    pub topic: String,
    pub question: String,
    pub user_answer: String,
    pub is_correct: bool,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Conservative, false-biased session signals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BoundaryFlags {
    #[serde(default)]
    pub frustration: bool,
    #[serde(default)]
    pub struggle: bool,
    #[serde(default)]
    pub breakthrough: bool,
    #[serde(default)]
    pub practice_requested: bool,
}

/// Build the user-side content for the analysis call: profile context the
/// model needs for dedup, then the clean transcript.
pub fn build_analysis_input(profile: &LearnerProfile, transcript: &[Message]) -> String {
    let mut input = String::with_capacity(4096);

    if profile.topics.is_empty() {
        input.push_str("Known topics: (none yet)\n");
    } else {
        input.push_str("Known topics (reuse these names when the session revisits one):\n");
        for topic in &profile.topics {
            input.push_str(&format!("- {}\n", topic.topic));
        }
    }

    if profile.observations.is_empty() {
        input.push_str("Known observations: (none yet)\n");
    } else {
        input.push_str("Known observations:\n");
        for observation in &profile.observations {
            input.push_str(&format!("- {}\n", observation));
        }
    }

    input.push_str("\nTranscript:\n");
    input.push_str(&clean_transcript(transcript));
    input
}

/// Render the transcript for analysis. Quiz blocks are replaced with their
/// graded outcome so the model sees results without re-reading markup.
pub fn clean_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let label = match message.role {
            Role::User => "Learner",
            Role::Assistant => "Tutor",
            Role::System => continue,
        };

        if let Some(quiz) = message.quiz() {
            let visible = strip_quiz_block(&message.content);
            if !visible.is_empty() {
                out.push_str(&format!("{}: {}\n", label, visible));
            }
            match quiz.status {
                QuizStatus::Completed => {
                    let correct = quiz.responses.iter().filter(|r| r.is_correct).count();
                    out.push_str(&format!(
                        "[Checkpoint quiz: {}/{} correct]\n",
                        correct,
                        quiz.questions.len()
                    ));
                }
                QuizStatus::Pending => {
                    out.push_str(&format!(
                        "[Checkpoint quiz: {} questions, never answered]\n",
                        quiz.questions.len()
                    ));
                }
            }
            continue;
        }

        out.push_str(&format!("{}: {}\n", label, message.content));
    }
    out
}

fn strip_quiz_block(content: &str) -> String {
    match (content.find("<quiz>"), content.rfind("</quiz>")) {
        (Some(start), Some(end)) if end >= start => {
            let mut text = String::new();
            text.push_str(content[..start].trim_end());
            text.push_str(content[end + "</quiz>".len()..].trim_start());
            text.trim().to_string()
        }
        _ => content.trim().to_string(),
    }
}

/// Strict parse of the model's analysis output. Tolerates prose around the
/// JSON object (models narrate) but nothing inside it.
pub fn parse_analysis(text: &str) -> Result<SessionAnalysis, ProviderError> {
    let trimmed = text.trim();
    let start = trimmed
        .find('{')
        .ok_or_else(|| ProviderError::malformed("analysis output contains no JSON object"))?;
    let end = trimmed
        .rfind('}')
        .ok_or_else(|| ProviderError::malformed("analysis output contains no JSON object"))?;
    if end < start {
        return Err(ProviderError::malformed("analysis output contains no JSON object"));
    }

    let analysis: SessionAnalysis = serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| ProviderError::malformed(format!("analysis JSON did not parse: {}", e)))?;

    if analysis.synopsis.trim().is_empty() {
        return Err(ProviderError::malformed("analysis synopsis is empty"));
    }
    for topic in &analysis.topics {
        if topic.name.trim().is_empty() {
            return Err(ProviderError::malformed("analysis topic with empty name"));
        }
        if let Some(level) = topic.comprehension {
            if !(1..=5).contains(&level) {
                return Err(ProviderError::malformed(format!(
                    "comprehension {} out of 1-5 range",
                    level
                )));
            }
        }
    }
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{Value, json};

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "c1".to_string(),
            seq: 0,
            role,
            content: content.to_string(),
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn parse_accepts_surrounding_prose() {
        let text = r#"Here is the analysis you asked for:
{"synopsis": "Worked through the chain rule.", "mood": "engaged", "topics": [{"name": "chain rule", "comprehension": 3}]}
Let me know if you need more."#;
        let analysis = parse_analysis(text).unwrap();
        assert_eq!(analysis.topics.len(), 1);
        assert_eq!(analysis.mood, Mood::Engaged);
    }

    #[test]
    fn parse_rejects_missing_synopsis() {
        assert!(parse_analysis(r#"{"topics": []}"#).is_err());
        assert!(parse_analysis(r#"{"synopsis": "   "}"#).is_err());
    }

    #[test]
    fn parse_rejects_out_of_range_comprehension() {
        let text = r#"{"synopsis": "ok", "topics": [{"name": "t", "comprehension": 9}]}"#;
        assert!(parse_analysis(text).is_err());
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(parse_analysis("I could not analyze this session.").is_err());
    }

    #[test]
    fn flags_default_to_false() {
        let analysis = parse_analysis(r#"{"synopsis": "ok"}"#).unwrap();
        assert!(!analysis.flags.frustration);
        assert!(!analysis.flags.struggle);
        assert!(!analysis.flags.breakthrough);
        assert!(!analysis.flags.practice_requested);
        assert_eq!(analysis.mood, Mood::Neutral);
    }

    #[test]
    fn clean_transcript_replaces_quiz_markup_with_outcome() {
        let quiz_content = "Good progress. <quiz>\n<question id=\"1\">\nQ?\n<answer>A</answer>\n</question>\n</quiz>";
        let mut quiz_message = message(Role::Assistant, quiz_content);
        let mut quiz = crate::quiz::parse_quiz(quiz_content).unwrap();
        quiz.status = QuizStatus::Completed;
        quiz.responses = vec![crate::quiz::QuizResponse {
            question_id: "q1".into(),
            user_answer: "A".into(),
            is_correct: true,
            feedback: None,
        }];
        quiz_message.metadata = json!({ "quiz": quiz });

        let rendered = clean_transcript(&[message(Role::User, "hi"), quiz_message]);
        assert!(rendered.contains("Learner: hi"));
        assert!(rendered.contains("[Checkpoint quiz: 1/1 correct]"));
        assert!(!rendered.contains("<quiz>"));
        assert!(!rendered.contains("<answer>"));
    }
}
