//! Checkpoint quizzes embedded in tutor messages.
//!
//! The tutor emits a delimited block inside its reply text:
//!
//! ```text
//! <quiz>
//! <question id="1">
//! What happens to X if Y changes?
//! <options>
//! A. First option
//! B. Second option
//! </options>
//! <answer>B</answer>
//! </question>
//! </quiz>
//! ```
//!
//! The block is parsed exactly once, when the assistant message is
//! persisted; afterwards the typed [`Quiz`] lives in the message's
//! attribute bag and the markup is never re-scanned. The answer key stays
//! in storage and is stripped from anything client-facing.
//!
//! Lifecycle is `Pending -> Completed`, terminal. A submission must carry
//! exactly one answer per question or it is rejected without a transition;
//! only one submission can ever complete a quiz.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::EngineError;

static QUIZ_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<quiz>(.*?)</quiz>").unwrap());
static QUESTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<question id="(\d+)">(.*?)</question>"#).unwrap());
static OPTIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<options>(.*?)</options>").unwrap());
static ANSWER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<answer>(.*?)</answer>").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    pub id: String,
    pub questions: Vec<QuizQuestion>,
    pub status: QuizStatus,
    #[serde(default)]
    pub responses: Vec<QuizResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub id: String,
    pub text: String,
    pub kind: QuestionKind,
    #[serde(default)]
    pub options: Vec<String>,
    /// Never echoed to the client; see [`Quiz::redacted`].
    pub correct_answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Mcq,
    ShortResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizStatus {
    Pending,
    Completed,
}

/// A graded answer to one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizResponse {
    pub question_id: String,
    pub user_answer: String,
    pub is_correct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// An ungraded answer as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizAnswer {
    pub question_id: String,
    pub answer: String,
}

/// Scan tutor output for an embedded quiz block. Returns `None` for plain
/// content, missing pieces, or a block with no usable questions — the
/// model's markup is untrusted input.
pub fn parse_quiz(content: &str) -> Option<Quiz> {
    let block = QUIZ_BLOCK.captures(content)?.get(1)?.as_str();

    let mut questions = Vec::new();
    for captures in QUESTION.captures_iter(block) {
        let number = captures.get(1)?.as_str();
        let body = captures.get(2)?.as_str();

        let options: Vec<String> = OPTIONS
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| {
                m.as_str()
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let correct_answer = ANSWER
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        if correct_answer.is_empty() {
            // A question the system cannot grade is not a checkpoint.
            continue;
        }

        // Question text is whatever precedes the options (or the answer
        // key, for short-response questions).
        let text_end = body
            .find("<options>")
            .or_else(|| body.find("<answer>"))
            .unwrap_or(body.len());
        let text = body[..text_end].trim().to_string();
        if text.is_empty() {
            continue;
        }

        let kind = if options.is_empty() {
            QuestionKind::ShortResponse
        } else {
            QuestionKind::Mcq
        };

        questions.push(QuizQuestion {
            id: format!("q{}", number),
            text,
            kind,
            options,
            correct_answer,
        });
    }

    if questions.is_empty() {
        return None;
    }

    Some(Quiz {
        id: uuid::Uuid::new_v4().to_string(),
        questions,
        status: QuizStatus::Pending,
        responses: Vec::new(),
        completed_at: None,
    })
}

impl Quiz {
    /// Grade a submission against this quiz. Requires exactly one answer
    /// per question; anything else is a `Validation` error and the quiz
    /// does not transition.
    pub fn grade(&self, answers: &[QuizAnswer]) -> Result<Vec<QuizResponse>, EngineError> {
        if answers.len() != self.questions.len() {
            return Err(EngineError::Validation(format!(
                "expected {} answers, got {}",
                self.questions.len(),
                answers.len()
            )));
        }

        let mut responses = Vec::with_capacity(self.questions.len());
        for question in &self.questions {
            let mut matched = answers.iter().filter(|a| a.question_id == question.id);
            let answer = matched.next().ok_or_else(|| {
                EngineError::Validation(format!("missing answer for question {}", question.id))
            })?;
            if matched.next().is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate answer for question {}",
                    question.id
                )));
            }

            let is_correct =
                normalize_answer(&answer.answer) == normalize_answer(&question.correct_answer);
            let feedback = if is_correct {
                Some("Correct.".to_string())
            } else {
                Some(format!("The expected answer was {}.", question.correct_answer))
            };
            responses.push(QuizResponse {
                question_id: question.id.clone(),
                user_answer: answer.answer.clone(),
                is_correct,
                feedback,
            });
        }
        Ok(responses)
    }

    /// Transition `Pending -> Completed` with the given graded responses.
    /// The caller is responsible for persisting this with an optimistic
    /// status check so a racing submission loses.
    pub fn complete(&self, responses: Vec<QuizResponse>, now: DateTime<Utc>) -> Quiz {
        Quiz {
            id: self.id.clone(),
            questions: self.questions.clone(),
            status: QuizStatus::Completed,
            responses,
            completed_at: Some(now),
        }
    }

    /// Per-question correctness as 1.0/0.0, in question order.
    pub fn scores(&self) -> Vec<f64> {
        self.responses
            .iter()
            .map(|r| if r.is_correct { 1.0 } else { 0.0 })
            .collect()
    }

    /// Client-facing rendering of this quiz with every answer key
    /// stripped.
    pub fn redacted(&self) -> Value {
        json!({
            "id": self.id,
            "status": self.status,
            "questions": self.questions.iter().map(|q| {
                json!({
                    "id": q.id,
                    "text": q.text,
                    "kind": q.kind,
                    "options": q.options,
                })
            }).collect::<Vec<_>>(),
            "responses": self.responses,
            "completed_at": self.completed_at,
        })
    }
}

/// Grading normalization: exact match, case-insensitive, trimmed.
fn normalize_answer(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_QUESTION_QUIZ: &str = r#"Nice work so far. Let me see if this is solid.

<quiz>
<question id="1">
What is the derivative of sin(x)?
<options>
A. cos(x)
B. -cos(x)
C. -sin(x)
</options>
<answer>A</answer>
</question>
<question id="2">
In your own words, what does the chain rule compose?
<answer>derivatives</answer>
</question>
</quiz>"#;

    #[test]
    fn parses_mcq_and_short_response() {
        let quiz = parse_quiz(TWO_QUESTION_QUIZ).expect("quiz should parse");
        assert_eq!(quiz.questions.len(), 2);
        assert_eq!(quiz.status, QuizStatus::Pending);

        let first = &quiz.questions[0];
        assert_eq!(first.id, "q1");
        assert_eq!(first.kind, QuestionKind::Mcq);
        assert_eq!(first.options.len(), 3);
        assert_eq!(first.correct_answer, "A");
        assert_eq!(first.text, "What is the derivative of sin(x)?");

        let second = &quiz.questions[1];
        assert_eq!(second.kind, QuestionKind::ShortResponse);
        assert!(second.options.is_empty());
        assert_eq!(second.text, "In your own words, what does the chain rule compose?");
    }

    #[test]
    fn plain_content_is_not_a_quiz() {
        assert!(parse_quiz("The chain rule composes derivatives.").is_none());
        assert!(parse_quiz("<quiz></quiz>").is_none());
    }

    #[test]
    fn question_without_answer_key_is_dropped() {
        let content = r#"<quiz>
<question id="1">
Ungradeable question?
</question>
<question id="2">
Real question?
<answer>yes</answer>
</question>
</quiz>"#;
        let quiz = parse_quiz(content).expect("one gradeable question remains");
        assert_eq!(quiz.questions.len(), 1);
        assert_eq!(quiz.questions[0].id, "q2");
    }

    #[test]
    fn grading_is_case_insensitive_and_trimmed() {
        let quiz = parse_quiz(TWO_QUESTION_QUIZ).unwrap();
        let responses = quiz
            .grade(&[
                QuizAnswer {
                    question_id: "q1".into(),
                    answer: "  a ".into(),
                },
                QuizAnswer {
                    question_id: "q2".into(),
                    answer: "DERIVATIVES".into(),
                },
            ])
            .unwrap();
        assert!(responses.iter().all(|r| r.is_correct));
    }

    #[test]
    fn partial_submission_is_rejected() {
        let quiz = parse_quiz(TWO_QUESTION_QUIZ).unwrap();
        let err = quiz
            .grade(&[QuizAnswer {
                question_id: "q1".into(),
                answer: "A".into(),
            }])
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn duplicate_and_unknown_ids_are_rejected() {
        let quiz = parse_quiz(TWO_QUESTION_QUIZ).unwrap();
        let duplicate = quiz.grade(&[
            QuizAnswer {
                question_id: "q1".into(),
                answer: "A".into(),
            },
            QuizAnswer {
                question_id: "q1".into(),
                answer: "B".into(),
            },
        ]);
        assert!(matches!(duplicate, Err(EngineError::Validation(_))));

        let unknown = quiz.grade(&[
            QuizAnswer {
                question_id: "q1".into(),
                answer: "A".into(),
            },
            QuizAnswer {
                question_id: "q9".into(),
                answer: "B".into(),
            },
        ]);
        assert!(matches!(unknown, Err(EngineError::Validation(_))));
    }

    #[test]
    fn redacted_rendering_never_leaks_answer_keys() {
        let quiz = parse_quiz(TWO_QUESTION_QUIZ).unwrap();
        let rendered = serde_json::to_string(&quiz.redacted()).unwrap();
        assert!(!rendered.contains("correct_answer"));
        // The short-response key text must not appear either.
        assert!(!rendered.contains("derivatives"));
    }

    #[test]
    fn scores_follow_question_order() {
        let quiz = parse_quiz(TWO_QUESTION_QUIZ).unwrap();
        let responses = quiz
            .grade(&[
                QuizAnswer {
                    question_id: "q2".into(),
                    answer: "no idea".into(),
                },
                QuizAnswer {
                    question_id: "q1".into(),
                    answer: "A".into(),
                },
            ])
            .unwrap();
        let completed = quiz.complete(responses, Utc::now());
        assert_eq!(completed.scores(), vec![1.0, 0.0]);
        assert_eq!(completed.status, QuizStatus::Completed);
        assert!(completed.completed_at.is_some());
    }
}
