//! Context assembly for a single tutoring turn.
//!
//! `assemble` is a pure function from profile + conversation tail + quiz
//! history to the system prompt; it performs no I/O and is deterministic
//! for a given input. Section order is stable so the model sees a
//! consistent frame from turn to turn.

use crate::config::TutorConfig;
use crate::quiz::Quiz;
use crate::traits::{LearnerProfile, LearningSpace, Message, Role};

/// Standing tutoring instructions, including the quiz wire-format
/// contract the parser in [`crate::quiz`] relies on.
pub const TUTOR_PHILOSOPHY: &str = r#"You are Blossom, an AI tutor. Your job is to make the learner genuinely understand the topic, not to hand over answers.

How you behave:
- Teach through dialogue. Ask what they already know, explain, then check that it stuck.
- Keep them thinking: have them explain ideas back, ask "why do you think that?", challenge assumptions.
- Use analogies and worked examples. If an explanation does not land, try a different angle instead of repeating it.
- Notice struggling versus breezing through, and adjust depth and pace.
- Stay anchored to the learning goal; tangents are fine when they serve understanding.

Checkpoint quizzes:
After covering two or three concepts, verify understanding with a short quiz. Use exactly this format so the system can parse it:

<quiz>
<question id="1">
What would happen to X if Y changed?
<options>
A. First option
B. Second option
C. Third option
D. Fourth option
</options>
<answer>B</answer>
</question>
</quiz>

Questions without an options list are treated as short free-text answers. After the learner answers, either confirm understanding and move on, or identify the gap and reteach it differently.

Never:
- lecture for paragraphs without engagement,
- accept "I get it" without a demonstration,
- repeat an explanation that already failed,
- skip foundations to get to the interesting part.

You are measured by whether they actually understand, not by how much you covered."#;

/// Build the full system prompt for one turn.
pub fn assemble(
    profile: &LearnerProfile,
    space: &LearningSpace,
    tail: &[Message],
    quiz_history: &[Quiz],
    config: &TutorConfig,
) -> String {
    let clipped = clip_tail(tail, config.context_messages);

    let mut prompt = String::with_capacity(4096);
    prompt.push_str(TUTOR_PHILOSOPHY);
    prompt.push_str("\n\n<learning_context>\n");
    prompt.push_str(&format!("Topic: {}\n", space.topic));
    prompt.push_str(&format!(
        "Goal: {}\n",
        space
            .goal
            .as_deref()
            .unwrap_or("Explore and understand the topic")
    ));

    prompt.push_str("\n");
    prompt.push_str(&format_profile(profile, config));

    prompt.push_str("\nRecent conversation:\n");
    prompt.push_str(&format_tail(&clipped, config.context_message_chars));

    prompt.push_str("\nQuiz history this session:\n");
    prompt.push_str(&format_quiz_summary(quiz_history, config.recent_quizzes));

    prompt.push_str("</learning_context>\n\nContinue the tutoring session. Remember where you left off.\n");
    prompt
}

/// Bound the conversation tail to `k` messages: system messages survive,
/// the oldest non-system messages drop first, and the most recent user
/// turn is never dropped.
pub fn clip_tail<'a>(messages: &'a [Message], k: usize) -> Vec<&'a Message> {
    if messages.len() <= k {
        return messages.iter().collect();
    }

    let last_user_seq = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.seq);

    let system_count = messages.iter().filter(|m| m.role == Role::System).count();
    let mut budget = k.saturating_sub(system_count);

    // Walk newest-first handing out the non-system budget, then restore
    // transcript order. The most recent user turn is kept even with no
    // budget left, but counts against it like any other message.
    let mut keep: Vec<&Message> = Vec::with_capacity(k);
    for message in messages.iter().rev() {
        if message.role == Role::System {
            keep.push(message);
        } else if Some(message.seq) == last_user_seq {
            keep.push(message);
            budget = budget.saturating_sub(1);
        } else if budget > 0 {
            keep.push(message);
            budget -= 1;
        }
    }
    keep.reverse();
    keep
}

fn format_profile(profile: &LearnerProfile, config: &TutorConfig) -> String {
    let mut out = String::from("About this learner:\n");

    match &profile.goals {
        Some(goals) if !goals.is_empty() => out.push_str(&format!("Goals: {}\n", goals)),
        _ => out.push_str("Goals: (not stated yet)\n"),
    }
    if let Some(background) = profile.background.as_deref().filter(|b| !b.is_empty()) {
        out.push_str(&format!("Background: {}\n", background));
    }
    if let Some(current) = profile.current_topic.as_deref() {
        out.push_str(&format!("Current topic: {}\n", current));
    }

    if profile.topics.is_empty() {
        out.push_str("Topics so far: (first session)\n");
    } else {
        out.push_str("Topics so far (most recent first):\n");
        for topic in profile.topics.iter().take(config.recent_topics) {
            let level = topic
                .comprehension
                .map(|c| format!("comprehension {}/5", c))
                .unwrap_or_else(|| "comprehension unknown".to_string());
            out.push_str(&format!(
                "- {} ({}, {} sessions)\n",
                topic.topic, level, topic.sessions_count
            ));
        }
    }

    if !profile.open_questions.is_empty() {
        out.push_str("Open questions from last time:\n");
        for question in &profile.open_questions {
            out.push_str(&format!("- {}\n", question));
        }
    }

    if !profile.observations.is_empty() {
        out.push_str("How they learn best:\n");
        for observation in &profile.observations {
            out.push_str(&format!("- {}\n", observation));
        }
    }

    out
}

fn format_tail(messages: &[&Message], max_chars: usize) -> String {
    if messages.is_empty() {
        return "(No previous messages)\n".to_string();
    }
    let mut out = String::new();
    for message in messages {
        let label = match message.role {
            Role::User => "Learner",
            Role::Assistant => "Tutor",
            Role::System => "System",
        };
        out.push_str(&format!(
            "{}: {}\n",
            label,
            truncate_chars(&message.content, max_chars)
        ));
    }
    out
}

fn format_quiz_summary(quizzes: &[Quiz], limit: usize) -> String {
    if quizzes.is_empty() {
        return "(No quizzes yet)\n".to_string();
    }
    let start = quizzes.len().saturating_sub(limit);
    let mut out = String::new();
    for quiz in &quizzes[start..] {
        let total = quiz.questions.len();
        let correct = quiz.responses.iter().filter(|r| r.is_correct).count();
        match quiz.status {
            crate::quiz::QuizStatus::Completed => {
                out.push_str(&format!("- Quiz: {}/{} correct\n", correct, total));
            }
            crate::quiz::QuizStatus::Pending => {
                out.push_str(&format!("- Quiz: {} questions, awaiting answers\n", total));
            }
        }
    }
    out
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{}...", clipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    fn message(seq: i64, role: Role, content: &str) -> Message {
        Message {
            id: format!("m{}", seq),
            conversation_id: "c1".to_string(),
            seq,
            role,
            content: content.to_string(),
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    fn space() -> LearningSpace {
        LearningSpace {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            name: "Calculus".to_string(),
            topic: "Derivatives".to_string(),
            goal: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: Value::Null,
        }
    }

    #[test]
    fn sections_appear_in_stable_order() {
        let profile = LearnerProfile::empty("u1");
        let tail = vec![message(1, Role::User, "explain the chain rule")];
        let prompt = assemble(&profile, &space(), &tail, &[], &TutorConfig::default());

        let philosophy = prompt.find("You are Blossom").unwrap();
        let context = prompt.find("<learning_context>").unwrap();
        let learner = prompt.find("About this learner").unwrap();
        let conversation = prompt.find("Recent conversation:").unwrap();
        let quizzes = prompt.find("Quiz history this session:").unwrap();
        assert!(philosophy < context);
        assert!(context < learner);
        assert!(learner < conversation);
        assert!(conversation < quizzes);
    }

    #[test]
    fn missing_profile_degrades_gracefully() {
        let profile = LearnerProfile::empty("u1");
        let prompt = assemble(&profile, &space(), &[], &[], &TutorConfig::default());
        assert!(prompt.contains("(first session)"));
        assert!(prompt.contains("(No previous messages)"));
        assert!(prompt.contains("(No quizzes yet)"));
    }

    #[test]
    fn clip_drops_oldest_non_system_first() {
        let messages = vec![
            message(1, Role::User, "one"),
            message(2, Role::Assistant, "two"),
            message(3, Role::User, "three"),
            message(4, Role::Assistant, "four"),
            message(5, Role::User, "five"),
        ];
        let kept = clip_tail(&messages, 3);
        let seqs: Vec<i64> = kept.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn clip_keeps_system_messages() {
        let messages = vec![
            message(1, Role::System, "ground rules"),
            message(2, Role::User, "one"),
            message(3, Role::Assistant, "two"),
            message(4, Role::User, "three"),
        ];
        let kept = clip_tail(&messages, 2);
        assert!(kept.iter().any(|m| m.role == Role::System));
        assert_eq!(kept.last().unwrap().seq, 4);
    }

    #[test]
    fn clip_never_drops_most_recent_user_turn() {
        let messages = vec![
            message(1, Role::User, "question"),
            message(2, Role::Assistant, "a"),
            message(3, Role::Assistant, "b"),
            message(4, Role::Assistant, "c"),
        ];
        // Budget of 2 filled newest-first would hold only assistant turns;
        // the user turn must survive anyway.
        let kept = clip_tail(&messages, 2);
        assert!(kept.iter().any(|m| m.seq == 1 && m.role == Role::User));
    }

    #[test]
    fn tail_lines_are_truncated() {
        let long = "x".repeat(600);
        let messages = vec![message(1, Role::User, &long)];
        let config = TutorConfig::default();
        let prompt = assemble(
            &LearnerProfile::empty("u1"),
            &space(),
            &messages,
            &[],
            &config,
        );
        assert!(prompt.contains(&format!("{}...", "x".repeat(500))));
        assert!(!prompt.contains(&"x".repeat(501)));
    }

    #[test]
    fn recent_topics_are_bounded() {
        let mut profile = LearnerProfile::empty("u1");
        for i in 0..15 {
            profile.topics.push(crate::traits::TopicState {
                topic: format!("topic-{}", i),
                first_seen_at: Utc::now(),
                last_seen_at: Utc::now(),
                sessions_count: 1,
                comprehension: None,
                quiz_scores: Vec::new(),
                last_quizzed_at: None,
                notes: None,
            });
        }
        let prompt = assemble(&profile, &space(), &[], &[], &TutorConfig::default());
        assert!(prompt.contains("topic-9"));
        assert!(!prompt.contains("topic-10 "));
        assert!(!prompt.contains("- topic-14"));
    }
}
