//! Delta computation: pure functions from (analysis, profile snapshot,
//! session metadata) to the field-scoped changes the apply step writes.
//!
//! Nothing here touches storage, which is what makes the merge testable:
//! two sessions over disjoint topic sets produce deltas that commute.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::analysis::SessionAnalysis;
use crate::events::{
    BoundarySignalData, ComprehensionUpdatedData, EventType, LearningEvent, QuizAttemptedData,
    TopicIntroducedData, TopicRevisitedData,
};
use crate::traits::{LearnerProfile, QuizAttempt, SessionDigest};

/// Metadata about the ended session, captured when the job claims it.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub conversation_id: String,
    pub space_id: String,
    pub user_id: String,
    pub ended_at: DateTime<Utc>,
    pub duration_minutes: i64,
}

/// Per-topic change, keyed by normalized topic name.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicDelta {
    pub key: String,
    pub is_new: bool,
    /// Newly evidenced level, already validated to 1-5.
    pub comprehension: Option<u8>,
    pub prior_comprehension: Option<u8>,
    /// Present when the evidenced level is below the prior one; a
    /// regression always carries its explanation.
    pub regression_note: Option<String>,
    /// Checkpoint-quiz scores to append, per question in order.
    pub quiz_scores: Vec<f64>,
}

/// Everything one extraction wants to change about the profile, plus the
/// events that describe the change. Applied atomically or not at all.
#[derive(Debug, Clone)]
pub struct ProfileDelta {
    pub digest: SessionDigest,
    pub topics: Vec<TopicDelta>,
    /// Observations not already on the profile.
    pub observations: Vec<String>,
    pub open_questions: Vec<String>,
    pub current_topic: Option<String>,
    pub attempts: Vec<QuizAttempt>,
    pub events: Vec<LearningEvent>,
}

/// Canonical topic key: trimmed, lowercased, inner whitespace collapsed.
/// "Chain Rule" and "chain  rule" are the same topic.
pub fn normalize_topic_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Compute the profile delta for one analyzed session.
///
/// `session_quiz_scores` are the per-question correctness scores of the
/// session's completed checkpoint quizzes, in transcript order; they are
/// attributed to the session's primary topic (the first one the analysis
/// lists).
pub fn compute_delta(
    analysis: &SessionAnalysis,
    profile: &LearnerProfile,
    meta: &SessionMeta,
    session_quiz_scores: &[f64],
) -> ProfileDelta {
    let mut topics: Vec<TopicDelta> = Vec::new();
    let mut events: Vec<LearningEvent> = Vec::new();

    for (index, topic) in analysis.topics.iter().enumerate() {
        let key = normalize_topic_key(&topic.name);
        if key.is_empty() || topics.iter().any(|t| t.key == key) {
            continue;
        }

        let existing = profile.topic(&key);
        let is_new = existing.is_none();
        let prior_comprehension = existing.and_then(|t| t.comprehension);

        let regression_note = match (topic.comprehension, prior_comprehension) {
            (Some(new), Some(old)) if new < old => Some(format!(
                "{}: comprehension revised from {} to {} — {}",
                meta.ended_at.format("%Y-%m-%d"),
                old,
                new,
                topic
                    .evidence
                    .as_deref()
                    .unwrap_or("no specific evidence recorded")
            )),
            _ => None,
        };

        let quiz_scores = if index == 0 {
            session_quiz_scores.to_vec()
        } else {
            Vec::new()
        };

        let event = if is_new {
            new_event(
                meta,
                EventType::TopicIntroduced,
                json!(TopicIntroducedData { topic: key.clone() }),
            )
        } else {
            new_event(
                meta,
                EventType::TopicRevisited,
                json!(TopicRevisitedData {
                    topic: key.clone(),
                    prior_comprehension,
                }),
            )
        };
        events.push(event);

        if let Some(new_level) = topic.comprehension {
            if prior_comprehension != Some(new_level) {
                events.push(new_event(
                    meta,
                    EventType::ComprehensionUpdated,
                    json!(ComprehensionUpdatedData {
                        topic: key.clone(),
                        old_level: prior_comprehension,
                        new_level,
                    }),
                ));
            }
        }

        topics.push(TopicDelta {
            key,
            is_new,
            comprehension: topic.comprehension,
            prior_comprehension,
            regression_note,
            quiz_scores,
        });
    }

    let primary_topic = topics.first().map(|t| t.key.clone());

    // Observations already represented on the profile are skipped; the
    // list only ever grows by genuinely new entries.
    let known: Vec<String> = profile
        .observations
        .iter()
        .map(|o| o.trim().to_lowercase())
        .collect();
    let observations: Vec<String> = analysis
        .observations
        .iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty() && !known.contains(&o.to_lowercase()))
        .collect();

    let attempts: Vec<QuizAttempt> = analysis
        .assessments
        .iter()
        .map(|moment| QuizAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: meta.user_id.clone(),
            space_id: Some(meta.space_id.clone()),
            conversation_id: Some(meta.conversation_id.clone()),
            message_id: None,
            topic: normalize_topic_key(&moment.topic),
            question: moment.question.clone(),
            user_answer: moment.user_answer.clone(),
            is_correct: moment.is_correct,
            attempt_number: 1,
            confidence: moment.confidence,
            created_at: Utc::now(),
        })
        .collect();

    for moment in &analysis.assessments {
        events.push(new_event(
            meta,
            EventType::QuizAttempted,
            json!(QuizAttemptedData {
                topic: normalize_topic_key(&moment.topic),
                correct: moment.is_correct as i64,
                attempts: 1,
            }),
        ));
    }

    for (flag, event_type) in [
        (analysis.flags.frustration, EventType::FrustrationDetected),
        (analysis.flags.struggle, EventType::StruggleDetected),
        (analysis.flags.breakthrough, EventType::BreakthroughMoment),
        (analysis.flags.practice_requested, EventType::PracticeRequested),
    ] {
        if flag {
            events.push(new_event(
                meta,
                event_type,
                json!(BoundarySignalData {
                    topic: primary_topic.clone(),
                    details: analysis.synopsis.clone(),
                    mood: analysis.mood,
                }),
            ));
        }
    }

    let current_topic = analysis
        .next_topic
        .as_deref()
        .map(normalize_topic_key)
        .filter(|t| !t.is_empty())
        .or_else(|| primary_topic.clone());

    let digest = SessionDigest {
        conversation_id: meta.conversation_id.clone(),
        occurred_at: meta.ended_at,
        duration_minutes: meta.duration_minutes,
        synopsis: analysis.synopsis.trim().to_string(),
        topics: topics.iter().map(|t| t.key.clone()).collect(),
        mood: analysis.mood,
    };

    ProfileDelta {
        digest,
        topics,
        observations,
        open_questions: analysis
            .open_questions
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect(),
        current_topic,
        attempts,
        events,
    }
}

fn new_event(meta: &SessionMeta, event_type: EventType, data: serde_json::Value) -> LearningEvent {
    LearningEvent::new(meta.user_id.clone(), event_type, data)
        .in_space(meta.space_id.clone())
        .in_conversation(meta.conversation_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::analysis::{BoundaryFlags, TopicAnalysis};
    use crate::traits::{Mood, TopicState};
    use proptest::prelude::*;

    fn meta() -> SessionMeta {
        SessionMeta {
            conversation_id: "c1".to_string(),
            space_id: "s1".to_string(),
            user_id: "u1".to_string(),
            ended_at: Utc::now(),
            duration_minutes: 12,
        }
    }

    fn analysis_with_topics(topics: Vec<TopicAnalysis>) -> SessionAnalysis {
        SessionAnalysis {
            synopsis: "Worked through some material.".to_string(),
            mood: Mood::Neutral,
            topics,
            assessments: Vec::new(),
            observations: Vec::new(),
            open_questions: Vec::new(),
            next_topic: None,
            flags: BoundaryFlags::default(),
        }
    }

    fn topic_state(key: &str, comprehension: Option<u8>) -> TopicState {
        TopicState {
            topic: key.to_string(),
            first_seen_at: Utc::now(),
            last_seen_at: Utc::now(),
            sessions_count: 1,
            comprehension,
            quiz_scores: Vec::new(),
            last_quizzed_at: None,
            notes: None,
        }
    }

    #[test]
    fn topic_keys_normalize() {
        assert_eq!(normalize_topic_key("  Chain   Rule "), "chain rule");
        assert_eq!(normalize_topic_key("chain rule"), "chain rule");
        assert_eq!(normalize_topic_key("CHAIN\tRULE"), "chain rule");
    }

    #[test]
    fn near_identical_topic_matches_existing_key() {
        let mut profile = LearnerProfile::empty("u1");
        profile.topics.push(topic_state("chain rule", Some(2)));

        let analysis = analysis_with_topics(vec![TopicAnalysis {
            name: "Chain  Rule".to_string(),
            comprehension: Some(3),
            evidence: None,
        }]);
        let delta = compute_delta(&analysis, &profile, &meta(), &[]);

        assert_eq!(delta.topics.len(), 1);
        assert!(!delta.topics[0].is_new);
        assert_eq!(delta.topics[0].prior_comprehension, Some(2));
    }

    #[test]
    fn new_topic_is_flagged_and_introduced() {
        let profile = LearnerProfile::empty("u1");
        let analysis = analysis_with_topics(vec![TopicAnalysis {
            name: "chain rule".to_string(),
            comprehension: None,
            evidence: None,
        }]);
        let delta = compute_delta(&analysis, &profile, &meta(), &[1.0, 0.0]);

        assert!(delta.topics[0].is_new);
        assert_eq!(delta.topics[0].quiz_scores, vec![1.0, 0.0]);
        assert!(
            delta
                .events
                .iter()
                .any(|e| e.event_type == EventType::TopicIntroduced)
        );
    }

    #[test]
    fn quiz_scores_attach_to_primary_topic_only() {
        let profile = LearnerProfile::empty("u1");
        let analysis = analysis_with_topics(vec![
            TopicAnalysis {
                name: "chain rule".to_string(),
                comprehension: None,
                evidence: None,
            },
            TopicAnalysis {
                name: "product rule".to_string(),
                comprehension: None,
                evidence: None,
            },
        ]);
        let delta = compute_delta(&analysis, &profile, &meta(), &[1.0]);
        assert_eq!(delta.topics[0].quiz_scores, vec![1.0]);
        assert!(delta.topics[1].quiz_scores.is_empty());
    }

    #[test]
    fn regression_carries_a_note() {
        let mut profile = LearnerProfile::empty("u1");
        profile.topics.push(topic_state("limits", Some(4)));

        let analysis = analysis_with_topics(vec![TopicAnalysis {
            name: "limits".to_string(),
            comprehension: Some(2),
            evidence: Some("struggled to set up epsilon-delta".to_string()),
        }]);
        let delta = compute_delta(&analysis, &profile, &meta(), &[]);

        let note = delta.topics[0].regression_note.as_deref().unwrap();
        assert!(note.contains("4"));
        assert!(note.contains("2"));
        assert!(note.contains("epsilon-delta"));
    }

    #[test]
    fn improvement_needs_no_note() {
        let mut profile = LearnerProfile::empty("u1");
        profile.topics.push(topic_state("limits", Some(2)));

        let analysis = analysis_with_topics(vec![TopicAnalysis {
            name: "limits".to_string(),
            comprehension: Some(4),
            evidence: None,
        }]);
        let delta = compute_delta(&analysis, &profile, &meta(), &[]);
        assert!(delta.topics[0].regression_note.is_none());
    }

    #[test]
    fn known_observations_are_skipped() {
        let mut profile = LearnerProfile::empty("u1");
        profile
            .observations
            .push("Prefers worked examples".to_string());

        let mut analysis = analysis_with_topics(Vec::new());
        analysis.observations = vec![
            "prefers worked examples".to_string(),
            "Asks for analogies early".to_string(),
        ];
        let delta = compute_delta(&analysis, &profile, &meta(), &[]);
        assert_eq!(delta.observations, vec!["Asks for analogies early"]);
    }

    #[test]
    fn empty_session_produces_empty_delta() {
        let profile = LearnerProfile::empty("u1");
        let analysis = analysis_with_topics(Vec::new());
        let delta = compute_delta(&analysis, &profile, &meta(), &[]);

        assert!(delta.topics.is_empty());
        assert!(delta.attempts.is_empty());
        assert!(delta.digest.topics.is_empty());
        // No boundary flags, no topic events.
        assert!(delta.events.is_empty());
    }

    #[test]
    fn boundary_flags_become_events() {
        let profile = LearnerProfile::empty("u1");
        let mut analysis = analysis_with_topics(Vec::new());
        analysis.flags.frustration = true;
        analysis.mood = Mood::Frustrated;
        let delta = compute_delta(&analysis, &profile, &meta(), &[]);
        assert_eq!(delta.events.len(), 1);
        assert_eq!(delta.events[0].event_type, EventType::FrustrationDetected);
    }

    proptest! {
        /// Merging disjoint topic sets is commutative: the union of the
        /// per-topic deltas does not depend on which session is computed
        /// first, because each delta only reads its own keys.
        #[test]
        fn disjoint_topic_deltas_commute(
            names_a in proptest::collection::vec("[a-m]{3,8}", 1..4),
            names_b in proptest::collection::vec("[n-z]{3,8}", 1..4),
        ) {
            let profile = LearnerProfile::empty("u1");
            let to_topics = |names: &Vec<String>| {
                names.iter().map(|n| TopicAnalysis {
                    name: n.clone(),
                    comprehension: None,
                    evidence: None,
                }).collect::<Vec<_>>()
            };

            let delta_a = compute_delta(&analysis_with_topics(to_topics(&names_a)), &profile, &meta(), &[]);
            let delta_b = compute_delta(&analysis_with_topics(to_topics(&names_b)), &profile, &meta(), &[]);

            let mut ab: Vec<TopicDelta> = delta_a.topics.iter().chain(delta_b.topics.iter()).cloned().collect();
            let mut ba: Vec<TopicDelta> = delta_b.topics.iter().chain(delta_a.topics.iter()).cloned().collect();
            ab.sort_by(|x, y| x.key.cmp(&y.key));
            ba.sort_by(|x, y| x.key.cmp(&y.key));
            prop_assert_eq!(ab, ba);
        }
    }
}
