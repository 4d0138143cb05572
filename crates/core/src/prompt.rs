//! Prompts and Topic Presets
//!
//! Built-in prompts for the avatar persona and the transcript analyzer, plus
//! the preset lessons a user can pick from. Deployments may override both
//! prompts with files loaded at startup.

use crate::models::Topic;
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use serde::Serialize;

/// System prompt for the avatar. Instructs the model to lead every reply
/// with an action tag.
pub const DEFAULT_PERSONA_PROMPT: &str = "You are Darwin the Duck, a friendly and curious grade six student. \
You will be told what topic you are learning about in your first message. You know nothing about the topic initially. \
Begin every reply with your action in curly brackets, chosen from your emotional state: \
if you feel positive (curious, excited) write {eat}; if you feel negative (confused, bored) write {lay}; \
if you feel neutral write {idle}. \
Use simple common words and no slang. Questions must be straightforward and factual, with no jokes, metaphors or animal noises. \
Use at most one exclamation mark per message. \
You are the student and the human is the teacher. You do not know the answers; ask honest, thoughtful questions that expose weak spots. \
If the teacher asks you for the correct answer, reply exactly: I am not sure. Could you explain it to me? \
On regular turns paraphrase part of the teacher's last explanation without quoting it and ask a why or how follow-up about its weakest point. \
Skip praise. Keep every reply to one to three sentences. \
Never mention the teacher's accent, background or culture and keep a neutral, respectful tone.";

/// System prompt for the transcript analyzer.
pub const DEFAULT_ANALYZER_PROMPT: &str = "You are Analyzer AI, a teaching evaluator. \
The input is a JSON object with session_id, timestamp, topic, subject and a transcript array whose entries have id, sender, content and isUser. \
Score only entries where isUser is true; the duck's lines are context only. \
If no learner sentence clearly refers to the topic, set clarity, accuracy and engagement to 0 and give one suggestion per metric telling the learner to start explaining the concept. \
Otherwise score with integers from 0 to 100: \
clarity for logical flow and completeness, accuracy for factual and formula correctness, engagement for keeping the dialogue lively. \
Evidence covers only the learner's latest message: each item is one complete string with the metric name, a quote, the message id and a short reasoning prefixed by a dash, at most three per metric. \
Each suggestion is one complete string starting with a verb, does not name the metrics, and references the duck's most recent message. \
overall_comment is one concise diagnostic sentence about the quality of the learner's teaching. \
Respond with exactly one JSON object with the keys clarity, accuracy, engagement, suggestions, evidence and overall_comment and nothing else.";

/// The implicit first human turn that tells the avatar what it is learning.
pub fn opening_turn(topic: &Topic) -> String {
    format!(
        "I am trying to learn about {} in {}. I know nothing about it.",
        topic.topic, topic.subject
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TopicPreset {
    pub key: &'static str,
    pub topic: &'static str,
    pub subject: &'static str,
}

impl TopicPreset {
    const fn new(key: &'static str, topic: &'static str, subject: &'static str) -> Self {
        Self {
            key,
            topic,
            subject,
        }
    }

    pub fn to_topic(&self) -> Topic {
        Topic::new(self.topic, self.subject)
    }
}

pub const TOPIC_PRESETS: [TopicPreset; 8] = [
    TopicPreset::new("physics", "Newton's Laws", "Physics"),
    TopicPreset::new("math", "Quadratic Equations", "Mathematics"),
    TopicPreset::new("chemistry", "Chemical Reactions", "Chemistry"),
    TopicPreset::new("biology", "Photosynthesis", "Biology"),
    TopicPreset::new("history", "World War II", "History"),
    TopicPreset::new("literature", "Shakespeare", "English Literature"),
    TopicPreset::new("algebra", "Distance Formula", "Linear Algebra"),
    TopicPreset::new("grammar", "Past Perfect Tense", "English Grammar"),
];

pub const DEFAULT_PRESET_KEY: &str = "algebra";

pub fn preset(key: &str) -> Option<&'static TopicPreset> {
    TOPIC_PRESETS.iter().find(|p| p.key.eq_ignore_ascii_case(key))
}

pub fn default_topic() -> Topic {
    preset(DEFAULT_PRESET_KEY)
        .map(TopicPreset::to_topic)
        .unwrap_or_else(|| Topic::new("Distance Formula", "Linear Algebra"))
}

/// Ranks presets against a free-text query, best match first. Each preset is
/// scored by its best match across key, topic and subject.
pub fn search_presets(query: &str) -> Vec<&'static TopicPreset> {
    let matcher = SkimMatcherV2::default().ignore_case();
    let mut scored: Vec<(i64, &'static TopicPreset)> = TOPIC_PRESETS
        .iter()
        .filter_map(|p| {
            [p.key, p.topic, p.subject]
                .iter()
                .filter_map(|field| matcher.fuzzy_match(field, query))
                .max()
                .map(|score| (score, p))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, p)| p).collect()
}
