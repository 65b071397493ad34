//! Per-turn intent and risk classification on the analysis tier.
//!
//! One cheap model call producing a fixed-shape JSON verdict. Any failure
//! (network, refusal, malformed output) falls back to the conservative
//! default so the pipeline keeps moving.

use serde::{Deserialize, Serialize};

use crate::llm::{parse_json_lenient, ChatMessage, CompletionRequest, LanguageBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    Crisis,
    Question,
    Support,
    OffTopic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub complexity: Complexity,
    pub needs_tools: bool,
    pub direct_answer: bool,
    pub sentiment: Sentiment,
    pub confidence: f32,
}

impl Classification {
    /// What a turn assumes when classification fails: supportive handling,
    /// moderate depth, no tools, middling confidence.
    pub fn conservative_default() -> Self {
        Self {
            intent: Intent::Support,
            complexity: Complexity::Moderate,
            needs_tools: false,
            direct_answer: false,
            sentiment: Sentiment::Neutral,
            confidence: 0.5,
        }
    }
}

/// Raw model verdict before normalization. The model answers yes/no fields
/// as strings.
#[derive(Debug, Deserialize)]
struct RawClassification {
    intent: String,
    complexity: String,
    needs_tools: String,
    direct_answer: String,
    sentiment: String,
    confidence: f32,
}

fn yes(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("yes")
}

impl From<RawClassification> for Classification {
    fn from(raw: RawClassification) -> Self {
        let intent = match raw.intent.trim().to_ascii_lowercase().as_str() {
            "greeting" => Intent::Greeting,
            "crisis" => Intent::Crisis,
            "question" => Intent::Question,
            "off_topic" => Intent::OffTopic,
            _ => Intent::Support,
        };
        let complexity = match raw.complexity.trim().to_ascii_lowercase().as_str() {
            "simple" => Complexity::Simple,
            "complex" => Complexity::Complex,
            _ => Complexity::Moderate,
        };
        let sentiment = match raw.sentiment.trim().to_ascii_lowercase().as_str() {
            "positive" => Sentiment::Positive,
            "negative" => Sentiment::Negative,
            _ => Sentiment::Neutral,
        };
        Classification {
            intent,
            complexity,
            needs_tools: yes(&raw.needs_tools),
            direct_answer: yes(&raw.direct_answer),
            sentiment,
            confidence: raw.confidence.clamp(0.0, 1.0),
        }
    }
}

fn analysis_prompt(text: &str) -> String {
    format!(
        r#"Analyze this message from a mental health support conversation and respond with JSON only:

Message: "{}"

{{
    "intent": "greeting|crisis|question|support|off_topic",
    "complexity": "simple|moderate|complex",
    "needs_tools": "yes|no",
    "direct_answer": "yes|no",
    "sentiment": "positive|neutral|negative",
    "confidence": 0.8
}}"#,
        text
    )
}

/// Classify one cleaned user message. Never fails; falls back to the
/// conservative default on any error.
pub async fn classify(
    backend: &dyn LanguageBackend,
    model: &str,
    text: &str,
) -> Classification {
    let request = CompletionRequest::new(model, vec![ChatMessage::user(analysis_prompt(text))])
        .with_temperature(0.1);

    let reply = match backend.complete(request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!("Classification call failed: {}", e);
            return Classification::conservative_default();
        }
    };

    let content = reply.content.unwrap_or_default();
    match parse_json_lenient::<RawClassification>(&content) {
        Ok(raw) => raw.into(),
        Err(e) => {
            tracing::error!(
                "Unparseable classification (input: {:.80}): {}",
                text,
                e
            );
            Classification::conservative_default()
        }
    }
}
