//! Structured-output synthesis and the safety gate.
//!
//! The finalizer is the single authority over the outgoing `FinalResponse`.
//! Whatever happened earlier in the turn (including total model failure), the
//! response that leaves this module satisfies the crisis invariant: a crisis
//! turn always escalates, always carries a crisis-level alert, and always
//! names at least one emergency resource.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::classifier::Sentiment;
use crate::llm::{parse_json_lenient, ChatMessage, CompletionRequest, LanguageBackend};

/// Added to the session safety score on a crisis turn.
pub const CRISIS_SCORE_DELTA: i64 = 2;

const EMERGENCY_RESOURCES: &str = "\n\nPlease reach out for immediate help:\n\
    • Call 988 (Suicide & Crisis Lifeline) - available 24/7\n\
    • Text \"HELLO\" to 741741 (Crisis Text Line)\n\
    • Call 911 if you're in immediate danger";

const CRISIS_TRIGGER: &str = "crisis_pattern";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Moderate,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodAnalysis {
    pub mood: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Song,
    Doctor,
    BreathingExercise,
    EmergencyContact,
    MoodInsight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
    Immediate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationKind,
    pub title: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub urgency: Urgency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    None,
    Concern,
    Warning,
    Crisis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SafetyAlert {
    #[serde(default)]
    pub level: AlertLevel,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub immediate_action_required: bool,
}

/// The structured payload every turn returns, crisis or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResponse {
    pub message: String,
    #[serde(default)]
    pub mood: Option<MoodAnalysis>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    #[serde(default)]
    pub escalate: bool,
    #[serde(default)]
    pub safety_alert: SafetyAlert,
}

impl FinalResponse {
    pub fn fallback(user_name: &str) -> Self {
        Self {
            message: format!(
                "I'm here to help you, {}. How can I support you?",
                user_name
            ),
            mood: None,
            recommendations: Vec::new(),
            escalate: false,
            safety_alert: SafetyAlert::default(),
        }
    }
}

/// The canned reply streamed the moment the crisis matcher fires.
pub fn crisis_response(user_name: &str) -> String {
    format!(
        "I'm very concerned about you, {}. Your safety is my top priority right now.\n\
         \n\
         Please reach out for immediate help:\n\
         • Call 988 (Suicide & Crisis Lifeline) - available 24/7\n\
         • Text \"HELLO\" to 741741 (Crisis Text Line)\n\
         • Call 911 if you're in immediate danger\n\
         • Go to your nearest emergency room\n\
         \n\
         You don't have to face this alone. There are people who want to help you through this difficult time.",
        user_name
    )
}

fn mentions_emergency_resource(message: &str) -> bool {
    message.contains("988") || message.contains("911") || message.contains("741741")
}

/// Enforce the safety invariant on a parsed or fallback response.
/// Idempotent; called on every path out of the finalizer.
pub fn enforce_safety(response: &mut FinalResponse, crisis: bool, sentiment: Sentiment) {
    if crisis {
        response.escalate = true;
        response.safety_alert.level = AlertLevel::Crisis;
        response.safety_alert.immediate_action_required = true;
        if !response
            .safety_alert
            .triggers
            .iter()
            .any(|t| t == CRISIS_TRIGGER)
        {
            response.safety_alert.triggers.push(CRISIS_TRIGGER.to_string());
        }
        if !mentions_emergency_resource(&response.message) {
            response.message.push_str(EMERGENCY_RESOURCES);
        }
    } else if sentiment == Sentiment::Negative && response.safety_alert.level == AlertLevel::None {
        response.safety_alert.level = AlertLevel::Concern;
    }
}

fn synthesis_prompt(
    user_name: &str,
    conversation: &str,
    draft: &str,
    tool_context: &str,
    crisis: bool,
    safety_score: i64,
) -> String {
    let current_date = Utc::now().format("%Y-%m-%d");
    let crisis_rules = if crisis {
        "CRISIS RESPONSE REQUIREMENTS:\n\
         1. MANDATORY: Set escalate=true and safety_alert.level=\"crisis\"\n\
         2. Include crisis hotline numbers (988), emergency services (911), and the Crisis Text Line (741741)\n\
         3. Always include an emergency contact recommendation with urgency \"immediate\"\n\
         4. If doctor data is present, recommend actual doctors by name with urgency \"high\""
    } else {
        "Set escalate=false and safety_alert.level=\"none\" unless the conversation itself warrants concern."
    };

    format!(
        r#"User name: {user_name}
Current date: {current_date}
User safety score: {safety_score}/5

Recent conversation:
{conversation}

Draft reply (rework freely):
{draft}

TOOL DATA:
{tool_context}

{crisis_rules}

EXTRACTION RULES - never invent or generalize:
- Doctor data present: "type": "doctor", "title": "Dr. Sarah Johnson - Psychiatrist" (actual names)
- Song data present: "type": "song", "title": "Weightless by Marconi Union" (actual titles)
- Mood history present: "type": "mood_insight", "title" summarizing the actual pattern found
- Breathing exercises present: "type": "breathing_exercise", "title" with the actual technique name
- Emergency contacts: "type": "emergency_contact", "urgency": "immediate"
NEVER create placeholder recommendations. Only recommend what the tool data supports.

Respond with JSON only:
{{
    "message": "Your empathetic response here...",
    "mood": {{"mood": "...", "severity": "low|moderate|high|critical", "reason": "..."}},
    "recommendations": [
        {{"type": "song|doctor|breathing_exercise|emergency_contact|mood_insight", "title": "...", "reason": "...", "urgency": "low|medium|high|immediate"}}
    ],
    "escalate": false,
    "safety_alert": {{"level": "none|concern|warning|crisis", "triggers": [], "immediate_action_required": false}}
}}"#
    )
}

/// Everything the synthesis call needs from the turn so far.
pub struct FinalizeInput<'a> {
    pub user_name: &'a str,
    pub conversation: &'a str,
    pub draft: &'a str,
    pub tool_context: &'a str,
    pub crisis: bool,
    pub sentiment: Sentiment,
    pub safety_score: i64,
    pub max_tokens: u32,
}

/// Synthesize the structured response. Infallible: model or parse failures
/// degrade to the fallback message, and `enforce_safety` runs on every path.
pub async fn finalize(
    backend: &dyn LanguageBackend,
    model: &str,
    input: FinalizeInput<'_>,
) -> FinalResponse {
    let prompt = synthesis_prompt(
        input.user_name,
        input.conversation,
        input.draft,
        input.tool_context,
        input.crisis,
        input.safety_score,
    );
    let request = CompletionRequest::new(model, vec![ChatMessage::user(prompt)])
        .with_temperature(0.3)
        .with_max_tokens(input.max_tokens);

    let mut response = match backend.complete(request).await {
        Ok(reply) => {
            let content = reply.content.unwrap_or_default();
            match parse_json_lenient::<FinalResponse>(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::error!("Unparseable structured response: {}", e);
                    let mut fallback = FinalResponse::fallback(input.user_name);
                    if !input.draft.is_empty() {
                        fallback.message = input.draft.to_string();
                    }
                    fallback
                }
            }
        }
        Err(e) => {
            tracing::error!("Synthesis call failed: {}", e);
            let mut fallback = FinalResponse::fallback(input.user_name);
            if !input.draft.is_empty() {
                fallback.message = input.draft.to_string();
            }
            fallback
        }
    };

    enforce_safety(&mut response, input.crisis, input.sentiment);

    if response.safety_alert.level >= AlertLevel::Warning || response.escalate {
        tracing::warn!(
            "Safety alert for {}: level={:?} escalate={} triggers={:?}",
            input.user_name,
            response.safety_alert.level,
            response.escalate,
            response.safety_alert.triggers
        );
    }

    response
}

impl PartialOrd for AlertLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AlertLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(level: AlertLevel) -> u8 {
            match level {
                AlertLevel::None => 0,
                AlertLevel::Concern => 1,
                AlertLevel::Warning => 2,
                AlertLevel::Crisis => 3,
            }
        }
        rank(*self).cmp(&rank(*other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct ScriptedBackend {
        reply: Result<String, String>,
    }

    #[async_trait]
    impl LanguageBackend for ScriptedBackend {
        async fn complete(&self, _request: CompletionRequest) -> Result<ChatMessage> {
            match &self.reply {
                Ok(text) => Ok(ChatMessage::assistant(text.clone())),
                Err(e) => anyhow::bail!("{}", e),
            }
        }

        async fn complete_streaming(
            &self,
            request: CompletionRequest,
            _on_chunk: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        ) -> Result<ChatMessage> {
            self.complete(request).await
        }
    }

    fn input<'a>(crisis: bool, sentiment: Sentiment) -> FinalizeInput<'a> {
        FinalizeInput {
            user_name: "Ada",
            conversation: "user: I feel heavy today",
            draft: "",
            tool_context: "(no tool data)",
            crisis,
            sentiment,
            safety_score: 0,
            max_tokens: 2000,
        }
    }

    #[test]
    fn crisis_invariant_is_enforced_on_clean_output() {
        let mut response = FinalResponse {
            message: "Please hang in there.".to_string(),
            mood: None,
            recommendations: Vec::new(),
            escalate: false,
            safety_alert: SafetyAlert::default(),
        };
        enforce_safety(&mut response, true, Sentiment::Negative);
        assert!(response.escalate);
        assert_eq!(response.safety_alert.level, AlertLevel::Crisis);
        assert!(response.safety_alert.immediate_action_required);
        assert!(response
            .safety_alert
            .triggers
            .contains(&"crisis_pattern".to_string()));
        assert!(response.message.contains("988"));
    }

    #[test]
    fn enforcement_is_idempotent() {
        let mut response = FinalResponse::fallback("Ada");
        enforce_safety(&mut response, true, Sentiment::Negative);
        let first = response.clone();
        enforce_safety(&mut response, true, Sentiment::Negative);
        assert_eq!(response.message, first.message);
        assert_eq!(response.safety_alert.triggers.len(), 1);
    }

    #[test]
    fn message_already_naming_a_resource_is_left_alone() {
        let mut response = FinalResponse::fallback("Ada");
        response.message = "Please call 988 right now.".to_string();
        enforce_safety(&mut response, true, Sentiment::Neutral);
        assert_eq!(response.message, "Please call 988 right now.");
    }

    #[test]
    fn negative_sentiment_without_crisis_raises_concern() {
        let mut response = FinalResponse::fallback("Ada");
        enforce_safety(&mut response, false, Sentiment::Negative);
        assert_eq!(response.safety_alert.level, AlertLevel::Concern);
        assert!(!response.escalate);
    }

    #[test]
    fn existing_higher_alert_is_not_downgraded_to_concern() {
        let mut response = FinalResponse::fallback("Ada");
        response.safety_alert.level = AlertLevel::Warning;
        enforce_safety(&mut response, false, Sentiment::Negative);
        assert_eq!(response.safety_alert.level, AlertLevel::Warning);
    }

    #[tokio::test]
    async fn well_formed_output_parses_with_recommendations() {
        let backend = ScriptedBackend {
            reply: Ok(r#"{
                "message": "That pattern makes sense given your week.",
                "mood": {"mood": "sad", "severity": "moderate", "reason": "persistent low mood"},
                "recommendations": [
                    {"type": "song", "title": "Weightless by Marconi Union", "reason": "calming", "urgency": "low"}
                ],
                "escalate": false,
                "safety_alert": {"level": "none", "triggers": [], "immediate_action_required": false}
            }"#
            .to_string()),
        };
        let response = finalize(&backend, "m", input(false, Sentiment::Neutral)).await;
        assert_eq!(response.recommendations.len(), 1);
        assert_eq!(response.recommendations[0].kind, RecommendationKind::Song);
        assert_eq!(response.safety_alert.level, AlertLevel::None);
    }

    #[tokio::test]
    async fn backend_failure_on_crisis_turn_still_escalates() {
        let backend = ScriptedBackend {
            reply: Err("model gone".to_string()),
        };
        let response = finalize(&backend, "m", input(true, Sentiment::Negative)).await;
        assert!(response.escalate);
        assert_eq!(response.safety_alert.level, AlertLevel::Crisis);
        assert!(response.message.contains("988"));
    }

    #[tokio::test]
    async fn model_downplaying_a_crisis_is_overridden() {
        let backend = ScriptedBackend {
            reply: Ok(r#"{"message": "You will be fine.", "escalate": false,
                          "safety_alert": {"level": "none", "triggers": [], "immediate_action_required": false}}"#
                .to_string()),
        };
        let response = finalize(&backend, "m", input(true, Sentiment::Neutral)).await;
        assert!(response.escalate);
        assert_eq!(response.safety_alert.level, AlertLevel::Crisis);
        assert!(response.safety_alert.immediate_action_required);
        assert!(response.message.contains("988"));
    }

    #[tokio::test]
    async fn garbage_output_keeps_draft_text() {
        let backend = ScriptedBackend {
            reply: Ok("sorry, no JSON today".to_string()),
        };
        let mut i = input(false, Sentiment::Neutral);
        i.draft = "A draft worth keeping.";
        let response = finalize(&backend, "m", i).await;
        assert_eq!(response.message, "A draft worth keeping.");
    }

    #[test]
    fn canned_crisis_response_names_all_resources() {
        let text = crisis_response("Ada");
        assert!(text.contains("Ada"));
        assert!(text.contains("988"));
        assert!(text.contains("911"));
        assert!(text.contains("741741"));
    }
}
