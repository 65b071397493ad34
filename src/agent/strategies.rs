//! Per-strategy response generation: model tier, prompt framing, tool
//! binding, and the human-authored fallback when the model is unreachable.

use super::finalizer::crisis_response;
use super::router::Strategy;
use crate::config::{ModelTiers, ServiceConfig};
use crate::llm::{CompletionRequest, LanguageBackend};
use crate::tools::wellness::CRISIS_TOOL_NAMES;
use crate::tools::{ToolContext, ToolRegistry};
use crate::transcript::{Transcript, TurnMessage};

/// Draft replies containing this marker get one creative rewrite pass on the
/// deep tier before finalization.
pub const CREATIVE_MARKER: &str = "CREATIVE_MODE_NEEDED";

pub fn model_for<'a>(strategy: Strategy, tiers: &'a ModelTiers) -> &'a str {
    match strategy {
        Strategy::Direct => &tiers.light,
        Strategy::Standard | Strategy::Tool => &tiers.standard,
        Strategy::Complex | Strategy::Crisis => &tiers.deep,
    }
}

/// Tool policy per strategy. `None` means the strategy generates without
/// function-calling at all.
pub fn tool_context_for(strategy: Strategy, user_id: &str, user_name: &str) -> Option<ToolContext> {
    match strategy {
        Strategy::Tool | Strategy::Complex => Some(ToolContext::for_user(user_id, user_name)),
        Strategy::Crisis => {
            Some(ToolContext::for_user(user_id, user_name).restricted_to(CRISIS_TOOL_NAMES))
        }
        Strategy::Direct | Strategy::Standard => None,
    }
}

pub fn fallback_message(strategy: Strategy, user_name: &str) -> String {
    match strategy {
        Strategy::Crisis => crisis_response(user_name),
        Strategy::Direct => format!("Hello {}! I'm here for you. How are you feeling today?", user_name),
        _ => format!(
            "I hear you, {}. I'm having trouble putting together a full reply right now, \
             but I'm still here with you. Could you tell me a little more about what's going on?",
            user_name
        ),
    }
}

fn strategy_instruction(strategy: Strategy, user_name: &str) -> String {
    match strategy {
        Strategy::Direct => format!(
            "Respond to {} with a brief, warm acknowledgment. One or two sentences, no analysis.",
            user_name
        ),
        Strategy::Standard => format!(
            "Provide {} with thoughtful emotional support and gentle guidance. \
             Validate their experience before suggesting anything.",
            user_name
        ),
        Strategy::Tool => format!(
            "Help {} using the available tools for personalized data:\n\
             - Mood analysis, patterns or tracking: get_mood_history\n\
             - Music for their emotional state: get_recommended_songs\n\
             - Professional help: get_recommended_doctors\n\
             - Stress, anxiety or breathing help: get_breathing_exercise_data\n\
             Call the tools whose data would genuinely help, then respond using that data. \
             For creative requests (stories, scenarios), include \"CREATIVE_MODE_NEEDED\" in your response.",
            user_name
        ),
        Strategy::Complex => format!(
            "Give {} a comprehensive, carefully reasoned response. Consider their history in \
             this conversation, call tools where their data would help, and offer concrete next steps.",
            user_name
        ),
        Strategy::Crisis => format!(
            "CRISIS SITUATION - IMMEDIATE RESPONSE NEEDED\n\
             \n\
             User: {}\n\
             \n\
             Provide immediate crisis support:\n\
             1. Express concern and validation\n\
             2. Crisis resources (988, 911, text 741741)\n\
             3. Encourage professional help\n\
             4. Supportive but directive tone",
            user_name
        ),
    }
}

pub struct StrategyRun<'a> {
    pub backend: &'a dyn LanguageBackend,
    pub registry: &'a ToolRegistry,
    pub config: &'a ServiceConfig,
}

/// Generate the draft reply for one strategy. Never fails: transport errors
/// produce the strategy's fallback message instead of a tool-calling draft.
pub async fn execute(
    run: &StrategyRun<'_>,
    strategy: Strategy,
    transcript: &Transcript,
    user_id: &str,
    user_name: &str,
) -> TurnMessage {
    let system = format!(
        "{}\n\n{}",
        run.config.persona_prompt(),
        strategy_instruction(strategy, user_name)
    );
    let messages = transcript.to_wire(&system);

    let tools = match tool_context_for(strategy, user_id, user_name) {
        Some(ctx) => run.registry.tool_definitions_for_context(&ctx).await,
        None => Vec::new(),
    };

    let model = model_for(strategy, &run.config.models);
    let temperature = if strategy == Strategy::Crisis {
        0.3
    } else {
        run.config.temperature
    };
    let request = CompletionRequest::new(model, messages)
        .with_temperature(temperature)
        .with_max_tokens(run.config.max_tokens)
        .with_tools(tools);

    let reply = match run.backend.complete(request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!("{} strategy failed: {}", strategy.as_str(), e);
            return TurnMessage::assistant(fallback_message(strategy, user_name));
        }
    };

    if reply.has_tool_calls() {
        return TurnMessage::assistant_with_calls(
            reply.content,
            reply.tool_calls.unwrap_or_default(),
        );
    }

    let content = reply.content.unwrap_or_default();
    if content.to_lowercase().contains(&CREATIVE_MARKER.to_lowercase()) {
        return creative_pass(run, transcript, user_name, &content).await;
    }

    if content.trim().is_empty() {
        return TurnMessage::assistant(fallback_message(strategy, user_name));
    }

    TurnMessage::assistant(content)
}

/// One high-temperature rewrite on the deep tier for creative requests.
async fn creative_pass(
    run: &StrategyRun<'_>,
    transcript: &Transcript,
    user_name: &str,
    draft: &str,
) -> TurnMessage {
    let system = format!(
        "{}\n\nThe user asked for something creative (a story, scenario, or imaginative piece). \
         Write it fully and warmly for {}, weaving in the supportive intent of this draft:\n{}",
        run.config.persona_prompt(),
        user_name,
        draft.replace(CREATIVE_MARKER, "").trim()
    );
    let request = CompletionRequest::new(&run.config.models.deep, transcript.to_wire(&system))
        .with_temperature(0.9)
        .with_max_tokens(run.config.max_tokens);

    match run.backend.complete(request).await {
        Ok(reply) => {
            let content = reply.content.unwrap_or_default();
            if content.trim().is_empty() {
                TurnMessage::assistant(fallback_message(Strategy::Standard, user_name))
            } else {
                TurnMessage::assistant(content)
            }
        }
        Err(e) => {
            tracing::error!("Creative pass failed: {}", e);
            TurnMessage::assistant(fallback_message(Strategy::Standard, user_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, LlmFunctionCall, LlmToolCall};
    use crate::tools::wellness::default_registry;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays scripted replies and records every request it saw.
    struct RecordingBackend {
        replies: Mutex<Vec<Result<ChatMessage, String>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl RecordingBackend {
        fn new(replies: Vec<Result<ChatMessage, String>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LanguageBackend for RecordingBackend {
        async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage> {
            self.requests.lock().unwrap().push(request);
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                anyhow::bail!("script exhausted");
            }
            match replies.remove(0) {
                Ok(msg) => Ok(msg),
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

    fn transcript() -> Transcript {
        let mut t = Transcript::new();
        t.push(TurnMessage::user("I've been feeling low lately"));
        t
    }

    #[test]
    fn tier_map_matches_strategy_weight() {
        let tiers = ModelTiers::default();
        assert_eq!(model_for(Strategy::Direct, &tiers), tiers.light);
        assert_eq!(model_for(Strategy::Standard, &tiers), tiers.standard);
        assert_eq!(model_for(Strategy::Tool, &tiers), tiers.standard);
        assert_eq!(model_for(Strategy::Complex, &tiers), tiers.deep);
        assert_eq!(model_for(Strategy::Crisis, &tiers), tiers.deep);
    }

    #[test]
    fn crisis_binds_only_doctors_and_songs() {
        let ctx = tool_context_for(Strategy::Crisis, "u1", "Ada").unwrap();
        assert!(ctx.allows_tool("get_recommended_doctors"));
        assert!(ctx.allows_tool("get_recommended_songs"));
        assert!(!ctx.allows_tool("get_mood_history"));
        assert!(!ctx.allows_tool("get_breathing_exercise_data"));
    }

    #[test]
    fn direct_and_standard_bind_no_tools() {
        assert!(tool_context_for(Strategy::Direct, "u1", "Ada").is_none());
        assert!(tool_context_for(Strategy::Standard, "u1", "Ada").is_none());
    }

    #[tokio::test]
    async fn tool_strategy_sends_tool_definitions() {
        let backend = RecordingBackend::new(vec![Ok(ChatMessage::assistant("done"))]);
        let registry = default_registry().await;
        let config = ServiceConfig::default();
        let run = StrategyRun {
            backend: &backend,
            registry: &registry,
            config: &config,
        };

        execute(&run, Strategy::Tool, &transcript(), "u1", "Ada").await;

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tools.len(), 4);
        assert_eq!(requests[0].model, config.models.standard);
    }

    #[tokio::test]
    async fn standard_strategy_sends_no_tools() {
        let backend = RecordingBackend::new(vec![Ok(ChatMessage::assistant("you matter"))]);
        let registry = default_registry().await;
        let config = ServiceConfig::default();
        let run = StrategyRun {
            backend: &backend,
            registry: &registry,
            config: &config,
        };

        let message = execute(&run, Strategy::Standard, &transcript(), "u1", "Ada").await;
        assert_eq!(message.content, "you matter");
        assert!(backend.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn configured_identity_and_sampling_reach_the_request() {
        let backend = RecordingBackend::new(vec![Ok(ChatMessage::assistant("ok"))]);
        let registry = default_registry().await;
        let mut config = ServiceConfig::default();
        config.assistant_name = "Iris".to_string();
        config.max_tokens = 512;
        let run = StrategyRun {
            backend: &backend,
            registry: &registry,
            config: &config,
        };

        execute(&run, Strategy::Standard, &transcript(), "u1", "Ada").await;

        let requests = backend.requests();
        assert_eq!(requests[0].max_tokens, 512);
        let system = requests[0].messages[0].content.clone().unwrap();
        assert!(system.contains("Iris"));
        assert!(!system.contains("{assistant_name}"));
    }

    #[tokio::test]
    async fn backend_failure_yields_strategy_fallback() {
        let backend = RecordingBackend::new(vec![Err("unreachable".to_string())]);
        let registry = default_registry().await;
        let config = ServiceConfig::default();
        let run = StrategyRun {
            backend: &backend,
            registry: &registry,
            config: &config,
        };

        let message = execute(&run, Strategy::Crisis, &transcript(), "u1", "Ada").await;
        assert!(message.content.contains("988"));
        assert!(message.content.contains("Ada"));
    }

    #[tokio::test]
    async fn tool_calls_in_reply_are_preserved() {
        let reply = ChatMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![LlmToolCall {
                id: "call_1".to_string(),
                call_type: "function".to_string(),
                function: LlmFunctionCall {
                    name: "get_mood_history".to_string(),
                    arguments: "{\"days\": 7}".to_string(),
                },
            }]),
            tool_call_id: None,
        };
        let backend = RecordingBackend::new(vec![Ok(reply)]);
        let registry = default_registry().await;
        let config = ServiceConfig::default();
        let run = StrategyRun {
            backend: &backend,
            registry: &registry,
            config: &config,
        };

        let message = execute(&run, Strategy::Tool, &transcript(), "u1", "Ada").await;
        assert!(message.has_tool_calls());
    }

    #[tokio::test]
    async fn creative_marker_triggers_deep_rewrite() {
        let backend = RecordingBackend::new(vec![
            Ok(ChatMessage::assistant(
                "CREATIVE_MODE_NEEDED: a calming story about the sea",
            )),
            Ok(ChatMessage::assistant("Once, a quiet tide...")),
        ]);
        let registry = default_registry().await;
        let config = ServiceConfig::default();
        let run = StrategyRun {
            backend: &backend,
            registry: &registry,
            config: &config,
        };

        let message = execute(&run, Strategy::Tool, &transcript(), "u1", "Ada").await;
        assert_eq!(message.content, "Once, a quiet tide...");

        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].model, config.models.deep);
        assert!(requests[1].temperature > 0.8);
    }
}
