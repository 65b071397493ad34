//! The turn pipeline: an explicit state machine from raw user text to a
//! finalized structured response.
//!
//! Phases run strictly forward except for one bounded loop: a draft that
//! requests tools re-enters generation exactly once after the results are
//! appended. A second consecutive tool request is dropped and the turn
//! finalizes with what it has. Every path out of the driver carries a valid
//! `FinalResponse`; model and tool failures degrade, they never abort.

use super::classifier::{classify, Classification};
use super::finalizer::{finalize, FinalResponse, FinalizeInput};
use super::router::{route, Strategy};
use super::strategies::{execute, StrategyRun};
use crate::preprocess::{clean_text, is_crisis};
use crate::tools::{ToolCall, ToolContext};
use crate::transcript::{Transcript, TurnMessage};

const MAX_TOOL_PASSES: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Classify,
    Respond(Strategy),
    RunTools(Strategy),
    Finalize,
}

/// Everything a finished turn hands back to the orchestrator.
pub struct TurnOutcome {
    pub response: FinalResponse,
    pub strategy: Strategy,
    pub crisis: bool,
    pub classification: Classification,
    pub cleaned_text: String,
}

pub struct TurnInput<'a> {
    pub user_id: &'a str,
    pub user_name: &'a str,
    pub raw_text: &'a str,
    pub safety_score: i64,
}

fn tool_calls_from(message: &TurnMessage) -> Vec<ToolCall> {
    message
        .tool_calls
        .iter()
        .flatten()
        .map(|call| ToolCall {
            name: call.function.name.clone(),
            arguments: serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::json!({})),
        })
        .collect()
}

/// Drive one turn to completion. Appends the user message, any tool
/// exchanges, and the finalized assistant message to `transcript`.
pub async fn run_turn(
    run: &StrategyRun<'_>,
    transcript: &mut Transcript,
    input: TurnInput<'_>,
) -> TurnOutcome {
    let cleaned = clean_text(input.raw_text);

    // Nothing to say: answer gently without burning a model call.
    if cleaned.is_empty() {
        let mut response = FinalResponse::fallback(input.user_name);
        response.message = format!(
            "I'm here whenever you're ready, {}. What's on your mind?",
            input.user_name
        );
        return TurnOutcome {
            response,
            strategy: Strategy::Direct,
            crisis: false,
            classification: Classification::conservative_default(),
            cleaned_text: cleaned,
        };
    }

    let crisis = is_crisis(&cleaned);
    transcript.push(TurnMessage::user(cleaned.clone()));

    let mut classification = Classification::conservative_default();
    let mut strategy = Strategy::Standard;
    let mut tool_passes: u8 = 0;
    let mut tool_context_parts: Vec<String> = Vec::new();
    let mut phase = TurnPhase::Classify;

    loop {
        tracing::debug!("Turn phase: {:?}", phase);
        phase = match phase {
            TurnPhase::Classify => {
                classification =
                    classify(run.backend, &run.config.models.analysis, &cleaned).await;
                strategy = route(crisis, &classification);
                // The deterministic matcher has the last word, whatever the
                // model-side classification claimed.
                if crisis {
                    strategy = Strategy::Crisis;
                }
                tracing::info!(
                    "Routed to {} (crisis={}, intent={:?}, confidence={:.2})",
                    strategy.as_str(),
                    crisis,
                    classification.intent,
                    classification.confidence
                );
                TurnPhase::Respond(strategy)
            }

            TurnPhase::Respond(strategy) => {
                let draft =
                    execute(run, strategy, transcript, input.user_id, input.user_name).await;
                let wants_tools = draft.has_tool_calls();
                transcript.push(draft);

                if wants_tools && tool_passes < MAX_TOOL_PASSES {
                    TurnPhase::RunTools(strategy)
                } else {
                    if wants_tools {
                        tracing::warn!("Tool re-entry limit reached, finalizing with current data");
                    }
                    TurnPhase::Finalize
                }
            }

            TurnPhase::RunTools(strategy) => {
                tool_passes += 1;
                let ctx = super::strategies::tool_context_for(
                    strategy,
                    input.user_id,
                    input.user_name,
                )
                .unwrap_or_else(|| {
                    ToolContext::for_user(input.user_id, input.user_name).restricted_to(&[])
                });

                let requested = transcript
                    .messages()
                    .last()
                    .map(tool_calls_from)
                    .unwrap_or_default();
                let raw_calls: Vec<_> = transcript
                    .messages()
                    .last()
                    .and_then(|m| m.tool_calls.clone())
                    .unwrap_or_default();

                for (call, raw) in requested.iter().zip(raw_calls.iter()) {
                    let result = run.registry.execute_call(call, &ctx).await;
                    let payload = result.output.to_llm_string();
                    tool_context_parts.push(format!("{}: {}", result.name, payload));
                    transcript.push(TurnMessage::tool_result(
                        raw.id.clone(),
                        result.name.clone(),
                        payload,
                    ));
                }

                TurnPhase::Respond(strategy)
            }

            TurnPhase::Finalize => {
                let draft = transcript
                    .messages()
                    .last()
                    .filter(|m| !m.has_tool_calls())
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                let conversation = transcript.recent_excerpt(5);
                let tool_context = if tool_context_parts.is_empty() {
                    "(no tool data)".to_string()
                } else {
                    tool_context_parts.join("\n")
                };

                let model = if crisis {
                    &run.config.models.deep
                } else {
                    &run.config.models.standard
                };

                let response = finalize(
                    run.backend,
                    model,
                    FinalizeInput {
                        user_name: input.user_name,
                        conversation: &conversation,
                        draft: &draft,
                        tool_context: &tool_context,
                        crisis,
                        sentiment: classification.sentiment,
                        safety_score: input.safety_score,
                        max_tokens: run.config.max_tokens,
                    },
                )
                .await;

                let mut message = TurnMessage::assistant(response.message.clone());
                message.structured = serde_json::to_value(&response).ok();
                transcript.push(message);

                return TurnOutcome {
                    response,
                    strategy,
                    crisis,
                    classification,
                    cleaned_text: cleaned,
                };
            }
        };
    }
}
