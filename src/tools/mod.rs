//! Capability tools the assistant can invoke while composing a reply.
//!
//! Each tool declares a JSON Schema for its parameters, enabling LLM
//! function-calling. Tools are registered in a thread-safe ToolRegistry that
//! generates OpenAI-format function definitions for the model. Tool failures
//! never abort a turn: the model sees an empty result set instead.

pub mod wellness;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The result of executing a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolOutput {
    /// Successful structured output
    Json(serde_json::Value),
    /// Tool execution failed
    Error(String),
}

impl ToolOutput {
    /// String form fed back to the model. Failures degrade to an empty
    /// result set so the turn can continue without the data.
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Json(v) => serde_json::to_string(v).unwrap_or_else(|_| v.to_string()),
            ToolOutput::Error(_) => "[]".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Json(_))
    }
}

/// Context passed to tools during execution
pub struct ToolContext {
    /// Whose session this turn belongs to
    pub user_id: String,
    pub user_name: String,
    /// If set, only these tool names are callable in this context
    /// (case-insensitive). The crisis strategy narrows this to the
    /// doctor and song tools.
    pub allowed_tools: Option<Vec<String>>,
}

impl ToolContext {
    pub fn for_user(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            allowed_tools: None,
        }
    }

    pub fn restricted_to(mut self, names: &[&str]) -> Self {
        self.allowed_tools = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn allows_tool(&self, tool_name: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) => allowed
                .iter()
                .any(|name| name.eq_ignore_ascii_case(tool_name)),
            None => true,
        }
    }
}

/// A tool provides the assistant with a data capability (mood history,
/// song/doctor recommendations, breathing exercises).
///
/// Each tool declares its parameters as a JSON Schema, enabling LLM
/// function-calling, and resolves its data through a source trait so tests
/// can substitute fixtures.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in function-calling (e.g., "get_mood_history")
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// OpenAI-format function definition for LLM function-calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// A tool call parsed from LLM output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Result of a tool call, ready to feed back to the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub name: String,
    pub output: ToolOutput,
}

/// Thread-safe registry of the tools available to the assistant.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!("Registered tool: {}", name);
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    /// Generate OpenAI-format tool definitions, filtered by context policy.
    ///
    /// The output goes directly into the `tools` parameter of a chat
    /// completions request.
    pub async fn tool_definitions_for_context(&self, ctx: &ToolContext) -> Vec<ToolDef> {
        let tools = self.tools.read().await;
        tools
            .values()
            .filter(|tool| ctx.allows_tool(tool.name()))
            .map(|tool| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    /// Execute one tool call. Never returns Err: unknown names, policy
    /// violations and execution failures all come back as `ToolOutput::Error`,
    /// which the model-facing string renders as an empty result set.
    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        if !ctx.allows_tool(&call.name) {
            tracing::warn!("Tool '{}' blocked by context policy", call.name);
            return ToolCallResult {
                name: call.name.clone(),
                output: ToolOutput::Error(format!(
                    "Tool '{}' is not available in this context",
                    call.name
                )),
            };
        }

        let tool = match self.get(&call.name).await {
            Some(t) => t,
            None => {
                tracing::warn!("Unknown tool requested: {}", call.name);
                return ToolCallResult {
                    name: call.name.clone(),
                    output: ToolOutput::Error(format!("Unknown tool: {}", call.name)),
                };
            }
        };

        match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => ToolCallResult {
                name: call.name.clone(),
                output,
            },
            Err(e) => {
                tracing::error!("Tool '{}' failed: {}", call.name, e);
                ToolCallResult {
                    name: call.name.clone(),
                    output: ToolOutput::Error(format!("Tool execution failed: {}", e)),
                }
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubTool {
        name: &'static str,
        payload: serde_json::Value,
    }

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "stub"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput> {
            Ok(ToolOutput::Json(self.payload.clone()))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput> {
            anyhow::bail!("backend unavailable")
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::for_user("user-1", "Ada")
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(StubTool {
                name: "get_mood_history",
                payload: serde_json::json!([]),
            }))
            .await;

        assert!(registry.get("get_mood_history").await.is_some());
        assert!(registry.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn definitions_use_function_calling_format() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(StubTool {
                name: "get_recommended_songs",
                payload: serde_json::json!([]),
            }))
            .await;

        let defs = registry.tool_definitions_for_context(&ctx()).await;
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].tool_type, "function");
        assert_eq!(defs[0].function.name, "get_recommended_songs");
    }

    #[tokio::test]
    async fn unknown_tool_degrades_to_empty_result() {
        let registry = ToolRegistry::new();
        let call = ToolCall {
            name: "nonexistent".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = registry.execute_call(&call, &ctx()).await;
        assert!(!result.output.is_success());
        assert_eq!(result.output.to_llm_string(), "[]");
    }

    #[tokio::test]
    async fn failing_tool_degrades_to_empty_result() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool)).await;
        let call = ToolCall {
            name: "flaky".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = registry.execute_call(&call, &ctx()).await;
        assert!(matches!(result.output, ToolOutput::Error(_)));
        assert_eq!(result.output.to_llm_string(), "[]");
    }

    #[tokio::test]
    async fn allowlist_blocks_other_tools() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(StubTool {
                name: "get_recommended_doctors",
                payload: serde_json::json!([]),
            }))
            .await;
        registry
            .register(Arc::new(StubTool {
                name: "get_mood_history",
                payload: serde_json::json!([]),
            }))
            .await;

        let restricted = ctx().restricted_to(&["get_recommended_doctors"]);

        let call = ToolCall {
            name: "get_mood_history".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = registry.execute_call(&call, &restricted).await;
        assert!(matches!(result.output, ToolOutput::Error(_)));

        let defs = registry.tool_definitions_for_context(&restricted).await;
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function.name, "get_recommended_doctors");
    }
}
