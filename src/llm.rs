//! Generation capability: an OpenAI-compatible chat-completions client behind
//! the `LanguageBackend` trait.
//!
//! The trait is the seam the orchestrator is tested through; the HTTP client
//! below is the production implementation, tests substitute scripted
//! backends. Supports function-calling (`tools`) and SSE streaming with
//! tool-call delta accumulation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tools::ToolDef;

/// A message on the completions wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|calls| !calls.is_empty())
            .unwrap_or(false)
    }
}

/// Tool call as returned by the model (OpenAI format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: LlmFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmFunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

/// One completion request. `tools` is empty for plain generation.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub tools: Vec<ToolDef>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.4,
            max_tokens: 2000,
            tools: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = tools;
        self
    }
}

/// The opaque text-generation capability the orchestrator composes.
#[async_trait]
pub trait LanguageBackend: Send + Sync {
    /// One blocking completion. The returned message may carry tool calls.
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage>;

    /// Streaming completion. `on_chunk` receives each content delta as it
    /// arrives; the full accumulated message is returned at the end.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        on_chunk: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<ChatMessage>;
}

/// HTTP client for any OpenAI-compatible endpoint (Ollama, LM Studio, vLLM,
/// OpenAI, ...).
pub struct HttpLlmClient {
    api_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(api_url: String, api_key: Option<String>) -> Self {
        Self {
            api_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Result<serde_json::Value> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(&request.tools)?;
        }
        if stream {
            body["stream"] = serde_json::Value::Bool(true);
        }
        Ok(body)
    }

    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.api_url);
        let mut req = self.client.post(url).json(body);
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", key));
            }
        }
        req
    }
}

#[async_trait]
impl LanguageBackend for HttpLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage> {
        let body = self.request_body(&request, false)?;
        let response = self
            .post(&body)
            .send()
            .await
            .context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let choice = response_json["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("Empty choices in LLM response")?;

        let message = &choice["message"];
        let content = message["content"].as_str().map(String::from);
        let tool_calls: Option<Vec<LlmToolCall>> = message
            .get("tool_calls")
            .and_then(|tc| serde_json::from_value(tc.clone()).ok());

        Ok(ChatMessage {
            role: "assistant".to_string(),
            content,
            tool_calls,
            tool_call_id: None,
        })
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        on_chunk: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<ChatMessage> {
        #[derive(Debug, Clone, Default)]
        struct ToolCallAccumulator {
            id: String,
            call_type: String,
            name: String,
            arguments: String,
        }

        let body = self.request_body(&request, true)?;
        let mut response = self
            .post(&body)
            .send()
            .await
            .context("Failed to send streaming LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Streaming LLM API error {}: {}", status, body);
        }

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();
        let mut line_buffer = String::new();
        let mut saw_done = false;

        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed reading streaming chunk")?
        {
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_idx) = line_buffer.find('\n') {
                let line = line_buffer[..newline_idx].trim().to_string();
                line_buffer = line_buffer[newline_idx + 1..].to_string();

                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if !line.starts_with("data:") {
                    continue;
                }

                let payload = line[5..].trim();
                if payload == "[DONE]" {
                    saw_done = true;
                    break;
                }

                let chunk_json: serde_json::Value = serde_json::from_str(payload)
                    .with_context(|| format!("Failed to parse stream payload: {}", payload))?;

                let Some(choice) = chunk_json["choices"].as_array().and_then(|arr| arr.first())
                else {
                    continue;
                };

                if let Some(delta_content) = choice["delta"]["content"].as_str() {
                    if !delta_content.is_empty() {
                        content.push_str(delta_content);
                        on_chunk(delta_content);
                    }
                }

                if let Some(tc_deltas) = choice["delta"]["tool_calls"].as_array() {
                    for tc_delta in tc_deltas {
                        let idx = tc_delta
                            .get("index")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(tool_calls.len() as u64)
                            as usize;

                        while tool_calls.len() <= idx {
                            tool_calls.push(ToolCallAccumulator::default());
                        }
                        let acc = &mut tool_calls[idx];

                        if let Some(id) = tc_delta.get("id").and_then(|v| v.as_str()) {
                            acc.id = id.to_string();
                        }
                        if let Some(call_type) = tc_delta.get("type").and_then(|v| v.as_str()) {
                            acc.call_type = call_type.to_string();
                        }
                        if let Some(name_part) = tc_delta
                            .get("function")
                            .and_then(|f| f.get("name"))
                            .and_then(|v| v.as_str())
                        {
                            acc.name.push_str(name_part);
                        }
                        if let Some(args_part) = tc_delta
                            .get("function")
                            .and_then(|f| f.get("arguments"))
                            .and_then(|v| v.as_str())
                        {
                            acc.arguments.push_str(args_part);
                        }
                    }
                }
            }

            if saw_done {
                break;
            }
        }

        let parsed_tool_calls = tool_calls
            .into_iter()
            .enumerate()
            .filter_map(|(idx, tc)| {
                let name = tc.name.trim().to_string();
                if name.is_empty() {
                    return None;
                }
                Some(LlmToolCall {
                    id: if tc.id.trim().is_empty() {
                        format!("stream_tool_call_{}", idx)
                    } else {
                        tc.id
                    },
                    call_type: if tc.call_type.trim().is_empty() {
                        "function".to_string()
                    } else {
                        tc.call_type
                    },
                    function: LlmFunctionCall {
                        name,
                        arguments: if tc.arguments.trim().is_empty() {
                            "{}".to_string()
                        } else {
                            tc.arguments
                        },
                    },
                })
            })
            .collect::<Vec<_>>();

        Ok(ChatMessage {
            role: "assistant".to_string(),
            content: if content.is_empty() {
                None
            } else {
                Some(content)
            },
            tool_calls: if parsed_tool_calls.is_empty() {
                None
            } else {
                Some(parsed_tool_calls)
            },
            tool_call_id: None,
        })
    }
}

/// Parse a typed value out of free-form model output.
///
/// Models wrap JSON in prose, markdown fences, or reasoning tags; try the
/// raw text first, then a ```json fence, then the outermost `{...}` span.
pub fn parse_json_lenient<T>(response: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response.trim()) {
        return Ok(parsed);
    }

    let cleaned = if let Some(think_end) = response.rfind("</think>") {
        &response[think_end + 8..]
    } else {
        response
    };

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        if let Some(end) = after_start.find("```") {
            after_start[..end].trim()
        } else {
            cleaned
        }
    } else if let Some(start) = cleaned.find('{') {
        if let Some(end) = cleaned.rfind('}') {
            &cleaned[start..=end]
        } else {
            cleaned
        }
    } else {
        cleaned
    };

    serde_json::from_str::<T>(json_content.trim()).context(format!(
        "Failed to parse JSON from model output. Extracted: {} | Original: {}",
        json_content,
        response.chars().take(500).collect::<String>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        value: i32,
    }

    #[test]
    fn parses_clean_json() {
        let probe: Probe = parse_json_lenient(r#"{"value": 3}"#).unwrap();
        assert_eq!(probe, Probe { value: 3 });
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let probe: Probe =
            parse_json_lenient("Sure! Here you go: {\"value\": 7} — hope that helps.").unwrap();
        assert_eq!(probe.value, 7);
    }

    #[test]
    fn parses_json_in_markdown_fence() {
        let probe: Probe = parse_json_lenient("```json\n{\"value\": 9}\n```").unwrap();
        assert_eq!(probe.value, 9);
    }

    #[test]
    fn skips_reasoning_tags() {
        let probe: Probe =
            parse_json_lenient("<think>{\"value\": 0}</think>\n{\"value\": 5}").unwrap();
        assert_eq!(probe.value, 5);
    }

    #[test]
    fn fails_on_garbage() {
        assert!(parse_json_lenient::<Probe>("no json here").is_err());
    }

    #[test]
    fn tool_call_fields_skip_when_absent() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let msg = ChatMessage::tool_result("call_1", "[]");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
    }

    #[test]
    fn has_tool_calls_requires_nonempty_list() {
        let mut msg = ChatMessage::assistant("draft");
        assert!(!msg.has_tool_calls());
        msg.tool_calls = Some(vec![]);
        assert!(!msg.has_tool_calls());
        msg.tool_calls = Some(vec![LlmToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: LlmFunctionCall {
                name: "get_recommended_songs".to_string(),
                arguments: "{}".to_string(),
            },
        }]);
        assert!(msg.has_tool_calls());
    }
}
