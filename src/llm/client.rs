//! LLMClient (C7, §4.6): chat-completion transport with discovery, model
//! resolution by role, and retry with backoff.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::TransportError;
use crate::state::types::ToolCall;
use crate::tools::ToolSchema;

use super::parser::{parse_response, ParsedResponse};

const RETRY_BASE_MS: u64 = 1000;
const RETRY_FACTOR: u64 = 2;
const MAX_ATTEMPTS: u32 = 3;
const DISCOVERY_TTL_SECS: u64 = 300;

/// An entry in a role's model fallback list, e.g. `gpt-4o@http://host:port`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCandidate {
    pub model: String,
    pub server: String,
}

impl ModelCandidate {
    pub fn parse(raw: &str) -> Option<Self> {
        let (model, server) = raw.trim().split_once('@')?;
        Some(Self { model: model.to_string(), server: server.to_string() })
    }
}

#[derive(Debug, Clone, Default)]
struct DiscoveryCacheEntry {
    models: Vec<String>,
    fetched_at: Option<Instant>,
}

/// Resolved server/model pair for one chat call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub server: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpecWire<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ToolSpecWire<'a> {
    r#type: &'static str,
    function: ToolFunctionWire<'a>,
}

#[derive(Debug, Serialize)]
struct ToolFunctionWire<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<NativeToolCallWire>,
}

#[derive(Debug, Deserialize)]
struct NativeToolCallWire {
    id: String,
    function: NativeToolCallFunctionWire,
}

#[derive(Debug, Deserialize)]
struct NativeToolCallFunctionWire {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Chat-completion transport against one or more OpenAI-compatible
/// endpoints, with per-role model fallback and discovery caching.
pub struct LlmClient {
    http: reqwest::Client,
    model_assignments: HashMap<String, Vec<ModelCandidate>>,
    discovery_cache: HashMap<String, DiscoveryCacheEntry>,
}

impl LlmClient {
    pub fn new(model_assignments: HashMap<String, Vec<ModelCandidate>>) -> Self {
        Self { http: reqwest::Client::new(), model_assignments, discovery_cache: HashMap::new() }
    }

    /// Query each endpoint's `/v1/models`, caching availability with a
    /// five-minute TTL.
    pub async fn discover(&mut self, endpoints: &[String]) {
        for endpoint in endpoints {
            let fresh = self
                .discovery_cache
                .get(endpoint)
                .and_then(|e| e.fetched_at)
                .is_some_and(|t| t.elapsed() < Duration::from_secs(DISCOVERY_TTL_SECS));
            if fresh {
                continue;
            }
            match self.http.get(format!("{endpoint}/v1/models")).send().await {
                Ok(response) => match response.json::<ModelsResponse>().await {
                    Ok(parsed) => {
                        self.discovery_cache.insert(
                            endpoint.clone(),
                            DiscoveryCacheEntry {
                                models: parsed.data.into_iter().map(|m| m.id).collect(),
                                fetched_at: Some(Instant::now()),
                            },
                        );
                    }
                    Err(err) => warn!(endpoint, error = %err, "model discovery response unparseable"),
                },
                Err(err) => warn!(endpoint, error = %err, "model discovery request failed"),
            }
        }
    }

    fn is_available(&self, candidate: &ModelCandidate) -> bool {
        match self.discovery_cache.get(&candidate.server) {
            Some(entry) if entry.fetched_at.is_some() => entry.models.iter().any(|m| m == &candidate.model),
            // No discovery has run for this server yet; assume available
            // rather than blocking every call on a discover() call first.
            _ => true,
        }
    }

    /// Resolve a phase role to a concrete `(server, model)`, falling back
    /// through the configured candidate list until one is available.
    pub fn model_for(&self, role: &str) -> Result<ResolvedModel, TransportError> {
        let candidates = self
            .model_assignments
            .get(role)
            .ok_or_else(|| TransportError::NoModelForRole { role: role.to_string() })?;
        candidates
            .iter()
            .find(|c| self.is_available(c))
            .map(|c| ResolvedModel { server: c.server.clone(), model: c.model.clone() })
            .ok_or_else(|| TransportError::NoModelForRole { role: role.to_string() })
    }

    /// Send a chat-completion request, retrying transport failures with
    /// exponential backoff (base 1s, factor 2, 3 attempts).
    pub async fn chat(
        &self,
        resolved: &ResolvedModel,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        deadline: Duration,
    ) -> Result<ParsedResponse, TransportError> {
        let wire_tools: Vec<ToolSpecWire> = tools
            .iter()
            .map(|t| ToolSpecWire { r#type: "function", function: ToolFunctionWire { name: &t.name, description: &t.description } })
            .collect();

        let body = ChatRequest { model: &resolved.model, messages, tools: wire_tools, stream: false };
        let url = format!("{}/v1/chat/completions", resolved.server);

        let mut attempt = 0;
        let mut backoff = Duration::from_millis(RETRY_BASE_MS);
        loop {
            attempt += 1;
            let sent = self.http.post(&url).timeout(deadline).json(&body).send().await;

            match sent {
                Ok(response) => {
                    return self.parse_chat_response(response, &resolved.server).await;
                }
                Err(err) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(TransportError::RequestFailed { server: resolved.server.clone(), attempts: attempt, source: err });
                    }
                    warn!(server = %resolved.server, attempt, error = %err, timed_out = err.is_timeout(), "chat request failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= RETRY_FACTOR as u32;
                }
            }
        }
    }

    async fn parse_chat_response(&self, response: reqwest::Response, server: &str) -> Result<ParsedResponse, TransportError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::BadResponse { server: server.to_string(), message: format!("HTTP {status}: {body}") });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::BadResponse { server: server.to_string(), message: e.to_string() })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::BadResponse { server: server.to_string(), message: "no choices in response".to_string() })?;

        let native_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| ToolCall {
                call_id: c.id,
                name: c.function.name,
                arguments: serde_json::from_str::<Value>(&c.function.arguments).unwrap_or(json!({})),
            })
            .collect();

        let content = choice.message.content.unwrap_or_default();
        Ok(parse_response(&content, &native_calls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_candidate_parses_model_at_server() {
        let candidate = ModelCandidate::parse("gpt-4o@http://localhost:8080").unwrap();
        assert_eq!(candidate.model, "gpt-4o");
        assert_eq!(candidate.server, "http://localhost:8080");
    }

    #[test]
    fn model_candidate_rejects_missing_at_sign() {
        assert!(ModelCandidate::parse("gpt-4o").is_none());
    }

    #[test]
    fn model_for_unknown_role_errors() {
        let client = LlmClient::new(HashMap::new());
        let result = client.model_for("coding");
        assert!(matches!(result, Err(TransportError::NoModelForRole { .. })));
    }

    #[test]
    fn model_for_falls_back_through_candidates_when_none_discovered() {
        let mut assignments = HashMap::new();
        assignments.insert(
            "coding".to_string(),
            vec![
                ModelCandidate { model: "gpt-4o".to_string(), server: "http://a".to_string() },
                ModelCandidate { model: "gpt-4o-mini".to_string(), server: "http://b".to_string() },
            ],
        );
        let client = LlmClient::new(assignments);
        let resolved = client.model_for("coding").unwrap();
        assert_eq!(resolved.model, "gpt-4o");
    }

    #[test]
    fn model_for_skips_unavailable_discovered_candidate() {
        let mut assignments = HashMap::new();
        assignments.insert(
            "coding".to_string(),
            vec![
                ModelCandidate { model: "gpt-4o".to_string(), server: "http://a".to_string() },
                ModelCandidate { model: "gpt-4o-mini".to_string(), server: "http://b".to_string() },
            ],
        );
        let mut client = LlmClient::new(assignments);
        client.discovery_cache.insert(
            "http://a".to_string(),
            DiscoveryCacheEntry { models: vec!["some-other-model".to_string()], fetched_at: Some(Instant::now()) },
        );
        let resolved = client.model_for("coding").unwrap();
        assert_eq!(resolved.model, "gpt-4o-mini");
    }
}
