//! Anthropic messages API implementation of [`Chatter`].

use serde_json::{json, Value};

use super::{ChatError, ChatRequest, ChatResponse, ChatRole, Chatter};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Chat provider backed by the Anthropic `/v1/messages` endpoint.
#[derive(Debug, Clone)]
pub struct AnthropicChatter {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicChatter {
    /// Create a provider for the given base URL, model, and API key.
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
            api_key: api_key.to_owned(),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for message in &request.messages {
            match message.role {
                ChatRole::System => system_parts.push(message.content.clone()),
                ChatRole::User | ChatRole::Assistant => messages.push(json!({
                    "role": role_str(message.role),
                    "content": message.content,
                })),
            }
        }

        // A response schema becomes a trailing system instruction; callers
        // still validate the parsed JSON against their own types.
        if let Some(ref schema) = request.response_schema {
            system_parts.push(format!(
                "Respond with a single JSON document conforming to this JSON Schema, \
                 with no surrounding prose:\n{schema}"
            ));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        body
    }
}

#[async_trait::async_trait]
impl Chatter for AnthropicChatter {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(request);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| ChatError::Transient(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &payload));
        }

        let parsed: Value =
            serde_json::from_str(&payload).map_err(|e| ChatError::Parse(e.to_string()))?;
        let text = parse_content_text(&parsed)?;
        Ok(ChatResponse { text })
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System | ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

/// Map an HTTP status to the error taxonomy the retry wrapper understands.
fn classify_status(status: u16, body: &str) -> ChatError {
    let summary: String = body.chars().take(256).collect();
    match status {
        429 => ChatError::RateLimited(format!("status 429: {summary}")),
        500..=599 => ChatError::Transient(format!("status {status}: {summary}")),
        _ => ChatError::InvalidRequest(format!("status {status}: {summary}")),
    }
}

fn parse_content_text(value: &Value) -> Result<String, ChatError> {
    let Some(content_items) = value.get("content").and_then(Value::as_array) else {
        return Err(ChatError::Parse("missing content array".to_owned()));
    };

    let mut text = String::new();
    for item in content_items {
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
        if item_type == "text" {
            let part = item.get("text").and_then(Value::as_str).unwrap_or_default();
            text.push_str(part);
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    #[test]
    fn test_build_body_separates_system_messages() {
        let chatter = AnthropicChatter::new("https://api.example.com", "model-x", "key");
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system("You plan days."),
                ChatMessage::user("Plan my day."),
            ],
            max_tokens: 100,
            response_schema: None,
        };
        let body = chatter.build_body(&request);
        assert_eq!(body["system"], json!("You plan days."));
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_build_body_appends_schema_instruction() {
        let chatter = AnthropicChatter::new("https://api.example.com", "model-x", "key");
        let request = ChatRequest {
            messages: vec![ChatMessage::user("go")],
            max_tokens: 50,
            response_schema: Some(json!({"type": "object"})),
        };
        let body = chatter.build_body(&request);
        let system = body["system"].as_str().unwrap_or_default();
        assert!(system.contains("JSON Schema"));
    }

    #[test]
    fn test_classify_status_taxonomy() {
        assert!(matches!(classify_status(429, ""), ChatError::RateLimited(_)));
        assert!(matches!(classify_status(503, ""), ChatError::Transient(_)));
        assert!(matches!(
            classify_status(400, ""),
            ChatError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_status(401, ""),
            ChatError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_parse_content_text_joins_parts() {
        let value = json!({
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "tool_use", "id": "x", "name": "n", "input": {}},
                {"type": "text", "text": "world"}
            ]
        });
        assert_eq!(parse_content_text(&value).expect("ok"), "Hello world");
    }

    #[test]
    fn test_parse_content_text_missing_content() {
        assert!(parse_content_text(&json!({"role": "assistant"})).is_err());
    }
}
