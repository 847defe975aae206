use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Failure modes of a completion request, kept apart so callers can decide
/// which ones are worth retrying.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,
    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("response had no content")]
    Empty,
}

pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Run a chat completion constrained to `schema` and return the raw content.
    pub async fn complete_json(
        &self,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: &serde_json::Value,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: messages.to_vec(),
            response_format: ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: schema_name.to_string(),
                    schema: schema.clone(),
                    strict: true,
                },
            },
            max_tokens: self.config.max_tokens,
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.config.effective_base_url());

        debug!("Sending request to {}: {}", self.config.provider, url);

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request);
        if !self.config.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else if e.is_connect() {
                LlmError::Connect {
                    url: url.clone(),
                    reason: e.to_string(),
                }
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Decode(e.to_string())
            }
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_carries_json_schema_format() {
        let request = ChatRequest {
            model: "gpt-oss:20b".to_string(),
            messages: vec![ChatMessage::system("prompt"), ChatMessage::user("hello")],
            response_format: ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: "padel".to_string(),
                    schema: json!({ "type": "object" }),
                    strict: true,
                },
            },
            max_tokens: 256,
            temperature: 0.0,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["response_format"]["type"], "json_schema");
        assert_eq!(value["response_format"]["json_schema"]["name"], "padel");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hello");
    }

    #[test]
    fn test_response_without_content_parses() {
        let response: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert!(response.choices[0].message.content.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connect_error() {
        let client = LlmClient::new(LlmConfig {
            base_url: "http://127.0.0.1:9/v1".to_string(),
            timeout_secs: 5,
            ..LlmConfig::default()
        })
        .unwrap();
        let err = client
            .complete_json(&[ChatMessage::user("hi")], "s", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Connect { .. }));
    }
}
