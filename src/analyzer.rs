use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::llm::{ChatMessage, LlmClient, LlmError};
use crate::scan::RawMessage;
use crate::scenarios::{ScenarioId, ScenarioRegistry, SchemaFields};

/// Analysis failure. `fatal` failures are retried on a later pass;
/// the rest are recorded against the message and never retried.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{}analysis error: {message}", severity_prefix(.fatal))]
pub struct AnalysisError {
    pub fatal: bool,
    pub message: String,
}

fn severity_prefix(fatal: &bool) -> &'static str {
    if *fatal {
        "fatal "
    } else {
        ""
    }
}

impl AnalysisError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            fatal: false,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            message: message.into(),
        }
    }
}

/// Scenario-defined structured output: an open map of field name → value.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct StructuredResult(pub Map<String, Value>);

impl StructuredResult {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn confidence<'a>(&'a self, fields: &SchemaFields) -> Option<&'a Value> {
        self.get(&fields.confidence_field)
    }

    pub fn reasoning<'a>(&'a self, fields: &SchemaFields) -> Option<&'a str> {
        self.get(&fields.reasoning_field).and_then(Value::as_str)
    }
}

/// Orderable rank of a confidence value: HIGH/MEDIUM/LOW map to 3/2/1,
/// numbers rank by value, anything else is unranked.
pub fn confidence_rank(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Some(3.0),
            "MEDIUM" => Some(2.0),
            "LOW" => Some(1.0),
            _ => None,
        },
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        scenario: &ScenarioId,
        message: &RawMessage,
    ) -> Result<StructuredResult, AnalysisError>;
}

/// Analyzer backed by an OpenAI-compatible chat completion endpoint.
pub struct LlmAnalyzer {
    llm: LlmClient,
    scenarios: Arc<ScenarioRegistry>,
}

impl LlmAnalyzer {
    pub fn new(llm: LlmClient, scenarios: Arc<ScenarioRegistry>) -> Self {
        Self { llm, scenarios }
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(
        &self,
        scenario_id: &ScenarioId,
        message: &RawMessage,
    ) -> Result<StructuredResult, AnalysisError> {
        let scenario = self
            .scenarios
            .get(scenario_id)
            .ok_or_else(|| AnalysisError::fatal(format!("unknown scenario '{}'", scenario_id)))?;

        let messages = [
            ChatMessage::system(scenario.prompt.clone()),
            ChatMessage::user(message.text.clone()),
        ];

        debug!(
            "Analyzing message from {} in '{}' with {} ({})",
            message.sender,
            message.group,
            scenario_id,
            self.llm.model()
        );

        let content = self
            .llm
            .complete_json(&messages, scenario_id.as_str(), &scenario.response_schema)
            .await
            .map_err(classify)?;

        parse_structured(&content, &scenario.schema_fields())
    }
}

fn classify(error: LlmError) -> AnalysisError {
    match &error {
        LlmError::Connect { .. } => AnalysisError::fatal(error.to_string()),
        LlmError::Status { status, .. } if (400..500).contains(status) => {
            AnalysisError::fatal(error.to_string())
        }
        _ => AnalysisError::recoverable(error.to_string()),
    }
}

/// Parse model output into a result, tolerating a fenced code block around the JSON.
pub fn parse_structured(content: &str, fields: &SchemaFields) -> Result<StructuredResult, AnalysisError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: Value = serde_json::from_str(body)
        .map_err(|e| AnalysisError::recoverable(format!("model output is not JSON: {}", e)))?;
    let Value::Object(mut map) = value else {
        return Err(AnalysisError::recoverable("model output is not a JSON object"));
    };

    let missing: Vec<&str> = fields
        .required
        .iter()
        .filter(|f| !map.contains_key(f.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(AnalysisError::recoverable(format!(
            "model output is missing required field(s): {}",
            missing.join(", ")
        )));
    }

    // Undeclared keys are dropped, the way a typed model ignores extras.
    if !fields.fields.is_empty() {
        map.retain(|key, _| {
            let declared = fields.fields.iter().any(|f| f == key);
            if !declared {
                debug!("Dropping undeclared field '{}' from model output", key);
            }
            declared
        });
    }

    Ok(StructuredResult(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> SchemaFields {
        SchemaFields {
            fields: vec!["is_match".into(), "confidence".into(), "reasoning".into()],
            required: vec!["is_match".into(), "confidence".into()],
            confidence_field: "confidence".into(),
            reasoning_field: "reasoning".into(),
        }
    }

    #[test]
    fn test_parse_plain_json() {
        let result = parse_structured(
            r#"{"is_match": true, "confidence": "HIGH", "reasoning": "evening game"}"#,
            &fields(),
        )
        .unwrap();
        assert_eq!(result.get("is_match"), Some(&json!(true)));
        assert_eq!(result.confidence(&fields()), Some(&json!("HIGH")));
        assert_eq!(result.reasoning(&fields()), Some("evening game"));
    }

    #[test]
    fn test_parse_fenced_json() {
        let result = parse_structured(
            "```json\n{\"is_match\": false, \"confidence\": \"LOW\"}\n```",
            &fields(),
        )
        .unwrap();
        assert_eq!(result.get("is_match"), Some(&json!(false)));
    }

    #[test]
    fn test_undeclared_fields_are_dropped() {
        let result = parse_structured(
            r#"{"is_match": true, "confidence": "HIGH", "note": "extra"}"#,
            &fields(),
        )
        .unwrap();
        assert_eq!(result.get("note"), None);
        assert_eq!(result.0.len(), 2);

        let open = SchemaFields {
            fields: Vec::new(),
            ..fields()
        };
        let kept = parse_structured(r#"{"is_match": true, "confidence": "LOW", "note": "x"}"#, &open)
            .unwrap();
        assert_eq!(kept.get("note"), Some(&json!("x")));
    }

    #[test]
    fn test_parse_failures_are_recoverable() {
        let not_json = parse_structured("sure! here you go", &fields()).unwrap_err();
        assert!(!not_json.fatal);
        let not_object = parse_structured("[1, 2]", &fields()).unwrap_err();
        assert!(!not_object.fatal);
        let missing = parse_structured(r#"{"is_match": true}"#, &fields()).unwrap_err();
        assert!(!missing.fatal);
        assert!(missing.message.contains("confidence"));
    }

    #[test]
    fn test_classify_errors() {
        assert!(classify(LlmError::Connect {
            url: "http://localhost:11434/v1".into(),
            reason: "refused".into()
        })
        .fatal);
        assert!(classify(LlmError::Status {
            status: 400,
            body: "invalid schema".into()
        })
        .fatal);
        assert!(!classify(LlmError::Status {
            status: 503,
            body: "busy".into()
        })
        .fatal);
        assert!(!classify(LlmError::Timeout).fatal);
        assert!(!classify(LlmError::Empty).fatal);
    }

    #[test]
    fn test_confidence_rank() {
        assert_eq!(confidence_rank(&json!("HIGH")), Some(3.0));
        assert_eq!(confidence_rank(&json!("medium")), Some(2.0));
        assert_eq!(confidence_rank(&json!("LOW")), Some(1.0));
        assert_eq!(confidence_rank(&json!(0.75)), Some(0.75));
        assert_eq!(confidence_rank(&json!("unsure")), None);
        assert_eq!(confidence_rank(&json!(null)), None);
    }

    #[test]
    fn test_error_display_marks_fatal() {
        assert_eq!(
            AnalysisError::fatal("schema rejected").to_string(),
            "fatal analysis error: schema rejected"
        );
        assert_eq!(
            AnalysisError::recoverable("bad output").to_string(),
            "analysis error: bad output"
        );
    }
}
