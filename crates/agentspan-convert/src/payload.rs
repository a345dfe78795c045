//! Typed views of the trace payloads the converter understands.
//!
//! Every field is optional: agent runtimes omit whatever they did not
//! observe, and the converter omits the matching attributes in turn.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationPayload {
    pub model_invocation_input: Option<ModelInvocationInput>,
    pub model_invocation_output: Option<ModelInvocationOutput>,
    pub rationale: Option<Rationale>,
    pub invocation_input: Option<InvocationInput>,
    pub observation: Option<Observation>,
}

impl OrchestrationPayload {
    /// Step identifier shared by all events of one orchestration step.
    pub fn step_id(&self) -> Option<&str> {
        self.model_invocation_input
            .as_ref()
            .and_then(|m| m.trace_id.as_deref())
            .or_else(|| self.model_invocation_output.as_ref().and_then(|m| m.trace_id.as_deref()))
            .or_else(|| self.rationale.as_ref().and_then(|r| r.trace_id.as_deref()))
            .or_else(|| self.invocation_input.as_ref().and_then(|i| i.trace_id.as_deref()))
            .or_else(|| self.observation.as_ref().and_then(|o| o.trace_id.as_deref()))
    }

    pub fn is_empty(&self) -> bool {
        self.model_invocation_input.is_none()
            && self.model_invocation_output.is_none()
            && self.rationale.is_none()
            && self.invocation_input.is_none()
            && self.observation.is_none()
    }
}

/// Pre- and post-processing payloads share this shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingPayload {
    pub model_invocation_input: Option<ModelInvocationInput>,
    pub model_invocation_output: Option<ModelInvocationOutput>,
}

impl ProcessingPayload {
    pub fn step_id(&self) -> Option<&str> {
        self.model_invocation_input
            .as_ref()
            .and_then(|m| m.trace_id.as_deref())
            .or_else(|| self.model_invocation_output.as_ref().and_then(|m| m.trace_id.as_deref()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInvocationInput {
    pub trace_id: Option<String>,
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub invocation_type: Option<String>,
    pub foundation_model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInvocationOutput {
    pub trace_id: Option<String>,
    pub raw_response: Option<RawResponse>,
    pub metadata: Option<OutputMetadata>,
    pub parsed_response: Option<ParsedResponse>,
}

impl ModelInvocationOutput {
    /// Usage reported either in the invocation metadata or the raw response.
    pub fn usage(&self) -> Option<&Usage> {
        self.metadata
            .as_ref()
            .and_then(|m| m.usage.as_ref())
            .or_else(|| self.raw_response.as_ref().and_then(|r| r.usage.as_ref()))
    }

    pub fn completion(&self) -> Option<String> {
        self.raw_response.as_ref().and_then(|r| r.content.as_ref()).and_then(content_text)
    }

    pub fn model_id(&self) -> Option<&str> {
        self.raw_response.as_ref().and_then(|r| r.model_id.as_deref())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResponse {
    pub content: Option<Value>,
    pub usage: Option<Usage>,
    pub model_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetadata {
    pub usage: Option<Usage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResponse {
    pub rationale: Option<String>,
    pub is_valid: Option<bool>,
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rationale {
    pub trace_id: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationInput {
    pub trace_id: Option<String>,
    pub invocation_type: Option<String>,
    pub action_group_invocation_input: Option<ActionGroupInput>,
    pub knowledge_base_lookup_input: Option<KnowledgeBaseInput>,
    pub code_interpreter_invocation_input: Option<CodeInterpreterInput>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionGroupInput {
    pub action_group_name: Option<String>,
    pub function: Option<String>,
    pub api_path: Option<String>,
    pub verb: Option<String>,
    pub parameters: Option<Value>,
}

impl ActionGroupInput {
    /// `group.function`, or `group.VERB /path` for API-schema action groups.
    pub fn tool_name(&self) -> String {
        let group = self.action_group_name.as_deref().unwrap_or("action_group");
        match (&self.function, &self.api_path) {
            (Some(function), _) => format!("{group}.{function}"),
            (None, Some(path)) => {
                let verb = self.verb.as_deref().unwrap_or("call").to_ascii_uppercase();
                format!("{group}.{verb} {path}")
            }
            (None, None) => group.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseInput {
    pub knowledge_base_id: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeInterpreterInput {
    pub code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub trace_id: Option<String>,
    #[serde(rename = "type")]
    pub observation_type: Option<String>,
    pub action_group_invocation_output: Option<TextOutput>,
    pub knowledge_base_lookup_output: Option<KnowledgeBaseOutput>,
    pub code_interpreter_invocation_output: Option<CodeInterpreterOutput>,
    pub final_response: Option<TextOutput>,
    pub reprompt_response: Option<TextOutput>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOutput {
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseOutput {
    #[serde(default)]
    pub retrieved_references: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeInterpreterOutput {
    pub execution_output: Option<String>,
    pub execution_error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailPayload {
    pub trace_id: Option<String>,
    pub action: Option<String>,
    #[serde(default)]
    pub input_assessments: Vec<Assessment>,
    #[serde(default)]
    pub output_assessments: Vec<Assessment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub topic_policy: Option<TopicPolicy>,
    pub content_policy: Option<FilterPolicy>,
    pub word_policy: Option<WordPolicy>,
    pub sensitive_information_policy: Option<SensitiveInformationPolicy>,
    pub contextual_grounding_policy: Option<FilterPolicy>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TopicPolicy {
    #[serde(default)]
    pub topics: Vec<Named>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterPolicy {
    #[serde(default)]
    pub filters: Vec<Typed>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordPolicy {
    #[serde(default)]
    pub custom_words: Vec<Matched>,
    #[serde(default)]
    pub managed_word_lists: Vec<Typed>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitiveInformationPolicy {
    #[serde(default)]
    pub pii_entities: Vec<Typed>,
    #[serde(default)]
    pub regexes: Vec<Named>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Named {
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Typed {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Matched {
    #[serde(rename = "match")]
    pub matched: Option<String>,
}

impl Assessment {
    /// Identifiers of every policy rule this assessment reports.
    pub fn rule_ids(&self) -> impl Iterator<Item = String> + '_ {
        let topics = self
            .topic_policy
            .iter()
            .flat_map(|p| &p.topics)
            .filter_map(|t| t.name.as_deref().map(|n| format!("topic:{n}")));
        let content = self
            .content_policy
            .iter()
            .flat_map(|p| &p.filters)
            .filter_map(|f| f.kind.as_deref().map(|k| format!("content:{k}")));
        let words = self
            .word_policy
            .iter()
            .flat_map(|p| &p.custom_words)
            .filter_map(|w| w.matched.as_deref().map(|m| format!("word:{m}")));
        let managed = self
            .word_policy
            .iter()
            .flat_map(|p| &p.managed_word_lists)
            .filter_map(|w| w.kind.as_deref().map(|k| format!("managed_word:{k}")));
        let pii = self
            .sensitive_information_policy
            .iter()
            .flat_map(|p| &p.pii_entities)
            .filter_map(|e| e.kind.as_deref().map(|k| format!("pii:{k}")));
        let regexes = self
            .sensitive_information_policy
            .iter()
            .flat_map(|p| &p.regexes)
            .filter_map(|r| r.name.as_deref().map(|n| format!("regex:{n}")));
        let grounding = self
            .contextual_grounding_policy
            .iter()
            .flat_map(|p| &p.filters)
            .filter_map(|f| f.kind.as_deref().map(|k| format!("grounding:{k}")));

        topics
            .chain(content)
            .chain(words)
            .chain(managed)
            .chain(pii)
            .chain(regexes)
            .chain(grounding)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePayload {
    pub trace_id: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_code: Option<i64>,
}

/// Flattens a raw model response body into text.
///
/// Accepts a plain string, a list of `{"text": ...}` blocks, or anything else
/// (serialized as JSON).
pub fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                Some(content.to_string())
            } else {
                Some(text.join(""))
            }
        }
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_text_variants() {
        assert_eq!(content_text(&json!("hi")), Some("hi".into()));
        assert_eq!(
            content_text(&json!([{"text": "a"}, {"text": "b"}])),
            Some("ab".into())
        );
        assert_eq!(content_text(&json!({"k": 1})), Some("{\"k\":1}".into()));
        assert_eq!(content_text(&Value::Null), None);
    }

    #[test]
    fn test_usage_prefers_metadata() {
        let output: ModelInvocationOutput = serde_json::from_value(json!({
            "metadata": {"usage": {"inputTokens": 10, "outputTokens": 4}},
            "rawResponse": {"usage": {"inputTokens": 99}}
        }))
        .unwrap();

        let usage = output.usage().unwrap();
        assert_eq!(usage.input_tokens, Some(10));
        assert_eq!(usage.output_tokens, Some(4));
    }

    #[test]
    fn test_action_group_tool_name() {
        let by_function: ActionGroupInput = serde_json::from_value(json!({
            "actionGroupName": "weather", "function": "get_forecast"
        }))
        .unwrap();
        assert_eq!(by_function.tool_name(), "weather.get_forecast");

        let by_path: ActionGroupInput = serde_json::from_value(json!({
            "actionGroupName": "orders", "apiPath": "/orders/{id}", "verb": "get"
        }))
        .unwrap();
        assert_eq!(by_path.tool_name(), "orders.GET /orders/{id}");
    }

    #[test]
    fn test_assessment_rule_ids() {
        let assessment: Assessment = serde_json::from_value(json!({
            "topicPolicy": {"topics": [{"name": "investment", "action": "BLOCKED"}]},
            "contentPolicy": {"filters": [{"type": "VIOLENCE", "confidence": "HIGH"}]},
            "sensitiveInformationPolicy": {
                "piiEntities": [{"type": "EMAIL"}],
                "regexes": [{"name": "account-number"}]
            }
        }))
        .unwrap();

        let ids: Vec<String> = assessment.rule_ids().collect();
        assert_eq!(
            ids,
            vec![
                "topic:investment",
                "content:VIOLENCE",
                "pii:EMAIL",
                "regex:account-number"
            ]
        );
    }
}
