//! Structured-prompt operations over a [`ChatBackend`]: `ask` passes through,
//! `get` enforces strict JSON with schema validation, retry, and N-of-M
//! confirmation, `refine` iterates on the model's own answer.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use foreman_core::ids::ChatId;
use foreman_core::ChatBackend;
use foreman_core::ChatMessage;

use crate::error::GatewayError;

const MAX_ATTEMPTS: u32 = 5;

const JSON_INSTRUCTION: &str = "Reply with exactly one JSON document and nothing else. \
No prose before or after it.";

const REASK_INVALID_JSON: &str = "That reply was not valid JSON. Reply with valid JSON only.";

/// Gateway over one conversation.
pub struct ChatClient {
    backend: Arc<dyn ChatBackend>,
}

impl ChatClient {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    pub fn id(&self) -> ChatId {
        self.backend.id()
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    /// Free-form pass-through.
    pub async fn ask(&self, prompt: &str) -> Result<ChatMessage, GatewayError> {
        Ok(self.backend.ask(prompt).await?)
    }

    /// Structured output: ask until a reply parses as JSON and (when a schema
    /// is given) validates, up to 5 attempts per answer; collect answers until
    /// `confirm` of them are identical, within an `out_of` budget.
    #[instrument(skip(self, prompt, schema), fields(chat_id = %self.backend.id()))]
    pub async fn get(
        &self,
        prompt: &str,
        schema: Option<&Value>,
        confirm: u32,
        out_of: u32,
    ) -> Result<Map<String, Value>, GatewayError> {
        let validator = schema
            .map(|s| jsonschema::validator_for(s).map_err(|e| GatewayError::Schema(e.to_string())))
            .transpose()?;
        let wrapper = build_wrapper(prompt, schema);

        let mut answers: Vec<Map<String, Value>> = Vec::new();
        for _round in 0..out_of {
            let answer = self.get_one(&wrapper, validator.as_ref()).await?;
            answers.push(answer);
            if let Some(agreed) = consensus(&answers, confirm) {
                return Ok(agreed);
            }
        }
        Err(GatewayError::NoConfirmation { confirm, out_of })
    }

    /// One validated answer, retrying malformed replies with corrective
    /// prompts.
    async fn get_one(
        &self,
        wrapper: &str,
        validator: Option<&jsonschema::Validator>,
    ) -> Result<Map<String, Value>, GatewayError> {
        let mut prompt = wrapper.to_owned();
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            let reply = self.backend.ask(&prompt).await?;
            let stripped = strip_fence(&reply.content);

            let value: Value = match serde_json::from_str(stripped) {
                Ok(value) => value,
                Err(e) => {
                    warn!(attempt, error = %e, "reply is not JSON, re-asking");
                    last_error = e.to_string();
                    prompt = REASK_INVALID_JSON.to_owned();
                    continue;
                }
            };

            if let Some(validator) = validator {
                let errors: Vec<String> = validator
                    .iter_errors(&value)
                    .map(|e| format!("{} at {}", e, e.instance_path))
                    .collect();
                if !errors.is_empty() {
                    warn!(attempt, errors = errors.len(), "reply failed schema validation, re-asking");
                    last_error = errors.join("; ");
                    prompt = format!(
                        "That reply did not match the required schema:\n{}\nReply again with \
                         valid JSON matching the schema.",
                        errors.join("\n")
                    );
                    continue;
                }
            }

            match value {
                Value::Object(map) => {
                    debug!(attempt, "structured reply accepted");
                    return Ok(map);
                }
                other => {
                    last_error = format!("expected a JSON object, got: {other}");
                    prompt = format!("{REASK_INVALID_JSON} The reply must be a JSON object.");
                }
            }
        }

        Err(GatewayError::InvalidResponse {
            attempts: MAX_ATTEMPTS,
            last_error,
        })
    }

    /// Iterative self-critique: run `get` `times` times, feeding each answer
    /// back for improvement, and return the last one.
    pub async fn refine(
        &self,
        prompt: &str,
        schema: Option<&Value>,
        times: u32,
    ) -> Result<Map<String, Value>, GatewayError> {
        let mut answer = self.get(prompt, schema, 1, 1).await?;
        for _ in 1..times {
            let framed = format!(
                "Here is your previous answer:\n{}\n\nImprove it, then answer again.\n\n{}",
                Value::Object(answer.clone()),
                prompt
            );
            answer = self.get(&framed, schema, 1, 1).await?;
        }
        Ok(answer)
    }
}

/// The wrapper message for one `get`: instruction block, then schema, then
/// the caller's prompt.
fn build_wrapper(prompt: &str, schema: Option<&Value>) -> String {
    match schema {
        Some(schema) => format!(
            "{JSON_INSTRUCTION}\n\nThe reply must match this JSON schema:\n{schema}\n\n{prompt}"
        ),
        None => format!("{JSON_INSTRUCTION}\n\n{prompt}"),
    }
}

/// Strip exactly one leading ```json fence and one trailing ``` fence.
/// Deeper or alternate fences pass through untouched.
fn strip_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let without_lead = trimmed.strip_prefix("```json").unwrap_or(trimmed);
    let without_trail = without_lead.strip_suffix("```").unwrap_or(without_lead);
    without_trail.trim()
}

/// The first answer that has accumulated `confirm` identical copies.
fn consensus(answers: &[Map<String, Value>], confirm: u32) -> Option<Map<String, Value>> {
    for answer in answers {
        let copies = answers.iter().filter(|a| *a == answer).count();
        if copies as u32 >= confirm {
            return Some(answer.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": { "title": { "type": "string" } },
            "required": ["title"],
            "additionalProperties": false,
        })
    }

    #[test]
    fn strip_fence_variants() {
        assert_eq!(strip_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fence("  ```json\n{}\n```  "), "{}");
        // Only one layer comes off.
        assert_eq!(
            strip_fence("```json\n```json\n{}\n```\n```"),
            "```json\n{}"
        );
    }

    #[test]
    fn wrapper_contains_instruction_schema_and_prompt() {
        let wrapper = build_wrapper("Write a title", Some(&schema()));
        let instruction_pos = wrapper.find("Reply with exactly one JSON").unwrap();
        let schema_pos = wrapper.find("JSON schema").unwrap();
        let prompt_pos = wrapper.find("Write a title").unwrap();
        assert!(instruction_pos < schema_pos && schema_pos < prompt_pos);
    }

    #[tokio::test]
    async fn get_parses_valid_reply() {
        let backend = MockBackend::with_replies(vec![r#"{"title": "Hello"}"#.into()]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client
            .get("write", Some(&schema()), 1, 1)
            .await
            .unwrap();
        assert_eq!(answer["title"], "Hello");
    }

    #[tokio::test]
    async fn get_strips_code_fence() {
        let backend =
            MockBackend::with_replies(vec!["```json\n{\"title\": \"Fenced\"}\n```".into()]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client.get("write", Some(&schema()), 1, 1).await.unwrap();
        assert_eq!(answer["title"], "Fenced");
    }

    #[tokio::test]
    async fn get_retries_malformed_json() {
        let backend = MockBackend::with_replies(vec![
            "not json at all".into(),
            r#"{"title": "Recovered"}"#.into(),
        ]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client.get("write", Some(&schema()), 1, 1).await.unwrap();
        assert_eq!(answer["title"], "Recovered");

        // The re-ask carried the corrective instruction.
        let messages = client.backend().messages();
        assert!(messages
            .iter()
            .any(|m| m.content.contains("valid JSON only")));
    }

    #[tokio::test]
    async fn get_retries_schema_violation_with_errors_inlined() {
        let backend = MockBackend::with_replies(vec![
            r#"{"title": 42}"#.into(),
            r#"{"title": "Fixed"}"#.into(),
        ]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client.get("write", Some(&schema()), 1, 1).await.unwrap();
        assert_eq!(answer["title"], "Fixed");

        let messages = client.backend().messages();
        assert!(messages
            .iter()
            .any(|m| m.content.contains("did not match the required schema")));
    }

    #[tokio::test]
    async fn get_gives_up_after_five_attempts() {
        let backend = MockBackend::with_replies(vec![
            "bad".into(),
            "bad".into(),
            "bad".into(),
            "bad".into(),
            "bad".into(),
        ]);
        let client = ChatClient::new(Arc::new(backend));
        let err = client.get("write", Some(&schema()), 1, 1).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InvalidResponse { attempts: 5, .. }
        ));
    }

    #[tokio::test]
    async fn confirm_two_of_three_succeeds() {
        let backend = MockBackend::with_replies(vec![
            r#"{"title": "A"}"#.into(),
            r#"{"title": "B"}"#.into(),
            r#"{"title": "A"}"#.into(),
        ]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client.get("write", Some(&schema()), 2, 3).await.unwrap();
        assert_eq!(answer["title"], "A");
    }

    #[tokio::test]
    async fn confirm_short_circuits_once_reached() {
        let backend = MockBackend::with_replies(vec![
            r#"{"title": "A"}"#.into(),
            r#"{"title": "A"}"#.into(),
            r#"{"title": "unused"}"#.into(),
        ]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client.get("write", Some(&schema()), 2, 3).await.unwrap();
        assert_eq!(answer["title"], "A");
        assert_eq!(client.backend().messages().len() / 2, 2, "third ask must not happen");
    }

    #[tokio::test]
    async fn no_consensus_errors() {
        let backend = MockBackend::with_replies(vec![
            r#"{"title": "A"}"#.into(),
            r#"{"title": "B"}"#.into(),
            r#"{"title": "C"}"#.into(),
        ]);
        let client = ChatClient::new(Arc::new(backend));
        let err = client.get("write", Some(&schema()), 2, 3).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::NoConfirmation {
                confirm: 2,
                out_of: 3
            }
        ));
    }

    #[tokio::test]
    async fn get_without_schema_accepts_any_object() {
        let backend = MockBackend::with_replies(vec![r#"{"anything": [1, 2]}"#.into()]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client.get("write", None, 1, 1).await.unwrap();
        assert_eq!(answer["anything"], json!([1, 2]));
    }

    #[tokio::test]
    async fn non_object_json_is_retried() {
        let backend = MockBackend::with_replies(vec![
            "[1, 2, 3]".into(),
            r#"{"ok": true}"#.into(),
        ]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client.get("write", None, 1, 1).await.unwrap();
        assert_eq!(answer["ok"], true);
    }

    #[tokio::test]
    async fn refine_feeds_answer_back() {
        let backend = MockBackend::with_replies(vec![
            r#"{"title": "draft"}"#.into(),
            r#"{"title": "polished"}"#.into(),
        ]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client.refine("write", Some(&schema()), 2).await.unwrap();
        assert_eq!(answer["title"], "polished");

        let messages = client.backend().messages();
        let second_ask = messages
            .iter()
            .filter(|m| m.role == foreman_core::Role::User)
            .nth(1)
            .unwrap();
        assert!(second_ask.content.contains("previous answer"));
        assert!(second_ask.content.contains("draft"));
    }

    #[tokio::test]
    async fn refine_once_is_plain_get() {
        let backend = MockBackend::with_replies(vec![r#"{"title": "only"}"#.into()]);
        let client = ChatClient::new(Arc::new(backend));
        let answer = client.refine("write", Some(&schema()), 1).await.unwrap();
        assert_eq!(answer["title"], "only");
    }

    #[tokio::test]
    async fn backend_error_propagates() {
        let backend = MockBackend::with_replies(vec![]);
        let client = ChatClient::new(Arc::new(backend));
        let err = client.get("write", None, 1, 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend(_)));
    }

    #[tokio::test]
    async fn invalid_schema_is_reported() {
        let backend = MockBackend::with_replies(vec![r#"{}"#.into()]);
        let client = ChatClient::new(Arc::new(backend));
        let bad_schema = json!({"type": "not-a-type"});
        let err = client
            .get("write", Some(&bad_schema), 1, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Schema(_)));
    }
}
