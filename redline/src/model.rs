//! Model provider client: chat completion transport, JSON extraction, and
//! failure classification.
//!
//! [`analyze`] is the single entry point the worker uses. It owns the
//! classification contract: refusals, truncation, empty responses, and
//! unparseable output each map to a distinct error class so the retry policy
//! can treat them correctly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::prompts;
use crate::tiers::ResolvedTier;

/// One chat completion request. `model` is always whitelist-checked by
/// construction, since the only producer is a [`ResolvedTier`].
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: crate::tiers::AllowedModel,
    pub system: String,
    pub user: String,
    pub max_output_tokens: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Raw provider response, before JSON extraction.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub finish_reason: Option<String>,
    pub refusal: Option<String>,
    pub usage: Usage,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion>;
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let messages = vec![
            WireMessage {
                role: "system",
                content: &request.system,
            },
            WireMessage {
                role: "user",
                content: &request.user,
            },
        ];

        let mut body = json!({
            "model": request.model.as_str(),
            "messages": messages,
            "response_format": { "type": "json_object" },
        });

        // Reasoning models reject custom temperatures and use a different
        // name for the output cap.
        if request.model.is_reasoning() {
            body["max_completion_tokens"] = json!(request.max_output_tokens);
            body["temperature"] = json!(1);
        } else {
            body["max_tokens"] = json!(request.max_output_tokens);
            body["temperature"] = json!(0.1);
        }
        body
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&self.request_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => Error::configuration(format!(
                    "provider rejected credentials (status {status})"
                )),
                408 => Error::timeout(format!("provider timeout (status {status})")),
                429 | 500..=599 => {
                    Error::external(format!("provider returned {status}: {body}"))
                }
                _ => Error::external(format!("unexpected provider status {status}: {body}")),
            });
        }

        let wire: WireResponse = response.json().await?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::external("provider response contained no choices"))?;

        Ok(ChatCompletion {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
            refusal: choice.message.refusal,
            usage: wire.usage.unwrap_or_default(),
        })
    }
}

/// Extract the outermost JSON object from model output.
///
/// Tries the span between the first `{` and the last `}` first, then falls
/// back to stripping a markdown code fence.
fn extract_json(content: &str) -> Option<Value> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        if let Ok(value) = serde_json::from_str::<Value>(&content[start..=end]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    let fenced = content
        .trim()
        .strip_prefix("```json")
        .or_else(|| content.trim().strip_prefix("```"))?;
    let fenced = fenced.strip_suffix("```").unwrap_or(fenced);
    serde_json::from_str::<Value>(fenced.trim())
        .ok()
        .filter(|v| v.is_object())
}

/// Run one analysis call and return the structured summary.
///
/// The `_debug` key on the result carries model and token metadata. If the
/// model itself emitted a `_debug` object, its unrelated keys are preserved
/// but ours win on conflict.
pub async fn analyze(
    client: &dyn ModelClient,
    resolved: &ResolvedTier,
    document_text: &str,
) -> Result<Value> {
    let request = ChatRequest {
        model: resolved.model(),
        system: prompts::system_prompt(resolved.tier()).to_string(),
        user: prompts::user_prompt(document_text),
        max_output_tokens: resolved.token_limits().output,
        timeout: resolved.tier().provider_timeout(),
    };

    let completion = client.complete(&request).await?;

    if let Some(refusal) = completion.refusal.filter(|r| !r.is_empty()) {
        tracing::warn!(model = request.model.as_str(), refusal = %refusal, "model refused");
        return Err(Error::ModelRefused {
            model: request.model.as_str().to_string(),
        });
    }

    if completion.finish_reason.as_deref() == Some("length") {
        return Err(Error::OutputTooLarge);
    }

    if completion.content.trim().is_empty() {
        return Err(Error::external("provider returned an empty completion"));
    }

    let mut summary = extract_json(&completion.content).ok_or_else(|| Error::MalformedResult {
        model: request.model.as_str().to_string(),
        raw: completion.content.clone(),
    })?;

    let mut debug = match summary.get("_debug") {
        Some(Value::Object(existing)) => existing.clone(),
        _ => Map::new(),
    };
    debug.insert("model_used".into(), json!(request.model.as_str()));
    debug.insert("prompt_version".into(), json!(resolved.prompt_version()));
    debug.insert("prompt_tokens".into(), json!(completion.usage.prompt_tokens));
    debug.insert(
        "completion_tokens".into(),
        json!(completion.usage.completion_tokens),
    );
    debug.insert(
        "analyzed_at".into(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    summary["_debug"] = Value::Object(debug);

    Ok(summary)
}

/// Scripted client for tests. Responses are consumed in queue order; an
/// exhausted queue fails the call as an external error.
pub struct MockModelClient {
    responses: parking_lot::Mutex<std::collections::VecDeque<Result<ChatCompletion>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockModelClient {
    pub fn new() -> Self {
        Self {
            responses: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn push_content(&self, content: impl Into<String>) {
        self.responses.lock().push_back(Ok(ChatCompletion {
            content: content.into(),
            finish_reason: Some("stop".into()),
            refusal: None,
            usage: Usage::default(),
        }));
    }

    pub fn push_completion(&self, completion: ChatCompletion) {
        self.responses.lock().push_back(Ok(completion));
    }

    pub fn push_error(&self, error: Error) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for MockModelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn complete(&self, _request: &ChatRequest) -> Result<ChatCompletion> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::external("mock response queue exhausted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::{StaticConfigSource, TierResolver};
    use crate::types::Tier;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn resolved(tier: Tier) -> ResolvedTier {
        TierResolver::new(
            Arc::new(StaticConfigSource::default()),
            Duration::from_secs(60),
        )
        .resolve(tier)
        .await
        .unwrap()
    }

    #[test]
    fn extract_json_handles_surrounding_prose() {
        let content = r#"Here is the analysis: {"risk_level": "high"} hope that helps"#;
        let value = extract_json(content).unwrap();
        assert_eq!(value["risk_level"], "high");
    }

    #[test]
    fn extract_json_handles_code_fences() {
        let content = "```json\n{\"risk_level\": \"low\"}\n```";
        let value = extract_json(content).unwrap();
        assert_eq!(value["risk_level"], "low");
    }

    #[test]
    fn extract_json_rejects_non_objects() {
        assert!(extract_json("[1, 2, 3]").is_none());
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{broken").is_none());
    }

    #[tokio::test]
    async fn analyze_attaches_debug_metadata() {
        let client = MockModelClient::new();
        client.push_content(r#"{"risk_level": "low", "summary": "fine"}"#);
        let resolved = resolved(Tier::Basic).await;

        let summary = analyze(&client, &resolved, "some contract").await.unwrap();
        assert_eq!(summary["risk_level"], "low");
        assert_eq!(summary["_debug"]["model_used"], "gpt-4o-mini");
        assert_eq!(summary["_debug"]["prompt_version"], "v2");
    }

    #[tokio::test]
    async fn analyze_preserves_model_debug_keys_but_ours_win() {
        let client = MockModelClient::new();
        client.push_content(
            r#"{"risk_level": "low", "_debug": {"model_used": "lying-model", "note": "kept"}}"#,
        );
        let resolved = resolved(Tier::Basic).await;

        let summary = analyze(&client, &resolved, "text").await.unwrap();
        assert_eq!(summary["_debug"]["model_used"], "gpt-4o-mini");
        assert_eq!(summary["_debug"]["note"], "kept");
    }

    #[tokio::test]
    async fn refusal_maps_to_model_refused() {
        let client = MockModelClient::new();
        client.push_completion(ChatCompletion {
            content: String::new(),
            finish_reason: Some("stop".into()),
            refusal: Some("I cannot analyze this".into()),
            usage: Usage::default(),
        });
        let resolved = resolved(Tier::Basic).await;

        let err = analyze(&client, &resolved, "text").await.unwrap_err();
        assert!(matches!(err, Error::ModelRefused { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn length_finish_maps_to_output_too_large() {
        let client = MockModelClient::new();
        client.push_completion(ChatCompletion {
            content: r#"{"partial"#.into(),
            finish_reason: Some("length".into()),
            refusal: None,
            usage: Usage::default(),
        });
        let resolved = resolved(Tier::Basic).await;

        let err = analyze(&client, &resolved, "text").await.unwrap_err();
        assert!(matches!(err, Error::OutputTooLarge));
    }

    #[tokio::test]
    async fn garbage_output_maps_to_malformed_result_with_raw() {
        let client = MockModelClient::new();
        client.push_content("the contract seems fine to me");
        let resolved = resolved(Tier::Basic).await;

        let err = analyze(&client, &resolved, "text").await.unwrap_err();
        match err {
            Error::MalformedResult { model, raw } => {
                assert_eq!(model, "gpt-4o-mini");
                assert_eq!(raw, "the contract seems fine to me");
            }
            other => panic!("expected MalformedResult, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_completion_is_retryable() {
        let client = MockModelClient::new();
        client.push_content("   ");
        let resolved = resolved(Tier::Basic).await;

        let err = analyze(&client, &resolved, "text").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn openai_client_sends_expected_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "response_format": { "type": "json_object" },
                "max_tokens": 2500,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "content": "{\"risk_level\": \"low\"}" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 12, "completion_tokens": 7 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(format!("{}/v1", server.uri()), "test-key");
        let resolved = resolved(Tier::Basic).await;
        let summary = analyze(&client, &resolved, "contract text").await.unwrap();
        assert_eq!(summary["risk_level"], "low");
        assert_eq!(summary["_debug"]["prompt_tokens"], 12);
    }

    #[tokio::test]
    async fn reasoning_model_uses_max_completion_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "model": "gpt-5",
                "max_completion_tokens": 10000,
                "temperature": 1,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "content": "{\"risk_level\": \"medium\"}" },
                    "finish_reason": "stop"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(format!("{}/v1", server.uri()), "test-key");
        let resolved = resolved(Tier::Premium).await;
        analyze(&client, &resolved, "contract text").await.unwrap();
    }

    #[tokio::test]
    async fn provider_5xx_is_retryable_external_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(format!("{}/v1", server.uri()), "test-key");
        let resolved = resolved(Tier::Basic).await;
        let err = analyze(&client, &resolved, "text").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn provider_401_is_configuration_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(format!("{}/v1", server.uri()), "bad-key");
        let resolved = resolved(Tier::Basic).await;
        let err = analyze(&client, &resolved, "text").await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!err.is_retryable());
    }
}
