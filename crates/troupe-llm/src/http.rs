use crate::provider::{InferenceProvider, InvokeRequest, ProviderOutput, ProviderReply, ToolCall};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use troupe_core::{ProviderSettings, Role, TroupeError, TroupeResult};

/// OpenAI-compatible chat-completions client.
///
/// Works with OpenAI and any other provider that implements the chat
/// completions API. HTTP failures are classified into typed errors so the
/// retry layer can tell transient from permanent.
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpProvider {
    /// Creates a client for one endpoint with a hard per-call timeout.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout_secs: u64,
    ) -> TroupeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TroupeError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            http,
        })
    }

    /// Client for the primary endpoint in the provider settings.
    pub fn primary(settings: &ProviderSettings) -> TroupeResult<Self> {
        Self::new(
            "primary",
            settings.base_url.clone(),
            settings.api_key.clone(),
            settings.timeout_secs,
        )
    }

    /// Client for the secondary endpoint, when one is configured.
    pub fn secondary(settings: &ProviderSettings) -> TroupeResult<Option<Self>> {
        match &settings.secondary_base_url {
            Some(url) => {
                let key = settings.secondary_api_key.clone().unwrap_or_default();
                Ok(Some(Self::new(
                    "secondary",
                    url.clone(),
                    key,
                    settings.timeout_secs,
                )?))
            }
            None => Ok(None),
        }
    }

    fn build_messages(&self, request: &InvokeRequest) -> Vec<Value> {
        let mut api_messages: Vec<Value> = Vec::new();

        if let Some(ref system) = request.system {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": system,
            }));
        }

        for m in &request.messages {
            if m.role == Role::System {
                continue;
            }
            api_messages.push(serde_json::json!({
                "role": match m.role {
                    Role::User | Role::Tool => "user",
                    Role::Assistant => "assistant",
                    Role::System => continue,
                },
                "content": m.content,
            }));
        }

        api_messages
    }
}

/// Maps an HTTP status and body into the typed error space.
///
/// 429 and 5xx keep the status code in the message so the retry
/// classifier recognizes them as transient.
fn classify_status(status: reqwest::StatusCode, body: &str) -> TroupeError {
    let lower = body.to_lowercase();
    if lower.contains("content_policy")
        || lower.contains("content policy")
        || lower.contains("content_filter")
    {
        return TroupeError::ContentPolicy(truncate(body));
    }
    match status.as_u16() {
        400 => TroupeError::BadRequest(truncate(body)),
        401 | 403 => TroupeError::Auth(format!("{status}: {}", truncate(body))),
        _ => TroupeError::Provider(format!("{status}: {}", truncate(body))),
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

fn parse_reply(body: &Value, structured: bool) -> TroupeResult<ProviderReply> {
    let tokens_in = body["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
    let tokens_out = body["usage"]["completion_tokens"].as_u64().unwrap_or(0);

    let message = &body["choices"][0]["message"];
    let content = message["content"].as_str().unwrap_or_default();

    let output = if let Some(calls_json) = message["tool_calls"].as_array() {
        let tool_calls: Vec<ToolCall> = calls_json
            .iter()
            .filter_map(|tc| {
                let id = tc["id"].as_str()?.to_string();
                let name = tc["function"]["name"].as_str()?.to_string();
                let arguments: Value =
                    serde_json::from_str(tc["function"]["arguments"].as_str()?).unwrap_or_default();
                Some(ToolCall {
                    id,
                    name,
                    arguments,
                })
            })
            .collect();
        ProviderOutput::ToolCalls(tool_calls)
    } else if structured {
        let value: Value = serde_json::from_str(content).map_err(|e| {
            TroupeError::Decision(format!("structured output was not valid JSON: {e}"))
        })?;
        ProviderOutput::Structured(value)
    } else {
        ProviderOutput::Text(content.to_string())
    };

    Ok(ProviderReply {
        output,
        tokens_in,
        tokens_out,
    })
}

#[async_trait]
impl InferenceProvider for HttpProvider {
    async fn invoke(&self, request: &InvokeRequest) -> TroupeResult<ProviderReply> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": self.build_messages(request),
        });
        if let Some(ref schema) = request.schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "response",
                    "schema": schema,
                    "strict": true,
                },
            });
        }

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TroupeError::Provider("request timed out".to_string())
                } else {
                    TroupeError::Provider(e.to_string())
                }
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| TroupeError::Provider(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: Value = serde_json::from_str(&text)?;
        parse_reply(&parsed, request.schema.is_some())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
