use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use troupe_core::{Message, TroupeResult};
use uuid::Uuid;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call identifier.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as parsed JSON.
    pub arguments: Value,
}

/// One inference call.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Model identifier to invoke.
    pub model: String,
    /// System prompt, when any.
    pub system: Option<String>,
    /// Conversation messages, oldest first.
    pub messages: Vec<Message>,
    /// JSON schema to constrain the output to, when structured output is
    /// wanted.
    pub schema: Option<Value>,
    /// Output token ceiling.
    pub max_tokens: u32,
    /// Agent label the call is attributed to in the usage log (a worker
    /// name, or `"router"` for dispatch decisions).
    pub agent: String,
    /// Conversation thread for usage attribution, when known.
    pub thread_id: Option<Uuid>,
}

/// What the model produced.
#[derive(Debug, Clone)]
pub enum ProviderOutput {
    /// Plain text.
    Text(String),
    /// Schema-constrained JSON, already parsed.
    Structured(Value),
    /// Tool invocations.
    ToolCalls(Vec<ToolCall>),
}

/// A completed inference call with its token usage.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// The model's output.
    pub output: ProviderOutput,
    /// Input tokens consumed.
    pub tokens_in: u64,
    /// Output tokens produced.
    pub tokens_out: u64,
}

impl ProviderReply {
    /// The output as text, when it is text.
    pub fn text(&self) -> Option<&str> {
        match &self.output {
            ProviderOutput::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The output as structured JSON, when it is structured.
    pub fn structured(&self) -> Option<&Value> {
        match &self.output {
            ProviderOutput::Structured(value) => Some(value),
            _ => None,
        }
    }
}

/// The seam every model call goes through.
///
/// To add a new provider: implement this trait and wire it into the
/// gateway's startup.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Performs one inference call.
    async fn invoke(&self, request: &InvokeRequest) -> TroupeResult<ProviderReply>;

    /// Stable name used for breaker keys and logs.
    fn name(&self) -> &str;
}
