//! Tool definitions, executor registry and output sanitization.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::transcript::ToolCall;

/// JSON-Schema subset needed for tool parameter definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JsonSchema {
    Boolean,
    String,
    Number,
    Array {
        items: Box<JsonSchema>,
    },
    Object {
        properties: BTreeMap<String, JsonSchema>,
        #[serde(skip_serializing_if = "Option::is_none")]
        required: Option<Vec<String>>,
        #[serde(
            rename = "additionalProperties",
            skip_serializing_if = "Option::is_none"
        )]
        additional_properties: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: JsonSchema,
}

impl ToolDefinition {
    /// The schema as a plain JSON value. Adapters clone this per round so a
    /// provider can never mutate the registered definition.
    pub fn input_schema_value(&self) -> JsonValue {
        serde_json::to_value(&self.input_schema).unwrap_or(JsonValue::Null)
    }
}

/// Host-registered executor for a single tool or a name prefix.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Returns the tool-result string. Failures are encoded as
    /// `"error: ..."` strings, never as exceptions; executors enforce their
    /// own per-call timeouts.
    async fn execute(&self, call: &ToolCall) -> String;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GmailSearchOutput {
    /// Rendered result for the model.
    pub content: String,
    /// Message ids surfaced by this search; the ROWYS guard only allows
    /// reads of these within the same turn.
    pub message_ids: Vec<String>,
}

/// Gmail is special-cased so the loop can apply the
/// read-only-what-you-searched policy between search and read.
#[async_trait]
pub trait GmailExecutor: Send + Sync {
    async fn search(&self, query: &str) -> Result<GmailSearchOutput>;
    async fn read(&self, message_id: &str) -> Result<String>;
}

#[derive(Default, Clone)]
pub struct ToolRouter {
    exact: HashMap<String, Arc<dyn ToolExecutor>>,
    prefixes: Vec<(String, Arc<dyn ToolExecutor>)>,
    gmail: Option<Arc<dyn GmailExecutor>>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, executor: Arc<dyn ToolExecutor>) {
        self.exact.insert(name.to_string(), executor);
    }

    /// Route every tool whose name starts with `prefix` (used for the
    /// `gtasks_` and `advisory_` executor families).
    pub fn register_prefix(&mut self, prefix: &str, executor: Arc<dyn ToolExecutor>) {
        self.prefixes.push((prefix.to_string(), executor));
    }

    pub fn set_gmail(&mut self, executor: Arc<dyn GmailExecutor>) {
        self.gmail = Some(executor);
    }

    pub fn gmail(&self) -> Option<&Arc<dyn GmailExecutor>> {
        self.gmail.as_ref()
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn ToolExecutor>> {
        if let Some(executor) = self.exact.get(name) {
            return Some(executor);
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix))
            .map(|(_, executor)| executor)
    }
}

#[allow(clippy::unwrap_used)]
static CREDENTIAL_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(authorization|x-api-key)\s*[:=]\s*\S+").unwrap());

#[allow(clippy::unwrap_used)]
static LONG_BASE64_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/=]{257,}").unwrap());

/// Strip credentials and oversized blobs from executor output before it
/// enters the transcript. Base64 runs longer than 256 chars are elided.
pub fn sanitize_tool_output(raw: &str) -> String {
    let mut out = CREDENTIAL_HEADER
        .replace_all(raw, "$1: [redacted]")
        .to_string();
    if LONG_BASE64_RUN.is_match(&out) {
        out = LONG_BASE64_RUN
            .replace_all(&out, "[binary payload elided]")
            .to_string();
    }
    out
}
