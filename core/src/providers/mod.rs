//! LLM provider registry and the wire-agnostic model client.
//!
//! Three built-in providers wrap two native message shapes: Anthropic
//! content blocks and OpenAI-style chat completions. Ollama reuses the
//! OpenAI adapter with a custom base URL, which is why its capability-cache
//! key includes the base URL.

mod anthropic;
mod openai;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::error::DomainOsErr;
use crate::error::Result;
use crate::tools::ToolDefinition;
use crate::transcript::PlainMessage;
use crate::transcript::ToolUseResponse;
use crate::transcript::TranscriptItem;

pub const OLLAMA_PROVIDER_ID: &str = "ollama";

/// How many transport-level retries a single request gets on 429/5xx.
pub(crate) const REQUEST_MAX_RETRIES: u64 = 4;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WireApi {
    AnthropicMessages,
    OpenAiChat,
}

/// Serializable representation of a provider definition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProviderInfo {
    /// Registry id, e.g. `anthropic`.
    pub name: String,
    pub base_url: String,
    /// Environment variable holding the API key; optional for local
    /// providers.
    pub env_key: Option<String>,
    pub wire_api: WireApi,
}

impl ProviderInfo {
    pub fn api_key(&self) -> Option<String> {
        self.env_key
            .as_ref()
            .and_then(|key| std::env::var(key).ok())
            .filter(|v| !v.is_empty())
    }
}

/// Built-in provider table, overridable through [`Settings`] base URLs.
pub fn built_in_providers(settings: &Settings) -> HashMap<String, ProviderInfo> {
    let base = |id: &str, default: &str| {
        settings
            .provider_base_urls
            .get(id)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };
    [
        (
            "anthropic",
            ProviderInfo {
                name: "anthropic".to_string(),
                base_url: base("anthropic", "https://api.anthropic.com"),
                env_key: Some("ANTHROPIC_API_KEY".to_string()),
                wire_api: WireApi::AnthropicMessages,
            },
        ),
        (
            "openai",
            ProviderInfo {
                name: "openai".to_string(),
                base_url: base("openai", "https://api.openai.com/v1"),
                env_key: Some("OPENAI_API_KEY".to_string()),
                wire_api: WireApi::OpenAiChat,
            },
        ),
        (
            OLLAMA_PROVIDER_ID,
            ProviderInfo {
                name: OLLAMA_PROVIDER_ID.to_string(),
                base_url: base(OLLAMA_PROVIDER_ID, "http://localhost:11434/v1"),
                env_key: None,
                wire_api: WireApi::OpenAiChat,
            },
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// What the process has observed about tool support for one
/// (provider, model [, base URL]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCapability {
    Supported,
    /// Tools were offered but the model never called one.
    NotObserved,
    /// The provider rejected the tools field outright.
    NotSupported,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityKey {
    pub provider: String,
    pub model: String,
    /// Set for Ollama so separate local installations never share state.
    pub base_url: Option<String>,
}

/// Process-local capability cache. Single-writer by assumption; the mutex
/// exists for interior mutability, and cross-turn ordering need not be
/// deterministic as long as each turn's view is consistent.
#[derive(Default, Clone)]
pub struct CapabilityCache {
    capabilities: Arc<Mutex<HashMap<CapabilityKey, ToolCapability>>>,
    not_observed_counters: Arc<Mutex<HashMap<CapabilityKey, u32>>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CapabilityKey) -> ToolCapability {
        self.capabilities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .copied()
            .unwrap_or(ToolCapability::Unknown)
    }

    pub fn set(&self, key: &CapabilityKey, capability: ToolCapability) {
        self.capabilities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.clone(), capability);
        if capability == ToolCapability::Supported {
            self.not_observed_counters
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(key);
        }
    }

    /// Bump the idle counter; returns the new value.
    pub fn increment_not_observed(&self, key: &CapabilityKey) -> u32 {
        let mut counters = self
            .not_observed_counters
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let counter = counters.entry(key.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn reset_not_observed(&self, key: &CapabilityKey) {
        self.not_observed_counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }
}

/// Streaming text chunks from `chat`.
pub struct ChatStream {
    pub(crate) rx: mpsc::Receiver<Result<String>>,
}

impl Stream for ChatStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Wire-agnostic client for one (provider, model).
#[derive(Clone)]
pub struct ModelClient {
    pub provider: ProviderInfo,
    pub model: String,
    pub(crate) http: reqwest::Client,
    pub capabilities: CapabilityCache,
}

impl ModelClient {
    pub fn new(provider: ProviderInfo, model: &str, capabilities: CapabilityCache) -> Self {
        Self {
            provider,
            model: model.to_string(),
            http: reqwest::Client::new(),
            capabilities,
        }
    }

    pub fn capability_key(&self) -> CapabilityKey {
        CapabilityKey {
            provider: self.provider.name.clone(),
            model: self.model.clone(),
            base_url: (self.provider.name == OLLAMA_PROVIDER_ID)
                .then(|| self.provider.base_url.clone()),
        }
    }

    /// Streaming text chat without tools.
    pub async fn chat(
        &self,
        system_prompt: &str,
        messages: &[PlainMessage],
    ) -> Result<ChatStream> {
        match self.provider.wire_api {
            WireApi::AnthropicMessages => anthropic::stream_chat(self, system_prompt, messages).await,
            WireApi::OpenAiChat => openai::stream_chat(self, system_prompt, messages).await,
        }
    }

    /// Non-streaming completion over flattened messages; the tool loop's
    /// fallback path.
    pub async fn chat_complete(
        &self,
        system_prompt: &str,
        messages: &[PlainMessage],
    ) -> Result<String> {
        match self.provider.wire_api {
            WireApi::AnthropicMessages => {
                anthropic::chat_complete(self, system_prompt, messages).await
            }
            WireApi::OpenAiChat => openai::chat_complete(self, system_prompt, messages).await,
        }
    }

    /// One tool-use round. Transport and API failures are errors; a
    /// tools-rejecting provider surfaces as
    /// [`DomainOsErr::ToolsNotSupported`].
    pub async fn create_tool_use_message(
        &self,
        system_prompt: &str,
        transcript: &[TranscriptItem],
        tools: &[ToolDefinition],
    ) -> Result<ToolUseResponse> {
        match self.provider.wire_api {
            WireApi::AnthropicMessages => {
                anthropic::create_tool_use_message(self, system_prompt, transcript, tools).await
            }
            WireApi::OpenAiChat => {
                openai::create_tool_use_message(self, system_prompt, transcript, tools).await
            }
        }
    }

    pub(crate) fn tools_not_supported(&self, message: &str) -> DomainOsErr {
        DomainOsErr::ToolsNotSupported(crate::error::ToolsNotSupportedError {
            provider: self.provider.name.clone(),
            model: self.model.clone(),
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ollama_capability_key_includes_base_url() {
        let settings = Settings::default();
        let providers = built_in_providers(&settings);
        let client = ModelClient::new(
            providers.get("ollama").unwrap().clone(),
            "llama3",
            CapabilityCache::new(),
        );
        assert_eq!(
            client.capability_key().base_url.as_deref(),
            Some("http://localhost:11434/v1")
        );

        let client = ModelClient::new(
            providers.get("anthropic").unwrap().clone(),
            "claude-sonnet-4-20250514",
            CapabilityCache::new(),
        );
        assert_eq!(client.capability_key().base_url, None);
    }

    #[test]
    fn settings_override_base_urls() {
        let settings = Settings {
            provider_base_urls: maplit::hashmap! {
                "ollama".to_string() => "http://10.0.0.2:11434/v1".to_string(),
            },
            ..Settings::default()
        };
        let providers = built_in_providers(&settings);
        assert_eq!(
            providers.get("ollama").unwrap().base_url,
            "http://10.0.0.2:11434/v1"
        );
    }

    #[test]
    fn capability_cache_defaults_to_unknown_and_tracks_counters() {
        let cache = CapabilityCache::new();
        let key = CapabilityKey {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            base_url: None,
        };
        assert_eq!(cache.get(&key), ToolCapability::Unknown);
        assert_eq!(cache.increment_not_observed(&key), 1);
        assert_eq!(cache.increment_not_observed(&key), 2);
        cache.set(&key, ToolCapability::Supported);
        assert_eq!(cache.get(&key), ToolCapability::Supported);
        // flipping to supported clears the idle counter
        assert_eq!(cache.increment_not_observed(&key), 1);
    }
}
