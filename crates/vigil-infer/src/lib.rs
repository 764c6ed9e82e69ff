use std::env;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use vigil_config::{
    DEFAULT_GEMINI_API_KEY_ENV, DEFAULT_GEMINI_MODEL, DEFAULT_OLLAMA_ENDPOINT,
    DEFAULT_OLLAMA_MODEL, InferenceConfig, InferenceProviderKind, ensure_workspace_config,
};

mod client;
mod mock;
mod prompt;
mod schema;

pub use client::ReasoningClient;
pub use mock::MockReasoner;
pub use prompt::{
    DecisionRequest, EvidenceNote, ReasoningCall, ReasoningPrompt, SignalObservation,
    SynthesisRequest,
};
pub use schema::{Decision, DecisionAction, Synthesis, parse_decision, parse_synthesis};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const OLLAMA_GENERATE_PATH: &str = "/api/generate";

#[derive(Debug, Error)]
pub enum InferError {
    #[error("missing Gemini API key in {0}")]
    MissingApiKey(String),
    #[error("config load failed: {0}")]
    Config(#[from] vigil_config::ConfigError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response decoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("reasoning service timed out after {millis}ms")]
    Timeout { millis: u64 },
    #[error("malformed reasoning response: {0}")]
    Malformed(String),
    #[error("reasoning service unavailable: {0}")]
    Unavailable(String),
}

impl InferError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Request(err) => err.is_timeout(),
            _ => false,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// External model that answers decision and synthesis prompts with raw JSON text.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn complete(&self, prompt: &ReasoningPrompt) -> Result<String, InferError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderOverrides {
    pub provider: Option<InferenceProviderKind>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
}

pub struct LoadedReasoner {
    pub service: Arc<dyn ReasoningService>,
    pub provider_name: String,
    pub model_name: String,
}

pub struct GeminiReasoner {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl GeminiReasoner {
    pub fn from_env_key(api_key_env: &str, model: Option<String>) -> Result<Self, InferError> {
        let api_key = read_env_non_empty(api_key_env)
            .ok_or_else(|| InferError::MissingApiKey(api_key_env.to_owned()))?;
        let model = normalize_optional(model).unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_owned());
        Ok(Self::new(api_key, model))
    }

    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            api_base: GEMINI_API_BASE.to_owned(),
        }
    }

    fn endpoint_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        )
    }
}

#[async_trait]
impl ReasoningService for GeminiReasoner {
    async fn complete(&self, prompt: &ReasoningPrompt) -> Result<String, InferError> {
        let body = json!({
            "contents": [
                {
                    "parts": [
                        {
                            "text": prompt.render()
                        }
                    ]
                }
            ],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0.0
            }
        });

        let response_value: Value = self
            .client
            .post(self.endpoint_url())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        extract_gemini_text_part(&response_value).map(|text| text.to_owned())
    }
}

#[derive(Debug, Clone)]
pub struct OllamaReasoner {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaReasoner {
    pub fn new(endpoint: Option<String>, model: Option<String>) -> Self {
        let endpoint =
            normalize_optional(endpoint).unwrap_or_else(|| DEFAULT_OLLAMA_ENDPOINT.to_owned());
        Self {
            client: reqwest::Client::new(),
            endpoint: generate_url(&endpoint),
            model: normalize_optional(model).unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_owned()),
        }
    }
}

#[async_trait]
impl ReasoningService for OllamaReasoner {
    async fn complete(&self, prompt: &ReasoningPrompt) -> Result<String, InferError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt.render(),
            "stream": false,
            "format": "json",
            "options": { "temperature": 0.0 }
        });

        let response_value: Value = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        extract_local_text_part(&response_value)
    }
}

/// Resolves the configured reasoning service. `Ok(None)` means degraded mode.
pub fn load_reasoner(
    config: &InferenceConfig,
    overrides: ProviderOverrides,
) -> Result<Option<LoadedReasoner>, InferError> {
    let selected_provider = overrides.provider.unwrap_or(config.provider);
    let selected_model = first_non_empty(overrides.model, config.model.clone());
    let selected_endpoint = first_non_empty(overrides.endpoint, config.endpoint.clone());
    let selected_api_key_env =
        first_non_empty(overrides.api_key_env, Some(config.api_key_env.clone()))
            .unwrap_or_else(|| DEFAULT_GEMINI_API_KEY_ENV.to_owned());

    let loaded = match selected_provider {
        InferenceProviderKind::None => return Ok(None),
        InferenceProviderKind::Auto => {
            if let Some(api_key) = read_env_non_empty(&selected_api_key_env) {
                let model = normalize_optional(selected_model)
                    .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_owned());
                LoadedReasoner {
                    service: Arc::new(GeminiReasoner::new(api_key, model.clone())),
                    provider_name: InferenceProviderKind::Gemini.as_str().to_owned(),
                    model_name: model,
                }
            } else {
                tracing::warn!(
                    api_key_env = %selected_api_key_env,
                    "no reasoning api key set, running degraded"
                );
                return Ok(None);
            }
        }
        InferenceProviderKind::Mock => mock_reasoner(),
        InferenceProviderKind::Gemini => {
            let provider = GeminiReasoner::from_env_key(&selected_api_key_env, selected_model)?;
            LoadedReasoner {
                model_name: provider.model.clone(),
                service: Arc::new(provider),
                provider_name: InferenceProviderKind::Gemini.as_str().to_owned(),
            }
        }
        InferenceProviderKind::Ollama => {
            let provider = OllamaReasoner::new(selected_endpoint, selected_model);
            LoadedReasoner {
                model_name: provider.model.clone(),
                service: Arc::new(provider),
                provider_name: InferenceProviderKind::Ollama.as_str().to_owned(),
            }
        }
    };

    tracing::info!(
        provider = %loaded.provider_name,
        model = %loaded.model_name,
        "reasoning service selected"
    );
    Ok(Some(loaded))
}

pub fn load_reasoner_from_workspace(
    workspace_root: impl AsRef<Path>,
    overrides: ProviderOverrides,
) -> Result<Option<LoadedReasoner>, InferError> {
    let config = ensure_workspace_config(workspace_root)?;
    load_reasoner(&config.inference, overrides)
}

fn mock_reasoner() -> LoadedReasoner {
    LoadedReasoner {
        service: Arc::new(MockReasoner),
        provider_name: InferenceProviderKind::Mock.as_str().to_owned(),
        model_name: "mock".to_owned(),
    }
}

fn generate_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.ends_with(OLLAMA_GENERATE_PATH) {
        endpoint.to_owned()
    } else {
        format!("{endpoint}{OLLAMA_GENERATE_PATH}")
    }
}

fn extract_gemini_text_part(response: &Value) -> Result<&str, InferError> {
    response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            InferError::InvalidResponse("missing candidates[0].content.parts[0].text".to_owned())
        })
}

fn extract_local_text_part(response: &Value) -> Result<String, InferError> {
    let candidate_paths = [
        "/response",
        "/text",
        "/output",
        "/message/content",
        "/choices/0/text",
        "/choices/0/message/content",
    ];

    for path in candidate_paths {
        if let Some(value) = response.pointer(path) {
            if let Some(text) = value.as_str() {
                return Ok(text.to_owned());
            }
            if value.is_object() {
                return Ok(value.to_string());
            }
        }
    }

    Err(InferError::InvalidResponse(
        "missing local model text/JSON response body".to_owned(),
    ))
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn first_non_empty(left: Option<String>, right: Option<String>) -> Option<String> {
    normalize_optional(left).or_else(|| normalize_optional(right))
}

fn read_env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
