//! Medical summarisation through hosted LLM providers.
//!
//! Each provider is a thin reqwest client. PDFs are forwarded as native
//! document parts; no text extraction happens here.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::Settings;

pub const SUMMARY_PROMPT: &str = "Summarize the following medical record content, focusing on key diagnoses, treatments, medications, and allergies:";
pub const DOCUMENT_PROMPT: &str = "Summarize the attached medical record document, focusing on key diagnoses, treatments, medications, and allergies.";
pub const SYSTEM_PROMPT: &str = "You are a helpful medical assistant specializing in summarizing records.";
pub const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Unknown provider '{0}'. Expected one of: openai, google, anthropic")]
    UnknownProvider(String),

    #[error("Provider '{0}' is not configured")]
    NotConfigured(Provider),

    #[error("Invalid model id '{0}'")]
    InvalidModel(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: Provider,
        status: u16,
        message: String,
    },

    #[error("{0} returned no summary text")]
    EmptyResponse(Provider),
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Google,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Google => "google",
            Provider::Anthropic => "anthropic",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Google => "gemini-1.5-flash-latest",
            Provider::Anthropic => "claude-3-haiku-20240307",
        }
    }

    /// Models known to accept PDF documents.
    pub fn pdf_models(&self) -> &'static [&'static str] {
        match self {
            Provider::OpenAi => &["gpt-4o", "gpt-4o-mini", "gpt-4.1", "gpt-4.1-mini"],
            Provider::Google => &[
                "gemini-1.5-flash-latest",
                "gemini-1.5-pro-latest",
                "gemini-2.0-flash",
            ],
            Provider::Anthropic => &[
                "claude-3-7-sonnet-20250219",
                "claude-3-5-sonnet-20241022",
                "claude-3-5-sonnet-20240620",
                "claude-3-5-haiku-20241022",
                "claude-3-opus-20240229",
                "claude-3-haiku-20240307",
            ],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "google" | "gemini" => Ok(Provider::Google),
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            other => Err(LlmError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SummaryInput<'a> {
    Text(&'a str),
    Pdf { filename: &'a str, bytes: &'a [u8] },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub provider: Provider,
    pub name: &'static str,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider(&self) -> Provider;

    async fn summarize(&self, model: &str, input: SummaryInput<'_>) -> Result<String>;
}

/// Model ids end up in URLs for some providers.
pub fn validate_model_id(model: &str) -> Result<()> {
    let valid = !model.is_empty()
        && model.len() <= 128
        && model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(LlmError::InvalidModel(model.to_string()))
    }
}

pub fn user_prompt(text: &str) -> String {
    format!("{SUMMARY_PROMPT}\n\n{text}")
}

/// Shapes a non-2xx provider response into an error.
async fn api_error(provider: Provider, response: reqwest::Response) -> LlmError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect());
    LlmError::Api {
        provider,
        status,
        message,
    }
}

#[derive(Default, Clone)]
pub struct LlmRouter {
    providers: HashMap<Provider, Arc<dyn LlmProvider>>,
}

impl LlmRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_seconds))
            .build()?;

        let mut router = LlmRouter::new();
        if let Some(key) = non_empty(&settings.openai_api_key) {
            router = router.with_provider(Arc::new(openai::OpenAiClient::new(
                client.clone(),
                key,
                &settings.openai_base_url,
            )));
        }
        if let Some(key) = non_empty(&settings.google_api_key) {
            router = router.with_provider(Arc::new(gemini::GeminiClient::new(
                client.clone(),
                key,
                &settings.google_base_url,
            )));
        }
        if let Some(key) = non_empty(&settings.anthropic_api_key) {
            router = router.with_provider(Arc::new(anthropic::AnthropicClient::new(
                client,
                key,
                &settings.anthropic_base_url,
            )));
        }

        let configured: Vec<&str> = router.configured().iter().map(Provider::as_str).collect();
        if configured.is_empty() {
            tracing::warn!("No LLM provider API keys configured; summarisation disabled");
        } else {
            tracing::info!(providers = ?configured, "LLM providers configured");
        }
        Ok(router)
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.insert(provider.provider(), provider);
        self
    }

    pub fn configured(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.providers.keys().copied().collect();
        providers.sort();
        providers
    }

    /// PDF-capable models of configured providers, keyed by provider name.
    pub fn available_models(&self) -> BTreeMap<&'static str, Vec<ModelInfo>> {
        self.configured()
            .into_iter()
            .map(|provider| {
                let models = provider
                    .pdf_models()
                    .iter()
                    .map(|&id| ModelInfo {
                        id,
                        provider,
                        name: id,
                    })
                    .collect();
                (provider.as_str(), models)
            })
            .collect()
    }

    /// Resolves `provider` and `model` (default when absent) and summarises.
    pub async fn summarize(
        &self,
        provider: &str,
        model: Option<&str>,
        input: SummaryInput<'_>,
    ) -> Result<(Provider, String, String)> {
        let provider: Provider = provider.parse()?;
        let client = self
            .providers
            .get(&provider)
            .ok_or(LlmError::NotConfigured(provider))?;

        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(provider.default_model())
            .to_string();
        validate_model_id(&model)?;

        let started = std::time::Instant::now();
        let summary = client.summarize(&model, input).await?;
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(LlmError::EmptyResponse(provider));
        }

        tracing::info!(
            provider = %provider,
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            summary_chars = summary.len(),
            "Summary generated"
        );
        Ok((provider, model, summary))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(Provider);

    #[async_trait]
    impl LlmProvider for Echo {
        fn provider(&self) -> Provider {
            self.0
        }

        async fn summarize(&self, model: &str, input: SummaryInput<'_>) -> Result<String> {
            match input {
                SummaryInput::Text(text) => Ok(format!("{model}: {text}")),
                SummaryInput::Pdf { filename, .. } => Ok(format!("{model}: {filename}")),
            }
        }
    }

    #[test]
    fn provider_names() {
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("gemini".parse::<Provider>().unwrap(), Provider::Google);
        assert!(matches!(
            "mistral".parse::<Provider>(),
            Err(LlmError::UnknownProvider(_))
        ));
        assert_eq!(Provider::Anthropic.default_model(), "claude-3-haiku-20240307");
    }

    #[test]
    fn model_ids_are_restricted() {
        assert!(validate_model_id("gemini-1.5-flash-latest").is_ok());
        assert!(validate_model_id("gpt-4o-mini").is_ok());
        assert!(validate_model_id("../../v1/files").is_err());
        assert!(validate_model_id("").is_err());
    }

    #[test]
    fn only_configured_providers_are_listed() {
        let router = LlmRouter::new().with_provider(Arc::new(Echo(Provider::Anthropic)));
        let models = router.available_models();
        assert_eq!(models.len(), 1);
        assert!(models["anthropic"].iter().any(|m| m.id == "claude-3-haiku-20240307"));
        assert!(LlmRouter::new().available_models().is_empty());
    }

    #[actix_web::test]
    async fn router_uses_default_model() {
        let router = LlmRouter::new().with_provider(Arc::new(Echo(Provider::OpenAi)));
        let (provider, model, summary) = router
            .summarize("openai", None, SummaryInput::Text("BP 120/80"))
            .await
            .unwrap();
        assert_eq!(provider, Provider::OpenAi);
        assert_eq!(model, "gpt-4o-mini");
        assert_eq!(summary, "gpt-4o-mini: BP 120/80");
    }

    #[actix_web::test]
    async fn unconfigured_provider_is_reported() {
        let router = LlmRouter::new();
        let err = router
            .summarize("google", Some("gemini-1.5-pro-latest"), SummaryInput::Text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured(Provider::Google)));
    }

    #[test]
    fn prompt_prefixes_content() {
        let prompt = user_prompt("Metformin 500mg");
        assert!(prompt.starts_with(SUMMARY_PROMPT));
        assert!(prompt.ends_with("Metformin 500mg"));
    }
}
