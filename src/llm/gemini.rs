use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    api_error, user_prompt, LlmError, LlmProvider, Provider, Result, SummaryInput,
    DOCUMENT_PROMPT, MAX_TOKENS, SYSTEM_PROMPT,
};
use crate::crypto;

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(client: reqwest::Client, api_key: &str, base_url: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

pub fn request_body(input: SummaryInput<'_>) -> Value {
    let parts = match input {
        SummaryInput::Text(text) => json!([{ "text": user_prompt(text) }]),
        SummaryInput::Pdf { bytes, .. } => json!([
            {
                "inline_data": {
                    "mime_type": "application/pdf",
                    "data": crypto::encode_base64(bytes),
                }
            },
            { "text": DOCUMENT_PROMPT }
        ]),
    };

    json!({
        "system_instruction": { "parts": [{ "text": SYSTEM_PROMPT }] },
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": { "maxOutputTokens": MAX_TOKENS }
    })
}

/// Concatenates the text parts of the first candidate.
pub fn parse_response(body: &Value) -> Result<String> {
    let text: String = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(LlmError::EmptyResponse(Provider::Google));
    }
    Ok(text)
}

#[async_trait]
impl LlmProvider for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn summarize(&self, model: &str, input: SummaryInput<'_>) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/models/{}:generateContent", self.base_url, model))
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(input))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(Provider::Google, response).await);
        }

        let body: Value = response.json().await?;
        parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_goes_inline() {
        let body = request_body(SummaryInput::Pdf { filename: "a.pdf", bytes: b"%PDF-" });
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["inline_data"]["mime_type"], "application/pdf");
        assert_eq!(parts[0]["inline_data"]["data"], "JVBERi0=");
        assert_eq!(parts[1]["text"], DOCUMENT_PROMPT);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn joins_candidate_parts() {
        let body = json!({
            "candidates": [{"content": {"parts": [{"text": "No acute "}, {"text": "findings."}]}}]
        });
        assert_eq!(parse_response(&body).unwrap(), "No acute findings.");
        assert!(parse_response(&json!({"candidates": []})).is_err());
    }
}
