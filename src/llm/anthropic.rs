use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    api_error, user_prompt, LlmError, LlmProvider, Provider, Result, SummaryInput,
    DOCUMENT_PROMPT, MAX_TOKENS, SYSTEM_PROMPT,
};
use crate::crypto;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(client: reqwest::Client, api_key: &str, base_url: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

pub fn request_body(model: &str, input: SummaryInput<'_>) -> Value {
    let content = match input {
        SummaryInput::Text(text) => json!([{ "type": "text", "text": user_prompt(text) }]),
        SummaryInput::Pdf { bytes, .. } => json!([
            {
                "type": "document",
                "source": {
                    "type": "base64",
                    "media_type": "application/pdf",
                    "data": crypto::encode_base64(bytes),
                }
            },
            { "type": "text", "text": DOCUMENT_PROMPT }
        ]),
    };

    json!({
        "model": model,
        "max_tokens": MAX_TOKENS,
        "system": SYSTEM_PROMPT,
        "messages": [{ "role": "user", "content": content }]
    })
}

pub fn parse_response(body: &Value) -> Result<String> {
    let text: String = body
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(LlmError::EmptyResponse(Provider::Anthropic));
    }
    Ok(text)
}

#[async_trait]
impl LlmProvider for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn summarize(&self, model: &str, input: SummaryInput<'_>) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request_body(model, input))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(Provider::Anthropic, response).await);
        }

        let body: Value = response.json().await?;
        parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_is_a_document_block() {
        let body = request_body(
            "claude-3-haiku-20240307",
            SummaryInput::Pdf { filename: "a.pdf", bytes: b"%PDF-" },
        );
        let block = &body["messages"][0]["content"][0];
        assert_eq!(block["type"], "document");
        assert_eq!(block["source"]["media_type"], "application/pdf");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["system"], SYSTEM_PROMPT);
    }

    #[test]
    fn keeps_only_text_blocks() {
        let body = json!({
            "content": [
                {"type": "text", "text": "Hypertension, "},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "on lisinopril."}
            ]
        });
        assert_eq!(parse_response(&body).unwrap(), "Hypertension, on lisinopril.");
        assert!(parse_response(&json!({"content": []})).is_err());
    }
}
