use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    api_error, user_prompt, LlmError, LlmProvider, Provider, Result, SummaryInput,
    DOCUMENT_PROMPT, MAX_TOKENS, SYSTEM_PROMPT,
};
use crate::crypto;

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(client: reqwest::Client, api_key: &str, base_url: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Chat Completions body; PDFs travel as a base64 `file` content part.
pub fn request_body(model: &str, input: SummaryInput<'_>) -> Value {
    let user_content = match input {
        SummaryInput::Text(text) => json!(user_prompt(text)),
        SummaryInput::Pdf { filename, bytes } => json!([
            {
                "type": "file",
                "file": {
                    "filename": filename,
                    "file_data": format!("data:application/pdf;base64,{}", crypto::encode_base64(bytes)),
                }
            },
            { "type": "text", "text": DOCUMENT_PROMPT }
        ]),
    };

    json!({
        "model": model,
        "max_tokens": MAX_TOKENS,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": user_content }
        ]
    })
}

pub fn parse_response(body: &Value) -> Result<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(LlmError::EmptyResponse(Provider::OpenAi))
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn summarize(&self, model: &str, input: SummaryInput<'_>) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request_body(model, input))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(Provider::OpenAi, response).await);
        }

        let body: Value = response.json().await?;
        parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_request_uses_prompt() {
        let body = request_body("gpt-4o-mini", SummaryInput::Text("HbA1c 7.2%"));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["messages"][0]["role"], "system");
        let content = body["messages"][1]["content"].as_str().unwrap();
        assert!(content.starts_with("Summarize the following medical record content"));
        assert!(content.ends_with("HbA1c 7.2%"));
    }

    #[test]
    fn pdf_request_embeds_file_part() {
        let body = request_body(
            "gpt-4o",
            SummaryInput::Pdf { filename: "labs.pdf", bytes: b"%PDF-1.4" },
        );
        let part = &body["messages"][1]["content"][0];
        assert_eq!(part["type"], "file");
        assert_eq!(part["file"]["filename"], "labs.pdf");
        assert!(part["file"]["file_data"]
            .as_str()
            .unwrap()
            .starts_with("data:application/pdf;base64,JVBERi0xLjQ"));
    }

    #[test]
    fn parses_first_choice() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "Stable."}}]});
        assert_eq!(parse_response(&body).unwrap(), "Stable.");
        assert!(parse_response(&json!({"choices": []})).is_err());
    }
}
