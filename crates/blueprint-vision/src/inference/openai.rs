//! `OpenAI`-compatible vision client.
//!
//! Sends the drawing as a base64 data URL in a chat completions request.
//! Any endpoint speaking the same wire format (Azure, vLLM, LiteLLM proxies)
//! works through [`OpenAIClient::with_base_url`].
//!
//! ## Example
//!
//! ```no_run
//! use blueprint_vision::inference::openai::{OpenAIClient, OpenAIModel};
//!
//! # fn example() -> anyhow::Result<()> {
//! let client = OpenAIClient::new(std::env::var("OPENAI_API_KEY")?)
//!     .with_model(OpenAIModel::Gpt4oMini);
//! # Ok(())
//! # }
//! ```
//!
//! ## Cost Information
//!
//! | Model | Input (per 1M tokens) | Output (per 1M tokens) |
//! |-------|----------------------|------------------------|
//! | GPT-4o | $2.50 | $10.00 |
//! | GPT-4o mini | $0.15 | $0.60 |

use super::{GenerateOptions, VisionClient};
use crate::error::{Result, VisionError};
use crate::model::DrawingImage;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Content {
    Text { r#type: String, text: String },
    Image { r#type: String, image_url: ImageUrl },
}

impl Content {
    fn text(text: impl Into<String>) -> Self {
        Self::Text {
            r#type: "text".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// `OpenAI` model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenAIModel {
    /// GPT-4o - Full vision model
    Gpt4o,
    /// GPT-4o mini - Cheaper, weaker on dense drawings
    Gpt4oMini,
}

impl OpenAIModel {
    /// Get the `OpenAI` API model identifier string
    #[inline]
    #[must_use = "returns OpenAI model identifier"]
    pub const fn model_id(&self) -> &str {
        match self {
            Self::Gpt4o => "gpt-4o",
            Self::Gpt4oMini => "gpt-4o-mini",
        }
    }

    /// Cost per 1M tokens (input, output).
    #[inline]
    #[must_use = "returns input/output token costs"]
    pub const fn cost_per_million(&self) -> (f64, f64) {
        match self {
            Self::Gpt4o => (2.50, 10.00),
            Self::Gpt4oMini => (0.15, 0.60),
        }
    }

    #[inline]
    #[must_use = "calculates total API cost"]
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let (input_rate, output_rate) = self.cost_per_million();
        (f64::from(input_tokens) * input_rate / 1_000_000.0)
            + (f64::from(output_tokens) * output_rate / 1_000_000.0)
    }
}

impl std::fmt::Display for OpenAIModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.model_id())
    }
}

impl std::str::FromStr for OpenAIModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpt-4o" | "gpt4o" | "4o" => Ok(Self::Gpt4o),
            "gpt-4o-mini" | "gpt4o-mini" | "4o-mini" | "mini" => Ok(Self::Gpt4oMini),
            _ => Err(format!(
                "unknown OpenAI model '{s}'. Valid options: gpt-4o, gpt-4o-mini"
            )),
        }
    }
}

/// HTTP client for `OpenAI`-compatible chat completions
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    /// Reqwest HTTP client
    client: Client,
    /// API key sent as a bearer token
    api_key: String,
    model: OpenAIModel,
    base_url: String,
}

impl OpenAIClient {
    /// Create a new client for GPT-4o with the given API key
    #[must_use = "creates OpenAI client with API key"]
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: OpenAIModel::Gpt4o,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    #[must_use = "returns client using a different model"]
    pub const fn with_model(mut self, model: OpenAIModel) -> Self {
        self.model = model;
        self
    }

    #[must_use = "returns client using a different endpoint"]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request(&self, image: &DrawingImage, prompt: &str, options: &GenerateOptions) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);

        let mut system = options.system_instruction.clone().unwrap_or_default();
        if let Some(schema) = &options.response_schema {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str("Respond with a single JSON object matching this schema:\n");
            system.push_str(&schema.to_string());
        }
        if !system.is_empty() {
            messages.push(Message {
                role: "system".to_string(),
                content: vec![Content::text(system)],
            });
        }

        messages.push(Message {
            role: "user".to_string(),
            content: vec![
                Content::text(prompt),
                Content::Image {
                    r#type: "image_url".to_string(),
                    image_url: ImageUrl {
                        url: image.data_url(),
                        detail: "high".to_string(),
                    },
                },
            ],
        });

        ChatRequest {
            model: self.model.model_id().to_string(),
            messages,
            max_tokens: options.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: options.temperature,
            response_format: options.response_schema.as_ref().map(|_| ResponseFormat {
                r#type: "json_object".to_string(),
            }),
        }
    }
}

#[async_trait]
impl VisionClient for OpenAIClient {
    async fn generate_vision(
        &self,
        image: &DrawingImage,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String> {
        let start = Instant::now();
        let request = self.build_request(image, prompt, options);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to OpenAI")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VisionError::Inference(format!(
                "OpenAI API error ({status}): {error_text}"
            )));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;

        if let Some(usage) = &chat_response.usage {
            debug!(
                model = %self.model,
                input_tokens = usage.prompt_tokens,
                output_tokens = usage.completion_tokens,
                cost_usd = self.model.calculate_cost(usage.prompt_tokens, usage.completion_tokens),
                latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                "OpenAI call complete"
            );
        }

        Ok(chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        self.model.model_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_model_from_str() {
        assert_eq!("gpt-4o".parse::<OpenAIModel>().unwrap(), OpenAIModel::Gpt4o);
        assert_eq!("4o".parse::<OpenAIModel>().unwrap(), OpenAIModel::Gpt4o);
        assert_eq!("GPT-4O-MINI".parse::<OpenAIModel>().unwrap(), OpenAIModel::Gpt4oMini);
        assert!("claude".parse::<OpenAIModel>().is_err());
    }

    #[test]
    fn test_openai_model_costs() {
        let cost = OpenAIModel::Gpt4o.calculate_cost(1_000_000, 0);
        assert!((cost - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_request_uses_json_mode_with_schema() {
        let client = OpenAIClient::new("key".to_string());
        let image = DrawingImage::from_base64("QUJD", "image/png");
        let options = GenerateOptions::default()
            .with_system_instruction("You classify drawings.")
            .with_schema(serde_json::json!({"type": "object"}))
            .with_temperature(0.1);
        let request = client.build_request(&image, "Classify", &options);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "system");
        let system_text = json["messages"][0]["content"][0]["text"].as_str().unwrap();
        assert!(system_text.starts_with("You classify drawings."));
        assert!(system_text.contains("\"type\":\"object\""));
        assert_eq!(
            json["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
        assert!((json["temperature"].as_f64().unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_request_without_schema_is_plain_text() {
        let client = OpenAIClient::new("key".to_string()).with_base_url("http://localhost:8080/v1/");
        assert_eq!(client.base_url, "http://localhost:8080/v1");
        let image = DrawingImage::from_base64("QUJD", "image/png");
        let request = client.build_request(&image, "Describe", &GenerateOptions::default());
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("response_format").is_none());
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
    }
}
