//! Inference service boundary.
//!
//! The pipeline never talks to a model directly. Every call goes through
//! [`VisionClient::generate_vision`], which sends one image plus a prompt and
//! returns the raw text reply. Parsing the reply is the caller's job (see
//! [`crate::parse`]), so implementations stay thin.
//!
//! ## Submodules
//!
//! - [`openai`] - OpenAI-compatible chat completions client
//! - [`prompts`] - Prompt text and response schemas

pub mod openai;
pub mod prompts;

use crate::error::Result;
use crate::model::DrawingImage;
use async_trait::async_trait;

/// Per-call generation settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub system_instruction: Option<String>,
    /// JSON schema the reply should follow; enables JSON mode when set
    pub response_schema: Option<serde_json::Value>,
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
}

impl GenerateOptions {
    #[must_use = "returns options with a system instruction"]
    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(text.into());
        self
    }

    #[must_use = "returns options with a response schema"]
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    #[must_use = "returns options with a temperature"]
    pub const fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A vision-capable inference service.
#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Send one image and prompt, return the raw text reply.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    async fn generate_vision(
        &self,
        image: &DrawingImage,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String>;

    /// Short identifier used in logs.
    fn name(&self) -> &str {
        "vision"
    }
}
