//! Blocking HTTP client for the Ollama embed/chat endpoints.
//!
//! Wire formats:
//! - `POST /api/embed {model, input: [text]}` -> `{embeddings: [[f64]]}`
//! - `POST /api/chat {model, messages, stream: false, format: "json"?,
//!   options: {temperature, seed, top_k}}` -> `{message: {content}}`
//! - `GET /api/tags` for liveness.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OllamaError;
use crate::storage::Config;

/// Default timeout for embed requests.
const EMBED_TIMEOUT: Duration = Duration::from_secs(120);
/// Default timeout for chat requests.
const CHAT_TIMEOUT: Duration = Duration::from_secs(300);
/// Short timeout for the liveness probe.
const TAGS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f64,
    seed: u64,
    top_k: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: ChatOptions,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

/// Client for the Ollama REST API.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    /// Embedding model name.
    pub embed_model: String,
    /// Chat/summarization model name.
    pub chat_model: String,
    client: reqwest::blocking::Client,
}

impl OllamaClient {
    /// Creates a client for the given server and models.
    #[must_use]
    pub fn new(base_url: &str, embed_model: &str, chat_model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            embed_model: embed_model.to_string(),
            chat_model: chat_model.to_string(),
            client: reqwest::blocking::Client::new(),
        }
    }

    /// Creates a client from the project config's `ollama` section.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.ollama.base_url,
            &config.ollama.embed_model,
            &config.ollama.chat_model,
        )
    }

    /// The configured server URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probes `GET /api/tags`; true when the server answers 200.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(TAGS_TIMEOUT)
            .send()
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    /// Embeds one or more texts via `POST /api/embed`.
    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OllamaError> {
        let request = EmbedRequest {
            model: &self.embed_model,
            input: texts,
        };

        let resp = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(EMBED_TIMEOUT)
            .json(&request)
            .send()
            .map_err(|err| self.map_transport_error(err, "embed", &self.embed_model))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(OllamaError::ModelNotFound {
                model: self.embed_model.clone(),
            });
        }
        let resp = resp
            .error_for_status()
            .map_err(|err| OllamaError::Http(err.to_string()))?;

        let body: EmbedResponse = resp
            .json()
            .map_err(|err| OllamaError::BadResponse(err.to_string()))?;
        Ok(body.embeddings)
    }

    /// Sends a chat request via `POST /api/chat` with `stream: false`.
    /// Returns the raw message content string.
    pub fn chat(
        &self,
        user_prompt: &str,
        system_prompt: Option<&str>,
        as_json: bool,
        temperature: f64,
        seed: u64,
    ) -> Result<String, OllamaError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_prompt,
        });

        let request = ChatRequest {
            model: &self.chat_model,
            messages,
            stream: false,
            format: as_json.then_some("json"),
            options: ChatOptions {
                temperature,
                seed,
                top_k: 1,
            },
        };

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(CHAT_TIMEOUT)
            .json(&request)
            .send()
            .map_err(|err| self.map_transport_error(err, "chat", &self.chat_model))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(OllamaError::ModelNotFound {
                model: self.chat_model.clone(),
            });
        }
        let resp = resp
            .error_for_status()
            .map_err(|err| OllamaError::Http(err.to_string()))?;

        let body: ChatResponse = resp
            .json()
            .map_err(|err| OllamaError::BadResponse(err.to_string()))?;
        Ok(body.message.content)
    }

    /// Like [`chat`](Self::chat) with `as_json`, parsing the content into a
    /// JSON value.
    pub fn chat_json(
        &self,
        user_prompt: &str,
        system_prompt: Option<&str>,
        temperature: f64,
        seed: u64,
    ) -> Result<Value, OllamaError> {
        let content = self.chat(user_prompt, system_prompt, true, temperature, seed)?;
        serde_json::from_str(&content).map_err(|err| OllamaError::BadResponse(err.to_string()))
    }

    fn map_transport_error(
        &self,
        err: reqwest::Error,
        operation: &str,
        model: &str,
    ) -> OllamaError {
        if err.is_timeout() {
            OllamaError::Timeout {
                operation: operation.to_string(),
            }
        } else if err.is_connect() {
            OllamaError::NotRunning {
                base_url: self.base_url.clone(),
                model: model.to_string(),
            }
        } else {
            OllamaError::Http(err.to_string())
        }
    }
}
