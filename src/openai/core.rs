use std::{pin::Pin, str::FromStr, time::Duration};

use anyhow::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::chat::fragment::Fragment;
use crate::chat::models::{Message, MessageStatus, Role};
use crate::core::error::ConfigError;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which model the completion is requested from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModelTier {
    #[default]
    Fast,
    Advanced,
}

impl ModelTier {
    pub fn model_id(&self) -> &'static str {
        match self {
            ModelTier::Fast => "gpt-3.5-turbo",
            ModelTier::Advanced => "gpt-4",
        }
    }

    /// Value kept in the preference store.
    pub fn as_setting(&self) -> &'static str {
        match self {
            ModelTier::Fast => "3.5",
            ModelTier::Advanced => "4",
        }
    }
}

impl FromStr for ModelTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "3.5" | "fast" | "gpt-3.5-turbo" => Ok(ModelTier::Fast),
            "4" | "advanced" | "gpt-4" => Ok(ModelTier::Advanced),
            other => Err(ConfigError::UnknownModelTier(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ApiRole {
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "user")]
    User,
}

impl From<Role> for ApiRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => ApiRole::User,
            Role::Bot => ApiRole::Assistant,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ApiMessage {
    pub role: ApiRole,
    pub content: String,
}

impl ApiMessage {
    pub fn new(role: ApiRole, content: &str) -> Self {
        ApiMessage {
            role,
            content: content.to_string(),
        }
    }
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    pub stream: bool,
}

impl ChatRequest {
    /// Builds a streaming request from the transcript. Only user
    /// messages and bot messages that finished normally are sent, so
    /// the open placeholder and aborted responses are left out.
    pub fn new(tier: ModelTier, history: &[Message]) -> Self {
        let messages = history
            .iter()
            .filter(|m| match m.role {
                Role::User => true,
                Role::Bot => {
                    matches!(m.status, MessageStatus::Finished { .. }) && !m.content.is_empty()
                }
            })
            .map(|m| ApiMessage::new(m.role.into(), &m.content))
            .collect();

        ChatRequest {
            model: tier.model_id().to_string(),
            messages,
            stream: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunkChoice {
    delta: Option<ChunkDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChunkChoice>,
    error: Option<ApiErrorBody>,
}

/// Maps one SSE `data` payload to fragments. A chunk can carry content
/// and a finish reason at the same time, in which case the content is
/// emitted first.
pub fn parse_chunk(data: &str) -> Vec<Fragment> {
    if data.trim() == "[DONE]" {
        return vec![Fragment::End {
            finish_reason: None,
        }];
    }

    let chunk = match serde_json::from_str::<CompletionChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::error!("Parsing completion chunk failed for {}\nError:{}", data, e);
            return vec![Fragment::Error(format!("invalid completion chunk: {}", e))];
        }
    };

    if let Some(err) = chunk.error {
        return vec![Fragment::Error(err.message)];
    }

    let mut fragments = Vec::new();
    // Only a single choice is ever requested
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(content) = choice.delta.and_then(|d| d.content)
            && !content.is_empty()
        {
            fragments.push(Fragment::Delta(content.into_bytes()));
        }
        if let Some(reason) = choice.finish_reason {
            fragments.push(Fragment::End {
                finish_reason: Some(reason),
            });
        }
    }
    fragments
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Fragment> + Send>>;

/// A service that streams a chat completion as fragments. The stream
/// ends after the first terminal fragment, or without one when the
/// connection drops.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream, Error>;
}

/// Turns a server-sent events body into fragments. The stream stops
/// after the first terminal fragment.
pub fn fragment_stream<S, B, E>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let events = body.eventsource();
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield Fragment::Error(format!("stream interrupted: {}", e));
                    return;
                }
            };
            if event.data.trim().is_empty() {
                continue;
            }

            tracing::debug!("Completion chunk: {}", event.data);
            for fragment in parse_chunk(&event.data) {
                let terminal = fragment.is_terminal();
                yield fragment;
                if terminal {
                    return;
                }
            }
        }
    };

    Box::pin(stream)
}

/// Client for an OpenAI compatible chat completions API.
///
/// Only connecting is bounded here. How long to wait for headers and
/// between fragments is up to the caller, a response can stream for as
/// long as it keeps sending.
#[derive(Clone, Debug)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    organization: String,
}

impl OpenAiClient {
    pub fn new(api_base: &str, api_key: &str, organization: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            organization: organization.to_string(),
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream, Error> {
        let url = format!("{}/v1/chat/completions", self.api_base);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Organization", &self.organization)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Completion request failed with {}: {}", status, body);
            let fragment = Fragment::Error(format!("OpenAI API error: {} - {}", status, body));
            return Ok(Box::pin(futures::stream::iter([fragment])));
        }

        Ok(fragment_stream(response.bytes_stream()))
    }
}
