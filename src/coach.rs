//! AI study coach: a single non-streaming call to the configured provider.
//!
//! The hub keeps no conversation state. Clients send their own history with
//! every request; only the most recent [`MAX_HISTORY_TURNS`] turns are forwarded.

use std::env;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::CoachConfig;
use crate::error::{Result, RoomError};
use crate::providers::{
    AnthropicMessage, AnthropicRequest, AnthropicResponse, ApiErrorEnvelope, OpenAIChatMessage,
    OpenAIChatRequest, OpenAIChatResponse, Provider,
};

pub const MAX_HISTORY_TURNS: usize = 20;
pub const MAX_PROMPT_LEN: usize = 4_000;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoachRole {
    User,
    Assistant,
}

impl CoachRole {
    fn as_str(self) -> &'static str {
        match self {
            CoachRole::User => "user",
            CoachRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoachTurn {
    pub role: CoachRole,
    pub content: String,
}

/// Body of `POST /coach`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoachRequest {
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<CoachTurn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoachReply {
    pub reply: String,
}

pub struct Coach {
    client: Client,
    api_key: String,
    config: CoachConfig,
}

impl Coach {
    /// Build a coach, reading the provider's API key from the environment.
    pub fn from_env(config: CoachConfig) -> Result<Self> {
        let key_env = config.provider.key_env();
        let api_key = env::var(key_env).map_err(|_| RoomError::MissingApiKey(key_env))?;
        Ok(Self::with_key(config, api_key))
    }

    pub fn with_key(config: CoachConfig, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            config,
        }
    }

    pub fn provider(&self) -> Provider {
        self.config.provider
    }

    pub async fn ask(&self, request: &CoachRequest) -> Result<CoachReply> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(RoomError::invalid("prompt must not be empty"));
        }
        if prompt.chars().count() > MAX_PROMPT_LEN {
            return Err(RoomError::invalid(format!(
                "prompt longer than {MAX_PROMPT_LEN} characters"
            )));
        }
        let turns = recent_turns(&request.history);

        let reply = match self.config.provider {
            Provider::Openai => self.ask_openai(turns, prompt).await?,
            Provider::Anthropic => self.ask_anthropic(turns, prompt).await?,
        };
        tracing::debug!(provider = %self.config.provider, chars = reply.len(), "coach replied");
        Ok(CoachReply { reply })
    }

    pub fn openai_request(&self, turns: &[CoachTurn], prompt: &str) -> OpenAIChatRequest {
        let mut messages = Vec::with_capacity(turns.len() + 2);
        if !self.config.system_prompt.is_empty() {
            messages.push(OpenAIChatMessage {
                role: "system".to_string(),
                content: self.config.system_prompt.clone(),
            });
        }
        messages.extend(turns.iter().map(|t| OpenAIChatMessage {
            role: t.role.as_str().to_string(),
            content: t.content.clone(),
        }));
        messages.push(OpenAIChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });
        OpenAIChatRequest {
            model: self.config.model().to_string(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Messages must open with a `user` turn and alternate roles, so leading
    /// assistant turns are dropped and same-role neighbours are merged.
    pub fn anthropic_request(&self, turns: &[CoachTurn], prompt: &str) -> AnthropicRequest {
        let mut messages: Vec<AnthropicMessage> = Vec::with_capacity(turns.len() + 1);
        let leading = turns
            .iter()
            .take_while(|t| t.role == CoachRole::Assistant)
            .count();
        let tail = turns[leading..]
            .iter()
            .map(|t| (t.role, t.content.as_str()))
            .chain(std::iter::once((CoachRole::User, prompt)));
        for (role, content) in tail {
            match messages.last_mut() {
                Some(last) if last.role == role.as_str() => {
                    last.content.push_str("\n\n");
                    last.content.push_str(content);
                }
                _ => messages.push(AnthropicMessage {
                    role: role.as_str().to_string(),
                    content: content.to_string(),
                }),
            }
        }
        AnthropicRequest {
            model: self.config.model().to_string(),
            system: self.config.system_prompt.clone(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    async fn ask_openai(&self, turns: &[CoachTurn], prompt: &str) -> Result<String> {
        let request = self.openai_request(turns, prompt);
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.api_base()))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error("OpenAI", response).await);
        }
        let body: OpenAIChatResponse = response.json().await?;
        body.text()
            .map(str::to_string)
            .ok_or_else(|| RoomError::Coach("OpenAI returned no content".into()))
    }

    async fn ask_anthropic(&self, turns: &[CoachTurn], prompt: &str) -> Result<String> {
        let request = self.anthropic_request(turns, prompt);
        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.api_base()))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error("Anthropic", response).await);
        }
        let body: AnthropicResponse = response.json().await?;
        body.text()
            .ok_or_else(|| RoomError::Coach("Anthropic returned no content".into()))
    }
}

/// The last [`MAX_HISTORY_TURNS`] turns of `history`.
pub fn recent_turns(history: &[CoachTurn]) -> &[CoachTurn] {
    &history[history.len().saturating_sub(MAX_HISTORY_TURNS)..]
}

async fn upstream_error(api: &str, response: reqwest::Response) -> RoomError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ApiErrorEnvelope>(&text)
        .map(|e| e.error.message)
        .unwrap_or(text);
    RoomError::Coach(format!("{api} API error ({status}): {detail}"))
}
