use anyhow::anyhow;
use async_trait::async_trait;
use medlens::{
    AnalysisResult, AnalysisService, ChatService, ChatSession, Credential, DocumentPayload,
    Language, LensError, TurnRole, transcript::replayable,
};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{config::ServiceConfig, prompts::analysis_prompt};

const ANALYSIS_MAX_TOKENS: u32 = 4000;
const CHAT_MAX_TOKENS: u32 = 1200;

/// Chat-completions client used for both the structured analysis and the
/// follow-up conversation.
#[derive(Clone)]
pub struct OpenRouterClient {
    http: Client,
    base_url: String,
    model: String,
    /// Used when the user's settings carry no key.
    fallback_key: Credential,
}

impl OpenRouterClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, fallback_key: Credential) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            fallback_key,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        let fallback_key = config
            .api_key
            .as_deref()
            .map(Credential::new)
            .unwrap_or_else(Credential::none);
        Self::new(config.base_url.clone(), config.model.clone(), fallback_key)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn api_key<'a>(&'a self, credential: &'a Credential) -> anyhow::Result<&'a str> {
        credential
            .as_deref()
            .or(self.fallback_key.as_deref())
            .ok_or_else(|| anyhow!("no API key configured, add one in settings or set OPENROUTER_API_KEY"))
    }

    async fn call_openrouter_api(
        &self,
        api_key: &str,
        messages: Vec<Value>,
        max_tokens: u32,
    ) -> anyhow::Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("LLM API request failed: {}", response.status()));
        }

        let response_json: Value = response.json().await?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("Invalid response format from LLM"))?;

        Ok(content.to_string())
    }
}

#[async_trait]
impl AnalysisService for OpenRouterClient {
    async fn analyze(
        &self,
        document: &DocumentPayload,
        language: &Language,
        credential: &Credential,
    ) -> medlens::Result<AnalysisResult> {
        let api_key = self
            .api_key(credential)
            .map_err(|e| LensError::AnalysisFailure(e.to_string()))?;

        info!(
            document = %document.identity,
            mime_type = %document.mime_type,
            language = %language,
            model = %self.model,
            "Calling analysis model"
        );
        let messages = analysis_messages(document, language);
        let raw = self
            .call_openrouter_api(api_key, messages, ANALYSIS_MAX_TOKENS)
            .await
            .map_err(|e| LensError::AnalysisFailure(e.to_string()))?;

        debug!(document = %document.identity, chars = raw.len(), "Analysis model replied");
        AnalysisResult::from_model_output(&raw)
    }
}

#[async_trait]
impl ChatService for OpenRouterClient {
    async fn send(
        &self,
        session: &ChatSession,
        text: &str,
        credential: &Credential,
    ) -> medlens::Result<String> {
        let api_key = self
            .api_key(credential)
            .map_err(|e| LensError::ChatFailure(e.to_string()))?;

        debug!(session_id = %session.id, turns = session.history().len(), "Calling chat model");
        let reply = self
            .call_openrouter_api(api_key, chat_messages(session, text), CHAT_MAX_TOKENS)
            .await
            .map_err(|e| LensError::ChatFailure(e.to_string()))?;

        if reply.trim().is_empty() {
            return Err(LensError::ChatFailure("empty reply from model".to_string()));
        }
        Ok(reply)
    }
}

/// Inline content part carrying the document itself.
pub fn document_part(document: &DocumentPayload) -> Value {
    let mime = document.mime_type.as_str();
    if mime.starts_with("text/") {
        return json!({
            "type": "text",
            "text": String::from_utf8_lossy(&document.bytes)
        });
    }

    let data_url = format!("data:{};base64,{}", mime, document.to_base64());
    if mime == "application/pdf" {
        json!({
            "type": "file",
            "file": {
                "filename": "document.pdf",
                "file_data": data_url
            }
        })
    } else {
        json!({
            "type": "image_url",
            "image_url": { "url": data_url }
        })
    }
}

pub fn analysis_messages(document: &DocumentPayload, language: &Language) -> Vec<Value> {
    vec![json!({
        "role": "user",
        "content": [
            { "type": "text", "text": analysis_prompt(language) },
            document_part(document)
        ]
    })]
}

/// System framing, the document, every replayable prior turn, then the new message.
pub fn chat_messages(session: &ChatSession, text: &str) -> Vec<Value> {
    let mut messages = vec![json!({
        "role": "system",
        "content": session.seed.system_framing()
    })];

    if let Some(document) = &session.seed.document {
        messages.push(json!({
            "role": "user",
            "content": [
                { "type": "text", "text": "This is the document we are discussing." },
                document_part(document)
            ]
        }));
    }

    for turn in replayable(session.history()) {
        let role = match turn.role {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        };
        messages.push(json!({ "role": role, "content": turn.text }));
    }

    messages.push(json!({ "role": "user", "content": text }));
    messages
}
