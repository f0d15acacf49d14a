use async_trait::async_trait;

use crate::{
    analysis::AnalysisResult,
    chat::{ChatSession, SessionSeed},
    document::DocumentPayload,
    error::Result,
    language::Language,
    settings::Credential,
    transcript::ChatTurn,
};

/// External service that interprets a document in one output language.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(
        &self,
        document: &DocumentPayload,
        language: &Language,
        credential: &Credential,
    ) -> Result<AnalysisResult>;
}

/// External conversational service.
///
/// Sessions are plain values replayed on every `send`, so creating one does
/// not need a round trip; implementations only have to answer messages.
#[async_trait]
pub trait ChatService: Send + Sync {
    fn create_session(&self, seed: SessionSeed) -> ChatSession {
        ChatSession::fresh(seed)
    }

    fn create_session_from_transcript(&self, seed: SessionSeed, transcript: &[ChatTurn]) -> ChatSession {
        ChatSession::from_transcript(seed, transcript)
    }

    async fn send(&self, session: &ChatSession, text: &str, credential: &Credential) -> Result<String>;
}
