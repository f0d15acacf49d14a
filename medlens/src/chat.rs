use std::fmt::Write as _;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    analysis::AnalysisResult,
    document::DocumentPayload,
    identity::DocumentIdentity,
    language::Language,
    transcript::ChatTurn,
};

/// Everything a conversational session is bound to.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub identity: DocumentIdentity,
    pub language: Language,
    /// Missing when a history entry was written without its source payload.
    pub document: Option<DocumentPayload>,
    pub analysis: Arc<AnalysisResult>,
}

impl SessionSeed {
    /// Language-specific instructions sent ahead of every conversation.
    pub fn system_framing(&self) -> String {
        let language = self.language.display_name();
        let mut framing = format!(
            "You are a careful medical assistant helping a patient understand their own medical document. \
             Always answer in {language}, in plain language, and point out when something needs a doctor. \
             Never invent values that are not in the document. You do not replace a physician.\n\n\
             The document has already been interpreted as follows:\n"
        );

        let analysis = &self.analysis;
        if !analysis.classification.is_empty() {
            let _ = writeln!(framing, "Document type: {}", analysis.classification);
        }
        let _ = writeln!(framing, "Summary: {}", analysis.summary.trim());
        for finding in &analysis.findings {
            let _ = writeln!(
                framing,
                "- {}: {}{} (reference {}, {})",
                finding.name,
                finding.value,
                finding.unit.as_deref().map(|u| format!(" {u}")).unwrap_or_default(),
                finding.reference_range.as_deref().unwrap_or("n/a"),
                finding.status.label()
            );
        }
        let _ = write!(
            framing,
            "Overall risk: {:?} ({}/100)",
            analysis.risk.level, analysis.risk.score
        );
        framing
    }
}

/// Opening line of a fresh conversation.
pub const GREETING: &str =
    "I have gone through your document. Ask me anything about the results or what to do next.";

/// Handle to one conversational session.
///
/// `history` holds the prior turns that are replayed on every request. A
/// fresh session starts with the greeting; a restored one starts with
/// exactly the transcript it was restored from.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: Uuid,
    pub seed: SessionSeed,
    history: Vec<ChatTurn>,
}

impl ChatSession {
    pub fn fresh(seed: SessionSeed) -> Self {
        Self {
            id: Uuid::new_v4(),
            seed,
            history: vec![ChatTurn::assistant(GREETING)],
        }
    }

    pub fn from_transcript(seed: SessionSeed, transcript: &[ChatTurn]) -> Self {
        Self {
            id: Uuid::new_v4(),
            seed,
            history: transcript.to_vec(),
        }
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.history.push(turn);
    }
}
