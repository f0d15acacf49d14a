use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    // Older transcripts used "model" for the assistant side.
    #[serde(alias = "model")]
    Assistant,
}

/// One visible line of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub text: String,
    /// Set on the locally generated turn that replaces a failed reply.
    #[serde(default)]
    pub is_error: bool,
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(TurnRole::User, text.into(), false)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, text.into(), false)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, text.into(), true)
    }

    fn new(role: TurnRole, text: String, is_error: bool) -> Self {
        Self {
            role,
            text,
            is_error,
            at: Utc::now(),
        }
    }
}

pub type Transcript = Vec<ChatTurn>;

/// Turns worth replaying to the model; error placeholders are excluded.
pub fn replayable(transcript: &[ChatTurn]) -> impl Iterator<Item = &ChatTurn> {
    transcript.iter().filter(|turn| !turn.is_error)
}
