use thiserror::Error;
use uuid::Uuid;

use crate::{identity::DocumentIdentity, language::Language};

#[derive(Error, Debug)]
pub enum LensError {
    /// The external analysis service failed or returned something unusable.
    #[error("Analysis failed: {0}")]
    AnalysisFailure(String),

    #[error("Chat request failed: {0}")]
    ChatFailure(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("History already holds an analysis of {document} in {language}")]
    DuplicateEntry {
        document: DocumentIdentity,
        language: Language,
    },

    #[error("No conversational session is bound to the active document")]
    NotInitialized,

    #[error("Another request is still in flight")]
    Busy,

    #[error("No document is active")]
    NoActiveDocument,

    #[error("History entry not found: {0}")]
    EntryNotFound(Uuid),

    #[error("The source document of entry {0} is not stored and cannot be re-analyzed")]
    SourceUnavailable(Uuid),

    #[error("Selection cannot be compared: {0}")]
    NotComparable(String),

    #[error("Invalid language tag: {0:?}")]
    InvalidLanguage(String),

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LensError>;
