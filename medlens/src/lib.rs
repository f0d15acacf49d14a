pub mod analysis;
pub mod cache;
pub mod chat;
pub mod client;
pub mod comparison;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod history;
pub mod identity;
pub mod language;
pub mod settings;
pub mod storage;
#[cfg(feature = "postgres")]
pub mod storage_postgres;
pub mod transcript;

// Re-export commonly used types
pub use analysis::{
    ActionPlan, AnalysisResult, Finding, FindingStatus, GlossaryTerm, RiskAssessment, RiskLevel,
};
pub use cache::AnalysisCache;
pub use chat::{ChatSession, GREETING, SessionSeed};
pub use client::{AnalysisService, ChatService};
pub use comparison::{ComparisonPair, ComparisonSelector, SelectedEntry, ToggleOutcome};
pub use coordinator::{
    ChatOutcome, Phase, ResolutionSource, ResolveOutcome, Resolved, SessionCoordinator,
    SessionSnapshot,
};
pub use document::{DocumentPayload, StoredDocument, UploadedDocument};
pub use error::{LensError, Result};
pub use history::{
    DEFAULT_MAX_ENTRIES, HistoryEntry, HistoryGroup, HistoryStore, PersistenceWarning,
    WriteOutcome,
};
pub use identity::{DocumentIdentity, identity_of};
pub use language::Language;
pub use settings::{Credential, SettingsReader, UserSettings};
pub use storage::{
    BlobStore, FileBlobStore, HISTORY_KEY, InMemoryBlobStore, SETTINGS_KEY, SOURCE_KEY_PREFIX,
    source_key,
};
#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresBlobStore;
pub use transcript::{ChatTurn, Transcript, TurnRole};
