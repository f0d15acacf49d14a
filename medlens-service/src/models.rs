use chrono::{DateTime, Utc};
use medlens::{
    AnalysisResult, ChatOutcome, ChatTurn, ComparisonPair, ComparisonSelector, DocumentIdentity, HistoryEntry,
    HistoryGroup, Language, PersistenceWarning, ResolutionSource, ResolveOutcome, Resolved,
    RiskAssessment, SelectedEntry, ToggleOutcome,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadDocumentRequest {
    pub file_name: String,
    pub mime_type: String,
    /// Base64 of the raw file bytes.
    pub data: String,
    pub language: Option<String>,
    pub preview: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguageRequest {
    pub language: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PrepareComparisonRequest {
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    /// `ready` or `superseded`.
    pub status: &'static str,
    pub source: Option<ResolutionSource>,
    pub entry_id: Option<Uuid>,
    pub language: Option<Language>,
    pub result: Option<Arc<AnalysisResult>>,
    pub warnings: Vec<PersistenceWarning>,
    /// History entries dropped by the entry limit.
    pub evicted: Vec<Uuid>,
}

impl From<Resolved> for ResolveResponse {
    fn from(resolved: Resolved) -> Self {
        Self {
            status: "ready",
            source: Some(resolved.source),
            entry_id: Some(resolved.entry_id),
            language: Some(resolved.language),
            result: Some(resolved.result),
            warnings: resolved.warnings,
            evicted: resolved.evicted,
        }
    }
}

impl From<ResolveOutcome> for ResolveResponse {
    fn from(outcome: ResolveOutcome) -> Self {
        match outcome {
            ResolveOutcome::Ready(resolved) => resolved.into(),
            ResolveOutcome::Superseded => Self {
                status: "superseded",
                source: None,
                entry_id: None,
                language: None,
                result: None,
                warnings: Vec::new(),
                evicted: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    /// `replied`, `failed` or `discarded`.
    pub status: &'static str,
    pub turn: Option<ChatTurn>,
    pub warnings: Vec<PersistenceWarning>,
}

impl From<ChatOutcome> for ChatResponse {
    fn from(outcome: ChatOutcome) -> Self {
        match outcome {
            ChatOutcome::Replied { reply, warnings } => Self {
                status: "replied",
                turn: Some(reply),
                warnings,
            },
            ChatOutcome::Failed { error_turn, warnings } => Self {
                status: "failed",
                turn: Some(error_turn),
                warnings,
            },
            ChatOutcome::Discarded => Self {
                status: "discarded",
                turn: None,
                warnings: Vec::new(),
            },
        }
    }
}

/// History listing row; the stored source payload is never sent back.
#[derive(Debug, Serialize)]
pub struct EntrySummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub document: DocumentIdentity,
    pub language: Language,
    pub file_name: String,
    pub preview: Option<String>,
    pub classification: String,
    pub document_type: String,
    pub risk: RiskAssessment,
    pub turns: usize,
    pub has_source: bool,
    /// Part of the current comparison selection.
    pub selected: bool,
}

impl From<&HistoryEntry> for EntrySummary {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            id: entry.id,
            created_at: entry.created_at,
            document: entry.document.clone(),
            language: entry.language.clone(),
            file_name: entry.file_name.clone(),
            preview: entry.preview.clone(),
            classification: entry.result.classification.clone(),
            document_type: entry.result.comparison_kind(),
            risk: entry.result.risk,
            turns: entry.transcript.len(),
            has_source: entry.source.is_some(),
            selected: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EntryDetail {
    #[serde(flatten)]
    pub summary: EntrySummary,
    pub result: Arc<AnalysisResult>,
    pub transcript: Vec<ChatTurn>,
}

impl From<&HistoryEntry> for EntryDetail {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            summary: entry.into(),
            result: entry.result.clone(),
            transcript: entry.transcript.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryGroupResponse {
    pub document: DocumentIdentity,
    pub languages: Vec<Language>,
    pub updated_at: Option<DateTime<Utc>>,
    pub entries: Vec<EntrySummary>,
}

impl HistoryGroupResponse {
    pub fn new(group: &HistoryGroup, selector: &ComparisonSelector) -> Self {
        let entries = group
            .entries
            .iter()
            .map(|entry| EntrySummary {
                selected: selector.contains(entry.id),
                ..EntrySummary::from(entry)
            })
            .collect();
        Self {
            document: group.document.clone(),
            languages: group.languages(),
            updated_at: group.newest().map(|entry| entry.created_at),
            entries,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SelectionResponse {
    pub outcome: Option<ToggleOutcome>,
    pub selected: Vec<SelectedEntry>,
    pub valid: bool,
}

#[derive(Debug, Serialize)]
pub struct ComparisonResponse {
    pub language: Language,
    pub left: EntryDetail,
    pub right: EntryDetail,
}

impl From<&ComparisonPair> for ComparisonResponse {
    fn from(pair: &ComparisonPair) -> Self {
        Self {
            language: pair.language.clone(),
            left: (&pair.left).into(),
            right: (&pair.right).into(),
        }
    }
}
