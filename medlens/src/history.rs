use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    analysis::AnalysisResult,
    document::StoredDocument,
    error::{LensError, Result},
    identity::DocumentIdentity,
    language::Language,
    storage::{BlobStore, HISTORY_KEY, source_key},
    transcript::ChatTurn,
};

/// Schema version written by this build. Version 1 was a bare JSON array.
pub const SCHEMA_VERSION: u32 = 2;
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// One persisted (document, language) analysis plus its conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    #[serde(alias = "timestamp", deserialize_with = "flexible_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(alias = "fileHash")]
    pub document: DocumentIdentity,
    pub language: Language,
    #[serde(default, alias = "fileName")]
    pub file_name: String,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(alias = "analysis")]
    pub result: Arc<AnalysisResult>,
    #[serde(default, alias = "chatHistory")]
    pub transcript: Vec<ChatTurn>,
    /// Written under the document's own source key, never inline. Older
    /// history files carried it inline and still load.
    #[serde(default, skip_serializing)]
    pub source: Option<StoredDocument>,
}

impl HistoryEntry {
    pub fn new(
        document: DocumentIdentity,
        language: Language,
        file_name: impl Into<String>,
        result: Arc<AnalysisResult>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            document,
            language,
            file_name: file_name.into(),
            preview: None,
            result,
            transcript: Vec::new(),
            source: None,
        }
    }

    pub fn with_preview(mut self, preview: Option<String>) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_source(mut self, source: StoredDocument) -> Self {
        self.source = Some(source);
        self
    }
}

// Version 1 wrote epoch milliseconds.
fn flexible_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<DateTime<Utc>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range")),
        other => Err(serde::de::Error::custom(format!(
            "unsupported timestamp {other}"
        ))),
    }
}

/// All language variants of one document, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryGroup {
    pub document: DocumentIdentity,
    pub entries: Vec<HistoryEntry>,
}

impl HistoryGroup {
    pub fn newest(&self) -> Option<&HistoryEntry> {
        self.entries.first()
    }

    pub fn languages(&self) -> Vec<Language> {
        self.entries.iter().map(|e| e.language.clone()).collect()
    }
}

/// A durable write that failed; memory still holds the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistenceWarning {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Unchanged,
    Persisted,
    MemoryOnly(PersistenceWarning),
}

impl WriteOutcome {
    pub fn warning(&self) -> Option<&PersistenceWarning> {
        match self {
            WriteOutcome::MemoryOnly(w) => Some(w),
            _ => None,
        }
    }

    pub fn into_warning(self) -> Option<PersistenceWarning> {
        match self {
            WriteOutcome::MemoryOnly(w) => Some(w),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct AppendOutcome {
    pub write: WriteOutcome,
    /// Outcome of storing the document's original, if it was not stored yet.
    pub source_write: WriteOutcome,
    /// Oldest entries dropped to stay within the size bound.
    pub evicted: Vec<HistoryEntry>,
}

#[derive(Debug)]
pub struct RemoveOutcome {
    pub removed: Vec<HistoryEntry>,
    pub write: WriteOutcome,
}

#[derive(Serialize)]
struct HistoryFile<'a> {
    version: u32,
    entries: &'a [HistoryEntry],
}

/// Durable store of every analysis ever produced.
///
/// Every mutation lands in memory first and is then written through as one
/// versioned blob. Memory stays authoritative when that write fails.
/// Uploaded originals live under one key per document, so a large upload
/// that does not fit the store never blocks later history writes.
pub struct HistoryStore {
    entries: Vec<HistoryEntry>,
    store: Arc<dyn BlobStore>,
    max_entries: usize,
    /// Documents whose original is known to be under its source key.
    stored_sources: HashSet<DocumentIdentity>,
}

impl HistoryStore {
    /// Loads the persisted collection; absent or unreadable data yields an empty store.
    pub async fn load(store: Arc<dyn BlobStore>, max_entries: usize) -> Self {
        let mut entries = match store.read(HISTORY_KEY).await {
            Ok(Some(raw)) => decode_entries(&raw),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read history, starting empty");
                Vec::new()
            }
        };
        let stored_sources = attach_sources(store.as_ref(), &mut entries).await;

        info!(entries = entries.len(), sources = stored_sources.len(), "History loaded");
        let mut history = Self {
            entries,
            store,
            max_entries: max_entries.max(1),
            stored_sources,
        };
        // Inline originals from older files move to their own keys.
        if let WriteOutcome::MemoryOnly(warning) = history.store_pending_sources().await {
            warn!(message = %warning.message, "Could not move stored originals out of the history file");
        }
        history
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn get(&self, id: Uuid) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn find_by_document_and_language(
        &self,
        document: &DocumentIdentity,
        language: &Language,
    ) -> Option<&HistoryEntry> {
        self.entries
            .iter()
            .find(|e| &e.document == document && &e.language == language)
    }

    pub async fn append(&mut self, entry: HistoryEntry) -> Result<AppendOutcome> {
        if self
            .find_by_document_and_language(&entry.document, &entry.language)
            .is_some()
        {
            return Err(LensError::DuplicateEntry {
                document: entry.document,
                language: entry.language,
            });
        }

        let new_id = entry.id;
        debug!(entry_id = %new_id, document = %entry.document, language = %entry.language, "Appending history entry");
        self.entries.push(entry);
        let evicted = self.evict_over_limit(new_id);

        let write = self.persist().await;
        let source_write = self.store_pending_sources().await;
        if !evicted.is_empty() {
            self.prune_sources().await;
        }
        Ok(AppendOutcome {
            write,
            source_write,
            evicted,
        })
    }

    pub async fn update_transcript(&mut self, id: Uuid, transcript: &[ChatTurn]) -> Result<WriteOutcome> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(LensError::EntryNotFound(id))?;

        if entry.transcript.as_slice() == transcript {
            return Ok(WriteOutcome::Unchanged);
        }
        entry.transcript = transcript.to_vec();

        Ok(self.persist().await)
    }

    pub async fn remove(&mut self, id: Uuid) -> RemoveOutcome {
        self.remove_where(|e| e.id == id).await
    }

    pub async fn remove_group(&mut self, document: &DocumentIdentity) -> RemoveOutcome {
        self.remove_where(|e| &e.document == document).await
    }

    async fn remove_where(&mut self, matches: impl Fn(&HistoryEntry) -> bool) -> RemoveOutcome {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.entries).into_iter().partition(|e| matches(e));
        self.entries = kept;

        let write = if removed.is_empty() {
            WriteOutcome::Unchanged
        } else {
            let write = self.persist().await;
            self.prune_sources().await;
            write
        };
        RemoveOutcome { removed, write }
    }

    pub fn all_grouped_by_document(&self) -> Vec<HistoryGroup> {
        // Insertion index breaks timestamp ties so later appends sort as newer.
        let mut ordered: Vec<(usize, &HistoryEntry)> = self.entries.iter().enumerate().collect();
        ordered.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));

        let mut positions: HashMap<&DocumentIdentity, usize> = HashMap::new();
        let mut groups: Vec<HistoryGroup> = Vec::new();
        for (_, entry) in ordered {
            let position = *positions.entry(&entry.document).or_insert_with(|| {
                groups.push(HistoryGroup {
                    document: entry.document.clone(),
                    entries: Vec::new(),
                });
                groups.len() - 1
            });
            groups[position].entries.push(entry.clone());
        }
        groups
    }

    fn evict_over_limit(&mut self, keep: Uuid) -> Vec<HistoryEntry> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.id != keep)
                .min_by(|(ia, a), (ib, b)| a.created_at.cmp(&b.created_at).then(ia.cmp(ib)))
                .map(|(i, _)| i);
            let Some(index) = oldest else { break };
            let entry = self.entries.remove(index);
            info!(entry_id = %entry.id, document = %entry.document, "Evicted oldest history entry");
            evicted.push(entry);
        }
        evicted
    }

    async fn persist(&self) -> WriteOutcome {
        let file = HistoryFile {
            version: SCHEMA_VERSION,
            entries: &self.entries,
        };
        let raw = match serde_json::to_string(&file) {
            Ok(raw) => raw,
            Err(e) => return memory_only(LensError::from(e)),
        };

        match self.store.write(HISTORY_KEY, raw).await {
            Ok(()) => WriteOutcome::Persisted,
            Err(e) => memory_only(e),
        }
    }

    /// Writes every in-memory original that is not under its source key yet.
    /// A failed write is retried on the next append.
    async fn store_pending_sources(&mut self) -> WriteOutcome {
        let mut outcome = WriteOutcome::Unchanged;
        let mut attempted = HashSet::new();
        for entry in &self.entries {
            let Some(source) = &entry.source else {
                continue;
            };
            if self.stored_sources.contains(&entry.document) || !attempted.insert(&entry.document) {
                continue;
            }

            let written = match serde_json::to_string(source) {
                Ok(raw) => self.store.write(&source_key(&entry.document), raw).await,
                Err(e) => Err(LensError::from(e)),
            };
            match written {
                Ok(()) => {
                    debug!(document = %entry.document, "Stored document original");
                    self.stored_sources.insert(entry.document.clone());
                    if outcome == WriteOutcome::Unchanged {
                        outcome = WriteOutcome::Persisted;
                    }
                }
                Err(e) => {
                    warn!(document = %entry.document, error = %e, "Document original kept in memory only");
                    outcome = WriteOutcome::MemoryOnly(PersistenceWarning {
                        message: format!("the original of {} was not saved: {e}", entry.file_name),
                    });
                }
            }
        }
        outcome
    }

    /// Removes originals no remaining entry refers to.
    async fn prune_sources(&mut self) {
        let live: HashSet<&DocumentIdentity> = self.entries.iter().map(|e| &e.document).collect();
        let orphaned: Vec<DocumentIdentity> = self
            .stored_sources
            .iter()
            .filter(|d| !live.contains(d))
            .cloned()
            .collect();

        for document in orphaned {
            self.stored_sources.remove(&document);
            if let Err(e) = self.store.remove(&source_key(&document)).await {
                warn!(document = %document, error = %e, "Failed to remove document original");
            }
        }
    }
}

/// Fills in each entry's original from its source key. Returns the documents found there.
async fn attach_sources(store: &dyn BlobStore, entries: &mut [HistoryEntry]) -> HashSet<DocumentIdentity> {
    let documents: HashSet<DocumentIdentity> = entries.iter().map(|e| e.document.clone()).collect();
    let mut found = HashSet::new();
    for document in documents {
        let source = match store.read(&source_key(&document)).await {
            Ok(Some(raw)) => match serde_json::from_str::<StoredDocument>(&raw) {
                Ok(source) => source,
                Err(e) => {
                    warn!(document = %document, error = %e, "Skipping undecodable document original");
                    continue;
                }
            },
            Ok(None) => continue,
            Err(e) => {
                warn!(document = %document, error = %e, "Failed to read document original");
                continue;
            }
        };
        for entry in entries.iter_mut().filter(|e| e.document == document) {
            entry.source.get_or_insert_with(|| source.clone());
        }
        found.insert(document);
    }
    found
}

fn memory_only(error: LensError) -> WriteOutcome {
    warn!(error = %error, "History kept in memory only");
    WriteOutcome::MemoryOnly(PersistenceWarning {
        message: error.to_string(),
    })
}

fn decode_entries(raw: &str) -> Vec<HistoryEntry> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "History blob is not valid JSON, starting empty");
            return Vec::new();
        }
    };

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let version = map.get("version").and_then(Value::as_u64).unwrap_or(0);
            if version > SCHEMA_VERSION as u64 {
                warn!(version, "History was written by a newer schema, reading what is understood");
            }
            match map.remove("entries") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            }
        }
        _ => {
            warn!("History blob has an unexpected shape, starting empty");
            Vec::new()
        }
    };

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<HistoryEntry>(item) {
            Ok(entry) => {
                if seen.insert((entry.document.clone(), entry.language.clone())) {
                    entries.push(entry);
                } else {
                    warn!(entry_id = %entry.id, "Skipping duplicate history entry");
                }
            }
            Err(e) => warn!(error = %e, "Skipping undecodable history entry"),
        }
    }
    entries
}
