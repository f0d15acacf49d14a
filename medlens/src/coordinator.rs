//! Session coordinator: decides between cache, history and the analysis
//! service, and keeps the conversational session bound to the active
//! (document, language) pair.
//!
//! ```text
//! Idle ──upload──▶ Resolving ──ok──▶ Ready ──send──▶ Chatting
//!                     │                ▲                │
//!                     └─err─▶ Failed   └──reply/error───┘
//! ```
//!
//! The state lives behind one async mutex. It is released while the analysis
//! or chat service is working, so a new upload, history load or reset can
//! replace the active session in the meantime. Every replacement bumps a
//! generation counter; a response carrying an older ticket is dropped.
//!
//! Each call that waits on a service holds an [`InFlight`] marker. Dropping
//! the call before it settles (a disconnected client, a timeout) runs the
//! marker's cleanup, so the coordinator never stays busy for work nobody is
//! waiting on.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    analysis::AnalysisResult,
    cache::AnalysisCache,
    chat::{ChatSession, SessionSeed},
    client::{AnalysisService, ChatService},
    document::{DocumentPayload, UploadedDocument},
    error::{LensError, Result},
    history::{HistoryEntry, HistoryGroup, HistoryStore, PersistenceWarning, WriteOutcome},
    identity::DocumentIdentity,
    language::Language,
    settings::SettingsReader,
    transcript::ChatTurn,
};

/// Phase message left behind by an analysis that was dropped before it finished.
pub const INTERRUPTED_TEXT: &str = "The analysis was interrupted before it finished, please try again.";

/// Shown in place of a reply that could not be obtained.
pub const CHAT_ERROR_TEXT: &str =
    "Sorry, I could not get an answer right now. Your conversation is kept, please try again.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Resolving,
    Ready,
    Chatting,
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    History,
    Service,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub source: ResolutionSource,
    pub entry_id: Uuid,
    pub language: Language,
    pub result: Arc<AnalysisResult>,
    pub warnings: Vec<PersistenceWarning>,
    /// History entries dropped by the entry limit while saving this result.
    pub evicted: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Ready(Resolved),
    /// The active session moved on before the analysis came back.
    Superseded,
}

#[derive(Debug, Clone)]
pub enum ChatOutcome {
    Replied {
        reply: ChatTurn,
        warnings: Vec<PersistenceWarning>,
    },
    /// The chat call failed; an error turn was appended instead.
    Failed {
        error_turn: ChatTurn,
        warnings: Vec<PersistenceWarning>,
    },
    /// The active session moved on before the reply came back.
    Discarded,
}

/// The single in-memory working set for the document being viewed.
#[derive(Debug)]
struct ActiveSession {
    identity: DocumentIdentity,
    document: Option<DocumentPayload>,
    file_name: String,
    preview: Option<String>,
    /// Entry this session was loaded from, if any.
    origin: Option<Uuid>,
    language: Language,
    result: Option<Arc<AnalysisResult>>,
    cache: AnalysisCache,
    transcript: Vec<ChatTurn>,
    bound_entry: Option<Uuid>,
    chat: Option<ChatSession>,
}

impl ActiveSession {
    fn from_upload(document: UploadedDocument, language: Language) -> Self {
        Self {
            identity: document.payload.identity.clone(),
            document: Some(document.payload),
            file_name: document.file_name,
            preview: document.preview,
            origin: None,
            language,
            result: None,
            cache: AnalysisCache::new(),
            transcript: Vec::new(),
            bound_entry: None,
            chat: None,
        }
    }

    fn from_entry(entry: &HistoryEntry) -> Self {
        let document = entry.source.as_ref().and_then(|source| match source.to_payload() {
            Ok(payload) if payload.identity == entry.document => Some(payload),
            Ok(_) => {
                warn!(entry_id = %entry.id, "Stored source does not match its identity, ignoring it");
                None
            }
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Stored source is unreadable, ignoring it");
                None
            }
        });

        let mut cache = AnalysisCache::new();
        cache.put(entry.language.clone(), entry.result.clone());

        Self {
            identity: entry.document.clone(),
            document,
            file_name: entry.file_name.clone(),
            preview: entry.preview.clone(),
            origin: Some(entry.id),
            language: entry.language.clone(),
            result: None,
            cache,
            transcript: Vec::new(),
            bound_entry: None,
            chat: None,
        }
    }

    fn unbind(&mut self) {
        self.result = None;
        self.transcript.clear();
        self.bound_entry = None;
        self.chat = None;
    }

    fn new_entry(&self, language: Language, result: Arc<AnalysisResult>) -> HistoryEntry {
        let entry = HistoryEntry::new(self.identity.clone(), language, self.file_name.clone(), result)
            .with_preview(self.preview.clone());
        match &self.document {
            Some(document) => entry.with_source(document.to_stored()),
            None => entry,
        }
    }
}

/// Read-only view of the coordinator for the rendering layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub busy: bool,
    pub document: Option<DocumentIdentity>,
    pub file_name: Option<String>,
    pub preview: Option<String>,
    pub language: Option<Language>,
    pub result: Option<Arc<AnalysisResult>>,
    pub cached_languages: Vec<Language>,
    pub transcript: Vec<ChatTurn>,
    pub bound_entry: Option<Uuid>,
    pub chat_ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Ticket {
    generation: u64,
    identity: DocumentIdentity,
    language: Language,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Resolving,
    Chatting,
    Preparing,
}

struct CoordinatorState {
    phase: Phase,
    active: Option<ActiveSession>,
    history: HistoryStore,
    generation: u64,
    /// Last id handed out by `begin`.
    last_op: u64,
    /// Resolve or chat call currently owning the phase.
    flight: Option<u64>,
    /// Comparison analysis running outside the active session.
    preparing: Option<u64>,
}

impl CoordinatorState {
    fn is_busy(&self) -> bool {
        self.preparing.is_some() || matches!(self.phase, Phase::Resolving | Phase::Chatting)
    }

    fn begin(&mut self, work: Work) -> u64 {
        self.last_op += 1;
        match work {
            Work::Preparing => self.preparing = Some(self.last_op),
            Work::Resolving | Work::Chatting => self.flight = Some(self.last_op),
        }
        self.last_op
    }

    /// Ends `op`. A phase the call never settled is settled here.
    fn finish(&mut self, work: Work, op: u64) {
        if work == Work::Preparing {
            if self.preparing == Some(op) {
                self.preparing = None;
            }
            return;
        }
        if self.flight != Some(op) {
            return;
        }
        self.flight = None;
        match (&self.phase, work) {
            (Phase::Resolving, Work::Resolving) => {
                warn!(op, "Analysis dropped before it finished");
                self.phase = Phase::Failed {
                    message: INTERRUPTED_TEXT.to_string(),
                };
            }
            (Phase::Chatting, Work::Chatting) => {
                warn!(op, "Chat call dropped before the reply arrived");
                self.phase = Phase::Ready;
            }
            _ => {}
        }
    }

    fn ticket(&self) -> Option<Ticket> {
        self.active.as_ref().map(|active| Ticket {
            generation: self.generation,
            identity: active.identity.clone(),
            language: active.language.clone(),
        })
    }

    fn is_current(&self, ticket: &Ticket) -> bool {
        self.ticket().as_ref() == Some(ticket)
    }

    fn replace_active(&mut self, active: Option<ActiveSession>) {
        self.generation += 1;
        self.active = active;
        self.flight = None;
        self.preparing = None;
    }
}

/// Marks one service call in progress and finishes it when dropped, on
/// every exit path including cancellation.
struct InFlight {
    state: Arc<Mutex<CoordinatorState>>,
    work: Work,
    op: u64,
}

impl InFlight {
    fn start(shared: &Arc<Mutex<CoordinatorState>>, state: &mut CoordinatorState, work: Work) -> Self {
        Self {
            state: shared.clone(),
            work,
            op: state.begin(work),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let (work, op) = (self.work, self.op);
        if let Ok(mut state) = self.state.try_lock() {
            state.finish(work, op);
            return;
        }
        // Someone else holds the lock; finish once they release it.
        let state = self.state.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { state.lock().await.finish(work, op) });
            }
            Err(_) => warn!(op, "No runtime to finish an abandoned call"),
        }
    }
}

pub struct SessionCoordinator {
    analysis: Arc<dyn AnalysisService>,
    chat: Arc<dyn ChatService>,
    settings: SettingsReader,
    state: Arc<Mutex<CoordinatorState>>,
}

impl SessionCoordinator {
    pub fn new(
        analysis: Arc<dyn AnalysisService>,
        chat: Arc<dyn ChatService>,
        settings: SettingsReader,
        history: HistoryStore,
    ) -> Self {
        Self {
            analysis,
            chat,
            settings,
            state: Arc::new(Mutex::new(CoordinatorState {
                phase: Phase::Idle,
                active: None,
                history,
                generation: 0,
                last_op: 0,
                flight: None,
                preparing: None,
            })),
        }
    }

    pub async fn is_busy(&self) -> bool {
        self.state.lock().await.is_busy()
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase.clone()
    }

    /// Makes `document` the active document and resolves it in `language`.
    ///
    /// Re-uploading the active document keeps its cache; any other document
    /// replaces the active session and supersedes in-flight work.
    pub async fn upload(&self, document: UploadedDocument, language: Language) -> Result<ResolveOutcome> {
        let mut state = self.state.lock().await;

        let same_document = state
            .active
            .as_ref()
            .is_some_and(|active| &active.identity == document.identity());

        if same_document {
            if state.is_busy() {
                return Err(LensError::Busy);
            }
            if let Some(active) = state.active.as_mut() {
                info!(document = %active.identity, "Re-upload of the active document, keeping cache");
                active.document = Some(document.payload);
                active.file_name = document.file_name;
                active.preview = document.preview.or(active.preview.take());
            }
        } else {
            info!(
                document = %document.identity(),
                file_name = %document.file_name,
                language = %language,
                "New document uploaded"
            );
            state.replace_active(Some(ActiveSession::from_upload(document, language.clone())));
            state.phase = Phase::Idle;
        }

        self.resolve_with(state, language).await
    }

    /// Resolves the active document in another language.
    pub async fn switch_language(&self, language: Language) -> Result<ResolveOutcome> {
        let state = self.state.lock().await;
        if state.is_busy() {
            return Err(LensError::Busy);
        }
        if state.active.is_none() {
            return Err(LensError::NoActiveDocument);
        }
        self.resolve_with(state, language).await
    }

    /// Retries the resolution of the active (document, language) pair.
    pub async fn retry(&self) -> Result<ResolveOutcome> {
        let state = self.state.lock().await;
        if state.is_busy() {
            return Err(LensError::Busy);
        }
        let language = state
            .active
            .as_ref()
            .map(|active| active.language.clone())
            .ok_or(LensError::NoActiveDocument)?;
        self.resolve_with(state, language).await
    }

    async fn resolve_with(
        &self,
        mut state: MutexGuard<'_, CoordinatorState>,
        language: Language,
    ) -> Result<ResolveOutcome> {
        let _flight = InFlight::start(&self.state, &mut state, Work::Resolving);
        // Rebound so the lock is released before the marker finishes.
        let mut state = state;

        let CoordinatorState {
            active, history, phase, ..
        } = &mut *state;
        let active = active.as_mut().ok_or(LensError::NoActiveDocument)?;

        active.language = language.clone();
        active.unbind();
        *phase = Phase::Resolving;

        // 1. cache
        if let Some(result) = active.cache.get(&language) {
            debug!(document = %active.identity, language = %language, "Analysis cache hit");
            let mut warnings = Vec::new();
            let mut evicted = Vec::new();
            let (entry_id, transcript) =
                match history.find_by_document_and_language(&active.identity, &language) {
                    Some(entry) => (entry.id, entry.transcript.clone()),
                    None => {
                        let entry = active.new_entry(language.clone(), result.clone());
                        let id = entry.id;
                        warn!(entry_id = %id, "Cached analysis missing from history, re-appending");
                        let outcome = history.append(entry).await?;
                        warnings.extend(outcome.write.into_warning());
                        warnings.extend(outcome.source_write.into_warning());
                        evicted.extend(outcome.evicted.iter().map(|e| e.id));
                        (id, Vec::new())
                    }
                };
            warnings.extend(self.bind(active, history, entry_id, result.clone(), &transcript).await);
            *phase = Phase::Ready;
            return Ok(ResolveOutcome::Ready(Resolved {
                source: ResolutionSource::Cache,
                entry_id,
                language,
                result,
                warnings,
                evicted,
            }));
        }

        // 2. history
        if let Some(entry) = history
            .find_by_document_and_language(&active.identity, &language)
            .cloned()
        {
            info!(document = %active.identity, language = %language, entry_id = %entry.id, "Restoring analysis from history");
            active.cache.put(language.clone(), entry.result.clone());
            let warnings = self
                .bind(active, history, entry.id, entry.result.clone(), &entry.transcript)
                .await;
            *phase = Phase::Ready;
            return Ok(ResolveOutcome::Ready(Resolved {
                source: ResolutionSource::History,
                entry_id: entry.id,
                language,
                result: entry.result,
                warnings,
                evicted: Vec::new(),
            }));
        }

        // 3. analysis service
        let Some(payload) = active.document.clone() else {
            let origin = active.origin.unwrap_or_else(Uuid::nil);
            let error = LensError::SourceUnavailable(origin);
            *phase = Phase::Failed {
                message: error.to_string(),
            };
            return Err(error);
        };
        let ticket = state.ticket().ok_or(LensError::NoActiveDocument)?;
        drop(state);

        info!(document = %ticket.identity, language = %ticket.language, "Requesting analysis");
        let credential = self.settings.credential().await;
        let analyzed = self.analysis.analyze(&payload, &ticket.language, &credential).await;

        let mut state = self.state.lock().await;
        if !state.is_current(&ticket) {
            info!(document = %ticket.identity, language = %ticket.language, "Dropping analysis for a superseded session");
            return Ok(ResolveOutcome::Superseded);
        }

        let CoordinatorState {
            active, history, phase, ..
        } = &mut *state;
        let Some(active) = active.as_mut() else {
            return Ok(ResolveOutcome::Superseded);
        };

        let mut result = match analyzed {
            Ok(result) => result,
            Err(e) => {
                let message = match e {
                    LensError::AnalysisFailure(message) => message,
                    other => other.to_string(),
                };
                warn!(document = %ticket.identity, language = %ticket.language, error = %message, "Analysis failed");
                *phase = Phase::Failed {
                    message: format!("The document could not be analyzed: {message}"),
                };
                return Err(LensError::AnalysisFailure(message));
            }
        };
        result.normalize();
        let result = Arc::new(result);
        active.cache.put(language.clone(), result.clone());

        let mut warnings = Vec::new();
        let mut evicted = Vec::new();
        let (entry_id, transcript) =
            match history.find_by_document_and_language(&active.identity, &language) {
                Some(existing) => (existing.id, existing.transcript.clone()),
                None => {
                    let entry = active.new_entry(language.clone(), result.clone());
                    let id = entry.id;
                    let outcome = history.append(entry).await?;
                    warnings.extend(outcome.write.into_warning());
                    warnings.extend(outcome.source_write.into_warning());
                    evicted.extend(outcome.evicted.iter().map(|e| e.id));
                    info!(entry_id = %id, evicted = evicted.len(), "History entry created");
                    (id, Vec::new())
                }
            };
        warnings.extend(self.bind(active, history, entry_id, result.clone(), &transcript).await);
        *phase = Phase::Ready;

        Ok(ResolveOutcome::Ready(Resolved {
            source: ResolutionSource::Service,
            entry_id,
            language,
            result,
            warnings,
            evicted,
        }))
    }

    /// Binds a conversational session to the active pair, replacing any previous one.
    async fn bind(
        &self,
        active: &mut ActiveSession,
        history: &mut HistoryStore,
        entry_id: Uuid,
        result: Arc<AnalysisResult>,
        transcript: &[ChatTurn],
    ) -> Vec<PersistenceWarning> {
        let seed = SessionSeed {
            identity: active.identity.clone(),
            language: active.language.clone(),
            document: active.document.clone(),
            analysis: result.clone(),
        };
        let session = if transcript.is_empty() {
            self.chat.create_session(seed)
        } else {
            debug!(entry_id = %entry_id, turns = transcript.len(), "Restoring conversation");
            self.chat.create_session_from_transcript(seed, transcript)
        };

        active.result = Some(result);
        active.bound_entry = Some(entry_id);
        active.transcript = session.history().to_vec();
        active.chat = Some(session);

        persist_transcript(history, entry_id, &active.transcript).await
    }

    /// Sends a chat message about the active document.
    ///
    /// Chat failures do not surface as errors: an error turn is appended and
    /// the conversation stays usable.
    pub async fn send_message(&self, text: &str) -> Result<ChatOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LensError::EmptyMessage);
        }

        let mut state = self.state.lock().await;
        if state.is_busy() {
            return Err(LensError::Busy);
        }
        let ticket = state.ticket().ok_or(LensError::NoActiveDocument)?;
        let active = state.active.as_mut().ok_or(LensError::NoActiveDocument)?;
        let session = active.chat.as_mut().ok_or(LensError::NotInitialized)?;

        let snapshot = session.clone();
        let user_turn = ChatTurn::user(text);
        session.push(user_turn.clone());
        active.transcript.push(user_turn);
        state.phase = Phase::Chatting;
        let _flight = InFlight::start(&self.state, &mut state, Work::Chatting);
        drop(state);

        let credential = self.settings.credential().await;
        let reply = self.chat.send(&snapshot, text, &credential).await;

        let mut state = self.state.lock().await;
        let same_session = state
            .active
            .as_ref()
            .and_then(|active| active.chat.as_ref())
            .is_some_and(|chat| chat.id == snapshot.id);
        if !state.is_current(&ticket) || !same_session {
            info!(document = %ticket.identity, language = %ticket.language, "Dropping chat reply for a superseded session");
            return Ok(ChatOutcome::Discarded);
        }

        let CoordinatorState {
            active, history, phase, ..
        } = &mut *state;
        let Some(active) = active.as_mut() else {
            return Ok(ChatOutcome::Discarded);
        };

        let turn = match reply {
            Ok(reply) => ChatTurn::assistant(reply),
            Err(e) => {
                warn!(document = %ticket.identity, error = %e, "Chat reply failed");
                ChatTurn::error(CHAT_ERROR_TEXT)
            }
        };
        if let Some(session) = active.chat.as_mut() {
            session.push(turn.clone());
        }
        active.transcript.push(turn.clone());
        *phase = Phase::Ready;

        let warnings = match active.bound_entry {
            Some(entry_id) => persist_transcript(history, entry_id, &active.transcript).await,
            None => Vec::new(),
        };

        Ok(if turn.is_error {
            ChatOutcome::Failed {
                error_turn: turn,
                warnings,
            }
        } else {
            ChatOutcome::Replied {
                reply: turn,
                warnings,
            }
        })
    }

    /// Replaces the active session with a stored entry and restores its conversation.
    pub async fn load_history_entry(&self, id: Uuid) -> Result<Resolved> {
        let mut state = self.state.lock().await;
        let entry = state.history.get(id).cloned().ok_or(LensError::EntryNotFound(id))?;

        info!(entry_id = %id, document = %entry.document, language = %entry.language, "Loading history entry");
        state.replace_active(Some(ActiveSession::from_entry(&entry)));

        let CoordinatorState {
            active, history, phase, ..
        } = &mut *state;
        let Some(active) = active.as_mut() else {
            return Err(LensError::NoActiveDocument);
        };
        let warnings = self
            .bind(active, history, entry.id, entry.result.clone(), &entry.transcript)
            .await;
        *phase = Phase::Ready;

        Ok(Resolved {
            source: ResolutionSource::History,
            entry_id: entry.id,
            language: entry.language,
            result: entry.result,
            warnings,
            evicted: Vec::new(),
        })
    }

    /// Drops the active session; in-flight responses will be discarded and
    /// no longer count as busy.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.replace_active(None);
        state.phase = Phase::Idle;
        info!("Session reset");
    }

    pub async fn delete_entry(&self, id: Uuid) -> Result<Vec<PersistenceWarning>> {
        let mut state = self.state.lock().await;
        let outcome = state.history.remove(id).await;
        if outcome.removed.is_empty() {
            return Err(LensError::EntryNotFound(id));
        }

        if let Some(active) = state.active.as_mut() {
            for entry in &outcome.removed {
                forget_in_active(active, entry);
            }
        }
        info!(entry_id = %id, "History entry deleted");
        Ok(outcome.write.into_warning().into_iter().collect())
    }

    /// Deletes every language variant of a document. Returns the deleted entries.
    pub async fn delete_document(
        &self,
        identity: &DocumentIdentity,
    ) -> Result<(Vec<HistoryEntry>, Vec<PersistenceWarning>)> {
        let mut state = self.state.lock().await;
        let outcome = state.history.remove_group(identity).await;

        if let Some(active) = state.active.as_mut() {
            for entry in &outcome.removed {
                forget_in_active(active, entry);
            }
        }
        info!(document = %identity, removed = outcome.removed.len(), "Document deleted from history");
        Ok((outcome.removed, outcome.write.into_warning().into_iter().collect()))
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        let active = state.active.as_ref();
        SessionSnapshot {
            phase: state.phase.clone(),
            busy: state.is_busy(),
            document: active.map(|a| a.identity.clone()),
            file_name: active.map(|a| a.file_name.clone()),
            preview: active.and_then(|a| a.preview.clone()),
            language: active.map(|a| a.language.clone()),
            result: active.and_then(|a| a.result.clone()),
            cached_languages: active.map(|a| a.cache.languages()).unwrap_or_default(),
            transcript: active.map(|a| a.transcript.clone()).unwrap_or_default(),
            bound_entry: active.and_then(|a| a.bound_entry),
            chat_ready: active.is_some_and(|a| a.chat.is_some()),
        }
    }

    pub async fn history_groups(&self) -> Vec<HistoryGroup> {
        self.state.lock().await.history.all_grouped_by_document()
    }

    pub async fn history_entry(&self, id: Uuid) -> Option<HistoryEntry> {
        self.state.lock().await.history.get(id).cloned()
    }

    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }

    /// Makes sure the document behind `entry_id` has an analysis in `language`,
    /// without touching the active session's binding.
    ///
    /// Looks in history first, then the active cache, and only then asks the
    /// analysis service using the entry's stored source.
    pub async fn ensure_analysis(&self, entry_id: Uuid, language: &Language) -> Result<HistoryEntry> {
        let mut state = self.state.lock().await;
        if state.is_busy() {
            return Err(LensError::Busy);
        }

        let entry = state
            .history
            .get(entry_id)
            .cloned()
            .ok_or(LensError::EntryNotFound(entry_id))?;
        if &entry.language == language {
            return Ok(entry);
        }
        if let Some(existing) = state
            .history
            .find_by_document_and_language(&entry.document, language)
        {
            return Ok(existing.clone());
        }

        let cached = state
            .active
            .as_ref()
            .filter(|active| active.identity == entry.document)
            .and_then(|active| active.cache.get(language));
        if let Some(result) = cached {
            let variant = variant_of(&entry, language.clone(), result);
            state.history.append(variant.clone()).await?;
            return Ok(variant);
        }

        let source = entry
            .source
            .clone()
            .ok_or(LensError::SourceUnavailable(entry_id))?;
        let payload = source.to_payload()?;

        let flight = InFlight::start(&self.state, &mut state, Work::Preparing);
        drop(state);

        info!(entry_id = %entry_id, language = %language, "Analyzing history entry for comparison");
        let credential = self.settings.credential().await;
        let analyzed = self.analysis.analyze(&payload, language, &credential).await;

        let mut state = self.state.lock().await;
        state.finish(Work::Preparing, flight.op);

        let mut result = analyzed.map_err(|e| match e {
            LensError::AnalysisFailure(message) => LensError::AnalysisFailure(message),
            other => LensError::AnalysisFailure(other.to_string()),
        })?;

        // An upload may have produced the same pair meanwhile.
        if let Some(existing) = state
            .history
            .find_by_document_and_language(&entry.document, language)
        {
            return Ok(existing.clone());
        }

        result.normalize();
        let result = Arc::new(result);
        if let Some(active) = state
            .active
            .as_mut()
            .filter(|active| active.identity == entry.document)
        {
            active.cache.put(language.clone(), result.clone());
        }

        let variant = variant_of(&entry, language.clone(), result);
        let outcome = state.history.append(variant.clone()).await?;
        for warning in [outcome.write.warning(), outcome.source_write.warning()].into_iter().flatten() {
            warn!(entry_id = %variant.id, warning = %warning.message, "Comparison variant kept in memory only");
        }
        Ok(variant)
    }
}

fn variant_of(entry: &HistoryEntry, language: Language, result: Arc<AnalysisResult>) -> HistoryEntry {
    let variant = HistoryEntry::new(entry.document.clone(), language, entry.file_name.clone(), result)
        .with_preview(entry.preview.clone());
    match &entry.source {
        Some(source) => variant.with_source(source.clone()),
        None => variant,
    }
}

fn forget_in_active(active: &mut ActiveSession, entry: &HistoryEntry) {
    if active.identity != entry.document {
        return;
    }
    active.cache.remove(&entry.language);
    if active.bound_entry == Some(entry.id) {
        // The conversation continues, but is no longer persisted.
        active.bound_entry = None;
    }
}

async fn persist_transcript(
    history: &mut HistoryStore,
    entry_id: Uuid,
    transcript: &[ChatTurn],
) -> Vec<PersistenceWarning> {
    match history.update_transcript(entry_id, transcript).await {
        Ok(WriteOutcome::MemoryOnly(warning)) => vec![warning],
        Ok(_) => Vec::new(),
        Err(e) => {
            debug!(entry_id = %entry_id, error = %e, "Transcript not persisted");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::tests::finding, analysis::FindingStatus, history::DEFAULT_MAX_ENTRIES,
        storage::InMemoryBlobStore,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAnalysis {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnalysisService for CountingAnalysis {
        async fn analyze(
            &self,
            document: &DocumentPayload,
            language: &Language,
            _credential: &crate::settings::Credential,
        ) -> Result<AnalysisResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut result = AnalysisResult::from_model_output(&format!(
                r#"{{"classification": "CBC", "summary": "{} in {}"}}"#,
                document.identity, language
            ))?;
            result.findings.push(finding("Hemoglobin", FindingStatus::Low, 1.0));
            Ok(result)
        }
    }

    struct EchoChat;

    #[async_trait]
    impl ChatService for EchoChat {
        async fn send(
            &self,
            _session: &ChatSession,
            text: &str,
            _credential: &crate::settings::Credential,
        ) -> Result<String> {
            Ok(format!("echo: {text}"))
        }
    }

    async fn coordinator() -> (Arc<CountingAnalysis>, SessionCoordinator) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let analysis = Arc::new(CountingAnalysis {
            calls: AtomicUsize::new(0),
        });
        let history = HistoryStore::load(blobs.clone(), DEFAULT_MAX_ENTRIES).await;
        let coordinator = SessionCoordinator::new(
            analysis.clone(),
            Arc::new(EchoChat),
            SettingsReader::new(blobs),
            history,
        );
        (analysis, coordinator)
    }

    fn upload(bytes: &[u8]) -> UploadedDocument {
        UploadedDocument::new("scan.png", DocumentPayload::new(bytes.to_vec(), "image/png").unwrap())
    }

    fn lang(tag: &str) -> Language {
        Language::parse(tag).unwrap()
    }

    fn ready(outcome: ResolveOutcome) -> Resolved {
        match outcome {
            ResolveOutcome::Ready(resolved) => resolved,
            ResolveOutcome::Superseded => panic!("unexpected superseded outcome"),
        }
    }

    #[tokio::test]
    async fn phases_follow_resolution_and_chat() {
        let (_, coordinator) = coordinator().await;
        assert_eq!(coordinator.phase().await, Phase::Idle);

        coordinator.upload(upload(b"ABC"), lang("en")).await.unwrap();
        assert_eq!(coordinator.phase().await, Phase::Ready);

        coordinator.send_message("hello").await.unwrap();
        let snapshot = coordinator.snapshot().await;
        assert_eq!(snapshot.phase, Phase::Ready);
        assert!(!snapshot.busy);
        assert_eq!(snapshot.transcript.last().unwrap().text, "echo: hello");

        coordinator.reset().await;
        assert_eq!(coordinator.phase().await, Phase::Idle);
        assert!(coordinator.snapshot().await.document.is_none());
    }

    #[tokio::test]
    async fn reupload_of_same_content_reuses_everything() {
        let (analysis, coordinator) = coordinator().await;
        coordinator.upload(upload(b"ABC"), lang("en")).await.unwrap();
        coordinator.switch_language(lang("vi")).await.unwrap();

        let again = UploadedDocument::new(
            "renamed.png",
            DocumentPayload::new(b"ABC".to_vec(), "image/png").unwrap(),
        );
        let resolved = ready(coordinator.upload(again, lang("en")).await.unwrap());
        assert_eq!(resolved.source, ResolutionSource::Cache);
        assert_eq!(analysis.calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.snapshot().await.cached_languages, vec![lang("en"), lang("vi")]);
    }

    #[tokio::test]
    async fn new_document_clears_cache_but_history_still_answers() {
        let (analysis, coordinator) = coordinator().await;
        coordinator.upload(upload(b"ABC"), lang("en")).await.unwrap();
        coordinator.upload(upload(b"XYZ"), lang("en")).await.unwrap();
        assert_eq!(coordinator.snapshot().await.cached_languages, vec![lang("en")]);

        let resolved = ready(coordinator.upload(upload(b"ABC"), lang("en")).await.unwrap());
        assert_eq!(resolved.source, ResolutionSource::History);
        assert_eq!(analysis.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn busy_coordinator_rejects_overlapping_requests() {
        let (_, coordinator) = coordinator().await;
        coordinator.upload(upload(b"ABC"), lang("en")).await.unwrap();
        coordinator.state.lock().await.phase = Phase::Chatting;

        assert!(matches!(coordinator.send_message("again").await, Err(LensError::Busy)));
        assert!(matches!(coordinator.switch_language(lang("vi")).await, Err(LensError::Busy)));
        assert!(matches!(coordinator.retry().await, Err(LensError::Busy)));
    }

    #[tokio::test]
    async fn chat_requires_a_bound_session() {
        let (_, coordinator) = coordinator().await;
        assert!(matches!(
            coordinator.send_message("hi").await,
            Err(LensError::NoActiveDocument)
        ));
        assert!(matches!(coordinator.send_message("  ").await, Err(LensError::EmptyMessage)));

        coordinator.upload(upload(b"ABC"), lang("en")).await.unwrap();
        coordinator.state.lock().await.active.as_mut().unwrap().chat = None;
        assert!(matches!(
            coordinator.send_message("hi").await,
            Err(LensError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn deleting_bound_entry_evicts_it_from_cache() {
        let (analysis, coordinator) = coordinator().await;
        let en = ready(coordinator.upload(upload(b"ABC"), lang("en")).await.unwrap());
        coordinator.switch_language(lang("vi")).await.unwrap();

        coordinator.delete_entry(en.entry_id).await.unwrap();
        assert_eq!(coordinator.snapshot().await.cached_languages, vec![lang("vi")]);

        let again = ready(coordinator.switch_language(lang("en")).await.unwrap());
        assert_eq!(again.source, ResolutionSource::Service);
        assert_eq!(analysis.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            coordinator.delete_entry(en.entry_id).await,
            Err(LensError::EntryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reset_clears_preparing_and_a_late_finish_is_ignored() {
        let (_, coordinator) = coordinator().await;
        let stale = coordinator.state.lock().await.begin(Work::Preparing);
        assert!(coordinator.is_busy().await);

        coordinator.reset().await;
        assert!(!coordinator.is_busy().await);

        let mut state = coordinator.state.lock().await;
        let current = state.begin(Work::Preparing);
        state.finish(Work::Preparing, stale);
        assert_eq!(state.preparing, Some(current));
    }

    #[tokio::test]
    async fn dropped_marker_settles_an_unfinished_resolve() {
        let (_, coordinator) = coordinator().await;
        coordinator.upload(upload(b"ABC"), lang("en")).await.unwrap();

        let mut state = coordinator.state.lock().await;
        state.phase = Phase::Resolving;
        let marker = InFlight::start(&coordinator.state, &mut state, Work::Resolving);
        drop(state);
        drop(marker);

        assert_eq!(
            coordinator.phase().await,
            Phase::Failed {
                message: INTERRUPTED_TEXT.to_string()
            }
        );
        assert!(!coordinator.is_busy().await);
    }

    #[tokio::test]
    async fn marker_dropped_under_the_lock_finishes_after_release() {
        let (_, coordinator) = coordinator().await;
        coordinator.upload(upload(b"ABC"), lang("en")).await.unwrap();

        let mut state = coordinator.state.lock().await;
        state.phase = Phase::Chatting;
        let marker = InFlight::start(&coordinator.state, &mut state, Work::Chatting);
        drop(marker);
        assert_eq!(state.phase, Phase::Chatting);
        drop(state);

        for _ in 0..10 {
            if coordinator.phase().await == Phase::Ready {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.phase().await, Phase::Ready);
        assert!(!coordinator.is_busy().await);
    }
}
