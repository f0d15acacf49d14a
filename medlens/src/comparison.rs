use serde::Serialize;
use std::collections::VecDeque;
use tracing::info;
use uuid::Uuid;

use crate::{
    analysis::kinds_match,
    coordinator::SessionCoordinator,
    error::{LensError, Result},
    history::HistoryEntry,
    identity::DocumentIdentity,
    language::Language,
};

pub const MAX_SELECTION: usize = 2;

/// Snapshot of a selected history entry; entries are immutable apart from their transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedEntry {
    pub id: Uuid,
    pub document: DocumentIdentity,
    pub language: Language,
    pub classification: String,
    /// Language-independent key compared by `is_valid`.
    pub kind: String,
}

impl From<&HistoryEntry> for SelectedEntry {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            id: entry.id,
            document: entry.document.clone(),
            language: entry.language.clone(),
            classification: entry.result.classification.clone(),
            kind: entry.result.comparison_kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToggleOutcome {
    Selected,
    Deselected,
    /// The earliest selection was dropped to make room.
    Replaced { evicted: Uuid },
}

/// Two analyses of the same kind, both in one output language.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonPair {
    pub language: Language,
    pub left: HistoryEntry,
    pub right: HistoryEntry,
}

/// Bounded FIFO selection of history entries for side-by-side comparison.
#[derive(Debug, Clone, Default)]
pub struct ComparisonSelector {
    selected: VecDeque<SelectedEntry>,
}

impl ComparisonSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle(&mut self, entry: &HistoryEntry) -> ToggleOutcome {
        if self.forget(entry.id) {
            return ToggleOutcome::Deselected;
        }

        // Eviction order is insertion order, never recency of access.
        let evicted = if self.selected.len() >= MAX_SELECTION {
            self.selected.pop_front().map(|e| e.id)
        } else {
            None
        };
        self.selected.push_back(SelectedEntry::from(entry));

        match evicted {
            Some(evicted) => ToggleOutcome::Replaced { evicted },
            None => ToggleOutcome::Selected,
        }
    }

    pub fn is_valid(&self) -> bool {
        match (self.selected.front(), self.selected.back()) {
            (Some(first), Some(second)) if self.selected.len() == MAX_SELECTION => {
                kinds_match(&first.kind, &second.kind)
            }
            _ => false,
        }
    }

    pub fn selected(&self) -> Vec<SelectedEntry> {
        self.selected.iter().cloned().collect()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.selected.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Drops an entry (e.g. after it was deleted). Returns whether it was selected.
    pub fn forget(&mut self, id: Uuid) -> bool {
        let before = self.selected.len();
        self.selected.retain(|e| e.id != id);
        self.selected.len() != before
    }

    pub fn forget_document(&mut self, document: &DocumentIdentity) {
        self.selected.retain(|e| &e.document != document);
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    /// Drops selections whose entry is no longer in history, such as one
    /// evicted by the entry limit. Returns the dropped ids.
    pub async fn prune(&mut self, coordinator: &SessionCoordinator) -> Vec<Uuid> {
        let mut gone = Vec::new();
        for selected in &self.selected {
            if coordinator.history_entry(selected.id).await.is_none() {
                gone.push(selected.id);
            }
        }
        self.selected.retain(|e| !gone.contains(&e.id));
        gone
    }

    /// Resolves both selected entries in `language`, analyzing missing variants first.
    pub async fn prepare_for_comparison(
        &self,
        coordinator: &SessionCoordinator,
        language: &Language,
    ) -> Result<ComparisonPair> {
        if self.selected.len() != MAX_SELECTION {
            return Err(LensError::NotComparable(format!(
                "exactly {MAX_SELECTION} entries must be selected, found {}",
                self.selected.len()
            )));
        }
        if !self.is_valid() {
            return Err(LensError::NotComparable(
                "the selected documents are of different kinds".to_string(),
            ));
        }

        let first = &self.selected[0];
        let second = &self.selected[1];
        info!(left = %first.id, right = %second.id, language = %language, "Preparing comparison");

        let left = coordinator.ensure_analysis(first.id, language).await?;
        let right = coordinator.ensure_analysis(second.id, language).await?;

        if left.id == right.id {
            return Err(LensError::NotComparable(
                "both selections are the same analysis in this language".to_string(),
            ));
        }

        Ok(ComparisonPair {
            language: language.clone(),
            left,
            right,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{analysis::AnalysisResult, identity::identity_of};
    use std::sync::Arc;

    fn entry(bytes: &[u8], classification: &str) -> HistoryEntry {
        typed_entry(bytes, "en", classification, "")
    }

    fn typed_entry(bytes: &[u8], language: &str, classification: &str, document_type: &str) -> HistoryEntry {
        let result = AnalysisResult::from_model_output(&format!(
            r#"{{"classification": "{classification}", "document_type": "{document_type}", "summary": "s"}}"#
        ))
        .unwrap();
        HistoryEntry::new(
            identity_of(bytes),
            Language::parse(language).unwrap(),
            "f.png",
            Arc::new(result),
        )
    }

    #[test]
    fn third_toggle_evicts_the_first_chosen() {
        let (a, b, c) = (entry(b"a", "CBC"), entry(b"b", "CBC"), entry(b"c", "CBC"));
        let mut selector = ComparisonSelector::new();

        assert_eq!(selector.toggle(&a), ToggleOutcome::Selected);
        assert_eq!(selector.toggle(&b), ToggleOutcome::Selected);
        assert_eq!(selector.toggle(&c), ToggleOutcome::Replaced { evicted: a.id });

        let ids: Vec<_> = selector.selected().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![b.id, c.id]);
    }

    #[test]
    fn fifo_not_lru() {
        let (a, b, c) = (entry(b"a", "CBC"), entry(b"b", "CBC"), entry(b"c", "CBC"));
        let mut selector = ComparisonSelector::new();
        selector.toggle(&a);
        selector.toggle(&b);
        // touching `a` again would refresh it under LRU; here it deselects it
        assert_eq!(selector.toggle(&a), ToggleOutcome::Deselected);
        selector.toggle(&a);
        assert_eq!(selector.toggle(&c), ToggleOutcome::Replaced { evicted: b.id });

        let ids: Vec<_> = selector.selected().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[test]
    fn validity_requires_two_of_the_same_kind() {
        let mut selector = ComparisonSelector::new();
        let cbc = entry(b"a", "Complete blood count");
        assert!(!selector.is_valid());

        selector.toggle(&cbc);
        assert!(!selector.is_valid());

        selector.toggle(&entry(b"b", "complete BLOOD count"));
        assert!(selector.is_valid());

        let mut mixed = ComparisonSelector::new();
        mixed.toggle(&cbc);
        mixed.toggle(&entry(b"c", "Lipid panel"));
        assert!(!mixed.is_valid());
    }

    #[test]
    fn entries_in_different_languages_compare_by_document_type() {
        let mut selector = ComparisonSelector::new();
        selector.toggle(&typed_entry(b"a", "en", "Complete blood count", "complete_blood_count"));
        selector.toggle(&typed_entry(b"b", "vi", "Công thức máu", "complete_blood_count"));
        assert!(selector.is_valid());
        assert!(selector.selected().iter().all(|e| e.kind == "complete_blood_count"));

        let mut mixed = ComparisonSelector::new();
        mixed.toggle(&typed_entry(b"a", "en", "Complete blood count", "complete_blood_count"));
        mixed.toggle(&typed_entry(b"c", "vi", "Mỡ máu", "lipid_panel"));
        assert!(!mixed.is_valid());
    }

    #[test]
    fn forget_drops_deleted_entries() {
        let (a, b) = (entry(b"a", "CBC"), entry(b"b", "CBC"));
        let mut selector = ComparisonSelector::new();
        selector.toggle(&a);
        selector.toggle(&b);

        assert!(selector.contains(a.id));
        assert!(selector.forget(a.id));
        assert!(!selector.forget(a.id));
        assert!(!selector.contains(a.id));
        selector.forget_document(&b.document);
        assert!(selector.is_empty());
    }
}
