use std::collections::HashMap;
use std::sync::Arc;

use crate::{analysis::AnalysisResult, language::Language};

/// Per-language results for the active document only.
///
/// There is no eviction: the cache lives inside one active session and is
/// dropped together with it when a different document is uploaded.
#[derive(Debug, Default, Clone)]
pub struct AnalysisCache {
    results: HashMap<Language, Arc<AnalysisResult>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, language: &Language) -> Option<Arc<AnalysisResult>> {
        self.results.get(language).cloned()
    }

    pub fn put(&mut self, language: Language, result: Arc<AnalysisResult>) {
        self.results.insert(language, result);
    }

    pub fn remove(&mut self, language: &Language) -> Option<Arc<AnalysisResult>> {
        self.results.remove(language)
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<_> = self.results.keys().cloned().collect();
        languages.sort();
        languages
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
