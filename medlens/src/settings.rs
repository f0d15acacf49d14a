use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::storage::{BlobStore, SETTINGS_KEY};

/// Service credential passed through to analysis and chat calls.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(Option<String>);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        if key.trim().is_empty() {
            Self(None)
        } else {
            Self(Some(key.trim().to_string()))
        }
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_present(&self) -> bool {
        self.0.is_some()
    }
}

// Never print the key itself.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Credential(<redacted>)"),
            None => f.write_str("Credential(None)"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,
}

/// Read-only view over the settings blob.
#[derive(Clone)]
pub struct SettingsReader {
    store: Arc<dyn BlobStore>,
}

impl SettingsReader {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> UserSettings {
        match self.store.read(SETTINGS_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Settings blob is unreadable, using defaults");
                UserSettings::default()
            }),
            Ok(None) => UserSettings::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read settings, using defaults");
                UserSettings::default()
            }
        }
    }

    pub async fn credential(&self) -> Credential {
        self.load()
            .await
            .api_key
            .map(Credential::new)
            .unwrap_or_default()
    }
}
