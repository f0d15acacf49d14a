use medlens::{BlobStore, FileBlobStore, InMemoryBlobStore, Language};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_MODEL: &str = "openai/gpt-4.1-mini";
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown MEDLENS_STORE value {0:?}, expected memory, file or postgres")]
    UnknownStore(String),

    #[error("DATABASE_URL must be set when MEDLENS_STORE=postgres")]
    MissingDatabaseUrl,

    #[error("Invalid MEDLENS_DEFAULT_LANGUAGE: {0}")]
    InvalidLanguage(String),

    #[error("Failed to open the {kind} store: {source}")]
    Store {
        kind: &'static str,
        #[source]
        source: medlens::LensError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    File(PathBuf),
    Postgres(String),
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub store: StoreKind,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub history_limit: usize,
    pub default_language: Language,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let store = match get("MEDLENS_STORE").as_deref().unwrap_or("file") {
            "memory" => StoreKind::Memory,
            "file" => StoreKind::File(
                get("MEDLENS_DATA_DIR")
                    .unwrap_or_else(|| "./medlens-data".to_string())
                    .into(),
            ),
            "postgres" => {
                StoreKind::Postgres(get("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?)
            }
            other => return Err(ConfigError::UnknownStore(other.to_string())),
        };

        let default_language = match get("MEDLENS_DEFAULT_LANGUAGE") {
            Some(tag) => Language::parse(&tag).map_err(|_| ConfigError::InvalidLanguage(tag))?,
            None => Language::parse("en").map_err(|e| ConfigError::InvalidLanguage(e.to_string()))?,
        };

        Ok(Self {
            port: parse_or("PORT", get("PORT"), 3000),
            store,
            api_key: get("OPENROUTER_API_KEY"),
            model: get("OPENROUTER_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: get("OPENROUTER_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            history_limit: parse_or(
                "MEDLENS_HISTORY_LIMIT",
                get("MEDLENS_HISTORY_LIMIT"),
                medlens::DEFAULT_MAX_ENTRIES,
            )
            .max(1),
            default_language,
        })
    }

    pub async fn open_store(&self) -> Result<Arc<dyn BlobStore>, ConfigError> {
        match &self.store {
            StoreKind::Memory => {
                info!("Using in-memory blob store, history is lost on restart");
                Ok(Arc::new(InMemoryBlobStore::new()))
            }
            StoreKind::File(dir) => {
                let store = FileBlobStore::open(dir.clone())
                    .await
                    .map_err(|source| ConfigError::Store { kind: "file", source })?;
                info!(dir = %store.dir().display(), "Using file blob store");
                Ok(Arc::new(store))
            }
            StoreKind::Postgres(url) => {
                info!("Using PostgreSQL blob store");
                let store = medlens::PostgresBlobStore::connect(url)
                    .await
                    .map_err(|source| ConfigError::Store {
                        kind: "postgres",
                        source,
                    })?;
                Ok(Arc::new(store))
            }
        }
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = %default, "Unparseable value, using default");
            default
        }),
        None => default,
    }
}
