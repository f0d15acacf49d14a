pub mod config;
pub mod models;
pub mod openrouter;
pub mod prompts;
pub mod service;

pub use config::{ConfigError, ServiceConfig, StoreKind};
pub use openrouter::OpenRouterClient;
pub use service::{AppState, build_router, create_app};
