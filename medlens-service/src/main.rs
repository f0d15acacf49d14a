use medlens_service::{ServiceConfig, create_app};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "medlens=debug,medlens_service=debug,tower_http=debug";

/// `LOG_FORMAT` picks `pretty`, `compact` or (default) JSON lines that carry
/// the request span, so every line shows its correlation id.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("pretty") => registry.with(fmt::layer().pretty()).init(),
        Ok("compact") => registry.with(fmt::layer().compact()).init(),
        _ => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServiceConfig::from_env()?;
    if config.api_key.is_none() {
        warn!("OPENROUTER_API_KEY not set, analysis needs a key in the user settings");
    }

    let app = create_app(&config).await?;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let addr = listener.local_addr()?;

    info!("MedLens service starting on {}", addr);
    info!("API documentation available at http://{}/", addr);
    info!("Upload endpoint: POST http://{}/documents", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
