use anyhow::{Context, Result, bail};
use medlens::{AnalysisService, Credential, DocumentPayload, Language};
use medlens_service::{OpenRouterClient, ServiceConfig};
use std::env;

fn mime_for(path: &str) -> &'static str {
    match path.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        _ => "text/plain",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("MedLens document analysis test");
    println!("==============================");

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <file_path> [language]", args[0]);
        eprintln!("Example: {} /path/to/lab-report.jpg vi", args[0]);
        std::process::exit(1);
    }

    let config = ServiceConfig::from_env()?;
    if config.api_key.is_none() {
        bail!("Please set OPENROUTER_API_KEY environment variable");
    }

    let path = &args[1];
    let language = Language::parse(args.get(2).map(String::as_str).unwrap_or("en"))?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {path}"))?;
    let document = DocumentPayload::new(bytes, mime_for(path))?;

    println!("File: {} ({}, {} bytes)", path, document.mime_type, document.bytes.len());
    println!("Identity: {}", document.identity);
    println!("Language: {} ({})", language, language.display_name());
    println!("Model: {}", config.model);
    println!();

    let client = OpenRouterClient::from_config(&config);
    let result = client
        .analyze(&document, &language, &Credential::none())
        .await
        .context("Analysis failed")?;

    println!("Classification: {}", result.classification);
    println!("Risk: {:?} ({}/100)", result.risk.level, result.risk.score);
    println!("Findings: {}", result.findings.len());
    println!();
    println!("{}", result.export_report(&language));

    Ok(())
}
