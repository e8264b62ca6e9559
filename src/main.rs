#![deny(clippy::all)]

mod agent;
mod client;
mod config;
mod conversation;
mod credentials;
mod encoder;
mod error;
mod gemini;
mod input;
mod prompts;
mod session;
mod terminal;
mod transcribe;

#[cfg(test)]
mod testing;

use anyhow::Context;
use credentials::CredentialProvider;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the transcript on stdout stays readable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!(error = %e, "Failed to load .env file");
        }
    }

    // Load configuration from embedded config.toml
    let config = config::load_config().context("Failed to load configuration")?;
    info!(model = %config.gemini.model, api_base = %config.gemini.api_base, "Configuration loaded");

    // The key is read on every session creation, so a missing key is only reported
    let credentials = Arc::new(credentials::EnvCredentials);
    match credentials.credentials() {
        Ok(_) => info!("Gemini API key found in environment"),
        Err(e) => warn!("{}", e),
    }

    let agent = agent::VisionAgent::new(&config, credentials)
        .context("Failed to initialize vision agent")?;

    let transcriber = transcribe::Transcriber::new(&config.transcription, &config.analysis)
        .context("Failed to initialize transcriber")?;

    terminal::run(agent, Arc::new(transcriber)).await.context("Terminal session failed")?;
    Ok(())
}
